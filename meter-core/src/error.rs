use std::fmt::{Debug, Display};

use tokio::sync::OnceCell;

/// Controls whether error values are rendered with their `Debug` representation.
///
/// WARNING: enabling this includes raw backend messages (which may carry
/// connection details) in logs.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

pub const IMPOSSIBLE_ERROR_MESSAGE: &str =
    "This should never happen, please file a bug report with the metering service maintainers";

/// Chooses between a `Debug` or `Display` representation based on the process-level `DEBUG` flag.
pub struct DisplayOrDebug<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebug<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebug<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *DEBUG.get().unwrap_or(&false) {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Backend failures that a caller may reasonably retry or degrade around.
    pub fn is_transient(&self) -> bool {
        matches!(
            *self.0,
            ErrorDetails::FastStore { .. }
                | ErrorDetails::FastStoreTimeout { .. }
                | ErrorDetails::Database { .. }
                | ErrorDetails::DatabaseTimeout { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::new(ErrorDetails::FastStore {
            message: DisplayOrDebug::new(err).to_string(),
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::new(ErrorDetails::Database {
            message: DisplayOrDebug::new(err).to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    FastStore {
        message: String,
    },
    FastStoreTimeout {
        operation: String,
        timeout_ms: u64,
    },
    Database {
        message: String,
    },
    DatabaseTimeout {
        operation: String,
        timeout_ms: u64,
    },
    Serialization {
        message: String,
    },
    InvalidCron {
        expression: String,
        message: String,
    },
    InvalidTimezone {
        name: String,
    },
    JobFailed {
        job: String,
        message: String,
    },
    JobTimeout {
        job: String,
        timeout_ms: u64,
    },
    /// Abandoned because the scheduler was forced to stop. Not a failure.
    JobCancelled {
        job: String,
    },
    JobNotFound {
        job: String,
    },
    SchedulerState {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::FastStore { .. } => tracing::Level::WARN,
            ErrorDetails::FastStoreTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::Database { .. } => tracing::Level::ERROR,
            ErrorDetails::DatabaseTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidCron { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidTimezone { .. } => tracing::Level::ERROR,
            ErrorDetails::JobFailed { .. } => tracing::Level::ERROR,
            ErrorDetails::JobTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::JobCancelled { .. } => tracing::Level::INFO,
            ErrorDetails::JobNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::SchedulerState { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
        }
    }

    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::FastStore { message } => write!(f, "Fast store error: {message}"),
            ErrorDetails::FastStoreTimeout {
                operation,
                timeout_ms,
            } => write!(
                f,
                "Fast store operation `{operation}` timed out after {timeout_ms}ms"
            ),
            ErrorDetails::Database { message } => write!(f, "Database error: {message}"),
            ErrorDetails::DatabaseTimeout {
                operation,
                timeout_ms,
            } => write!(
                f,
                "Database operation `{operation}` timed out after {timeout_ms}ms"
            ),
            ErrorDetails::Serialization { message } => {
                write!(f, "Failed to (de)serialize cached value: {message}")
            }
            ErrorDetails::InvalidCron {
                expression,
                message,
            } => write!(f, "Invalid cron expression `{expression}`: {message}"),
            ErrorDetails::InvalidTimezone { name } => {
                write!(f, "Unknown timezone `{name}`. Use an IANA name such as `Asia/Shanghai`")
            }
            ErrorDetails::JobFailed { job, message } => {
                write!(f, "Job `{job}` failed: {message}")
            }
            ErrorDetails::JobTimeout { job, timeout_ms } => {
                write!(f, "Job `{job}` exceeded its deadline of {timeout_ms}ms")
            }
            ErrorDetails::JobCancelled { job } => {
                write!(f, "Job `{job}` was cancelled by shutdown")
            }
            ErrorDetails::JobNotFound { job } => write!(f, "No job named `{job}` is registered"),
            ErrorDetails::SchedulerState { message } => write!(f, "Scheduler: {message}"),
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}. {IMPOSSIBLE_ERROR_MESSAGE}")
            }
        }
    }
}
