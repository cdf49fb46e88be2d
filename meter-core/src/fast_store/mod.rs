//! Low-latency key-value store used as the speed layer.
//!
//! Every component talks to the store through [`FastStore::pipeline`], which
//! executes a list of [`Command`]s as a single round trip. On Redis the
//! pipeline is wrapped in `MULTI`/`EXEC`, so the commands of one call are
//! applied atomically with respect to other clients. `EXEC` does not roll
//! back: when one command fails at run time (a `WRONGTYPE`, say) the others
//! still take effect and the call reports the first failure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, ErrorDetails, IMPOSSIBLE_ERROR_MESSAGE};

pub mod memory;
pub mod redis_store;

pub use memory::MemoryFastStore;
pub use redis_store::RedisFastStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get {
        key: String,
    },
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    /// Replaces the value of an existing key without touching its expiry.
    /// Replies `Int(0)` and writes nothing when the key is absent.
    SetKeepTtl {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HGetAll {
        key: String,
    },
    HIncrBy {
        key: String,
        field: String,
        delta: i64,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    SMembers {
        key: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Removes members scored at or below `max`.
    ZRemRangeByScore {
        key: String,
        max: f64,
    },
    ZCard {
        key: String,
    },
    /// Members scored strictly above `min`.
    ZRangeByScore {
        key: String,
        min: f64,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::SetEx { .. } => "SETEX",
            Command::SetKeepTtl { .. } => "SET_KEEPTTL",
            Command::Del { .. } => "DEL",
            Command::Expire { .. } => "EXPIRE",
            Command::HSet { .. } => "HSET",
            Command::HGetAll { .. } => "HGETALL",
            Command::HIncrBy { .. } => "HINCRBY",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZCard { .. } => "ZCARD",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Str(String),
    Hash(HashMap<String, String>),
    Members(Vec<String>),
}

impl Reply {
    pub fn into_int(self) -> Result<i64, Error> {
        match self {
            Reply::Int(value) => Ok(value),
            Reply::Nil => Ok(0),
            other => Err(unexpected_reply("integer", &other)),
        }
    }

    pub fn into_opt_string(self) -> Result<Option<String>, Error> {
        match self {
            Reply::Str(value) => Ok(Some(value)),
            Reply::Nil => Ok(None),
            other => Err(unexpected_reply("string", &other)),
        }
    }

    pub fn into_hash(self) -> Result<HashMap<String, String>, Error> {
        match self {
            Reply::Hash(value) => Ok(value),
            Reply::Nil => Ok(HashMap::new()),
            other => Err(unexpected_reply("hash", &other)),
        }
    }

    pub fn into_members(self) -> Result<Vec<String>, Error> {
        match self {
            Reply::Members(value) => Ok(value),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected_reply("member list", &other)),
        }
    }
}

fn unexpected_reply(expected: &str, got: &Reply) -> Error {
    Error::new(ErrorDetails::InternalError {
        message: format!("Expected {expected} reply from fast store, got {got:?}"),
    })
}

#[async_trait]
pub trait FastStore: Send + Sync {
    /// Executes `commands` in one round trip; replies are returned in order.
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, Error>;

    async fn execute(&self, command: Command) -> Result<Reply, Error> {
        let mut replies = self.pipeline(std::slice::from_ref(&command)).await?;
        replies.pop().ok_or_else(|| {
            Error::new(ErrorDetails::InternalError {
                message: format!(
                    "Fast store returned no reply for {}. {IMPOSSIBLE_ERROR_MESSAGE}",
                    command.name()
                ),
            })
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.execute(Command::Get {
            key: key.to_string(),
        })
        .await?
        .into_opt_string()
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), Error> {
        self.execute(Command::SetEx {
            key: key.to_string(),
            value,
            ttl,
        })
        .await?;
        Ok(())
    }

    /// Returns `false` if `key` no longer exists.
    async fn set_keep_ttl(&self, key: &str, value: String) -> Result<bool, Error> {
        let replaced = self
            .execute(Command::SetKeepTtl {
                key: key.to_string(),
                value,
            })
            .await?
            .into_int()?;
        Ok(replaced == 1)
    }

    async fn del(&self, key: &str) -> Result<(), Error> {
        self.execute(Command::Del {
            key: key.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        self.execute(Command::HGetAll {
            key: key.to_string(),
        })
        .await?
        .into_hash()
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        self.execute(Command::SMembers {
            key: key.to_string(),
        })
        .await?
        .into_members()
    }
}

/// Redis sorted-set scores are doubles; whole seconds are exact well past year 2100.
pub fn unix_score(ts: chrono::DateTime<chrono::Utc>) -> f64 {
    ts.timestamp() as f64
}
