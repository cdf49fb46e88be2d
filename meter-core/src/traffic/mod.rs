//! Traffic accounting: the write-side buffer that absorbs deltas reported by
//! proxy nodes, and the reader that answers "usage so far this period".
//!
//! Each delta lands in two fast-store hashes for its hour bucket:
//!
//! * `traffic:usage:{resource_type}:{subscription}:{hour}` with fields `u`/`d`,
//!   read by [`UsageReader`] and left to expire after the counter TTL.
//! * `traffic:pending:{resource_type}:{resource}:{hour}` with fields
//!   `{subscription}:u`/`{subscription}:d`, indexed in the `traffic:pending` set
//!   and drained into durable hourly rows by [`TrafficBuffer::fold`].

use chrono::{DateTime, Utc};

use crate::durable::ResourceType;

mod buffer;
mod reader;

pub use buffer::{FoldReport, TrafficBuffer, TrafficBufferMetrics};
pub use reader::{UsageBreakdown, UsageReader};

pub const PENDING_SET_KEY: &str = "traffic:pending";
const USAGE_KEY_PREFIX: &str = "traffic:usage";
const PENDING_KEY_PREFIX: &str = "traffic:pending";
const UPLOAD_FIELD: &str = "u";
const DOWNLOAD_FIELD: &str = "d";

/// Bytes moved by one subscription through one resource since the last report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficDelta {
    pub subscription_id: i64,
    pub upload: u64,
    pub download: u64,
}

impl TrafficDelta {
    pub fn new(subscription_id: i64, upload: u64, download: u64) -> Self {
        Self {
            subscription_id,
            upload,
            download,
        }
    }

    /// Deltas without attribution or without bytes carry nothing to count.
    pub fn is_countable(&self) -> bool {
        self.subscription_id > 0 && (self.upload > 0 || self.download > 0)
    }
}

pub(crate) fn usage_key(
    resource_type: ResourceType,
    subscription_id: i64,
    hour: DateTime<Utc>,
) -> String {
    format!(
        "{USAGE_KEY_PREFIX}:{}:{subscription_id}:{}",
        resource_type.as_ref(),
        hour.timestamp()
    )
}

pub(crate) fn pending_key(resource_type: ResourceType, resource_id: i64, hour: DateTime<Utc>) -> String {
    format!(
        "{PENDING_KEY_PREFIX}:{}:{resource_id}:{}",
        resource_type.as_ref(),
        hour.timestamp()
    )
}

/// Inverse of [`pending_key`].
pub(crate) fn parse_pending_key(key: &str) -> Option<(ResourceType, i64, DateTime<Utc>)> {
    let rest = key.strip_prefix(PENDING_KEY_PREFIX)?.strip_prefix(':')?;
    let mut parts = rest.split(':');
    let resource_type = parts.next()?.parse::<ResourceType>().ok()?;
    let resource_id = parts.next()?.parse::<i64>().ok()?;
    let hour = DateTime::from_timestamp(parts.next()?.parse::<i64>().ok()?, 0)?;
    if parts.next().is_some() {
        return None;
    }
    Some((resource_type, resource_id, hour))
}

pub(crate) fn pending_field(subscription_id: i64, direction: &str) -> String {
    format!("{subscription_id}:{direction}")
}

/// Splits a pending-hash field into subscription and direction (`u`/`d`).
pub(crate) fn parse_pending_field(field: &str) -> Option<(i64, &str)> {
    let (subscription, direction) = field.split_once(':')?;
    let subscription_id = subscription.parse::<i64>().ok()?;
    match direction {
        UPLOAD_FIELD | DOWNLOAD_FIELD => Some((subscription_id, direction)),
        _ => None,
    }
}

pub(crate) fn saturating_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

pub(crate) fn parse_counter(raw: &str) -> u64 {
    raw.parse::<i64>()
        .ok()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pending_key_round_trip() {
        let hour = Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap();
        let key = pending_key(ResourceType::ForwardRule, 17, hour);
        assert_eq!(key, "traffic:pending:forward_rule:17:1737374400");
        assert_eq!(
            parse_pending_key(&key),
            Some((ResourceType::ForwardRule, 17, hour))
        );
        assert_eq!(parse_pending_key("traffic:pending:bogus:1:2"), None);
        assert_eq!(parse_pending_key(PENDING_SET_KEY), None);
    }

    #[test]
    fn test_pending_field_parsing() {
        assert_eq!(parse_pending_field("42:u"), Some((42, "u")));
        assert_eq!(parse_pending_field("42:x"), None);
        assert_eq!(parse_pending_field("abc:d"), None);
    }

    #[test]
    fn test_countable_deltas() {
        assert!(TrafficDelta::new(1, 0, 5).is_countable());
        assert!(!TrafficDelta::new(1, 0, 0).is_countable());
        assert!(!TrafficDelta::new(0, 10, 10).is_countable());
        assert!(!TrafficDelta::new(-3, 10, 10).is_countable());
    }
}
