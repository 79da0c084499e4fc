//! The analytics record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Timing and outcome of one dispatch attempt.
///
/// Exactly one of `status_code` and `error_kind` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub request_id: Uuid,
    /// Worker-scoped, strictly increasing in dispatch start order.
    pub sequence: u64,
    /// 1-based attempt number supplied by the caller.
    pub attempt: u32,
    pub worker_pid: u32,
    pub queue_duration_micros: u64,
    pub processing_duration_micros: u64,
    pub gc_duration_micros: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Wall-clock time the dispatch started.
    pub timestamp: DateTime<Utc>,
}

impl AnalyticsRecord {
    pub fn is_error(&self) -> bool {
        self.error_kind.is_some()
    }
}

/// Whole microseconds, rounded up, so any measurable elapsed time is at
/// least 1.
pub fn micros_ceil(duration: Duration) -> u64 {
    let nanos = duration.as_nanos();
    let micros = nanos.div_ceil(1_000);
    u64::try_from(micros).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_up() {
        assert_eq!(micros_ceil(Duration::ZERO), 0);
        assert_eq!(micros_ceil(Duration::from_nanos(1)), 1);
        assert_eq!(micros_ceil(Duration::from_nanos(1_000)), 1);
        assert_eq!(micros_ceil(Duration::from_nanos(1_001)), 2);
        assert_eq!(micros_ceil(Duration::from_millis(3)), 3_000);
    }

    #[test]
    fn success_record_omits_error_kind() {
        let record = AnalyticsRecord {
            request_id: Uuid::nil(),
            sequence: 1,
            attempt: 1,
            worker_pid: 10,
            queue_duration_micros: 5,
            processing_duration_micros: 20,
            gc_duration_micros: 0,
            status_code: Some(200),
            error_kind: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status_code"], 200);
        assert!(json.get("error_kind").is_none());
        assert!(!record.is_error());
    }
}
