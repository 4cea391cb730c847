use serde::{Deserialize, Serialize};

/// Lifecycle status of a message. A derived projection of the state ledger,
/// persisted alongside it and updated atomically by the store transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    /// Created but not yet handed to a producer.
    Unpublished,
    /// Parked in the scheduled set, waiting for its fire time.
    Scheduled,
    /// In a pending structure, awaiting delivery.
    Pending,
    /// Checked out by a consumer, not yet resolved.
    Processing,
    /// Successfully consumed.
    Acknowledged,
    /// Terminal failure: retry threshold exhausted or TTL elapsed.
    DeadLettered,
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpublished" => Ok(MessageStatus::Unpublished),
            "scheduled" => Ok(MessageStatus::Scheduled),
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "acknowledged" => Ok(MessageStatus::Acknowledged),
            "dead-lettered" => Ok(MessageStatus::DeadLettered),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

impl MessageStatus {
    /// String form matching the persisted representation — the store
    /// scripts compare against these exact values.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Unpublished => "unpublished",
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::DeadLettered => "dead-lettered",
        }
    }
}

/// Why a message was unacknowledged. Timeout is a first-class reason, not a
/// generic error — it drives its own event payload and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnackReason {
    /// The handler returned or raised an error.
    HandlerError,
    /// The consume timeout elapsed before the handler resolved.
    Timeout,
    /// The message TTL had already elapsed when it reached the consumer.
    TtlExpired,
    /// The consumer shut down with the message still in processing.
    Offline,
}

impl UnackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnackReason::HandlerError => "handler-error",
            UnackReason::Timeout => "timeout",
            UnackReason::TtlExpired => "ttl-expired",
            UnackReason::Offline => "offline",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serde_matches_as_str() {
        for status in [
            MessageStatus::Unpublished,
            MessageStatus::Scheduled,
            MessageStatus::Pending,
            MessageStatus::Processing,
            MessageStatus::Acknowledged,
            MessageStatus::DeadLettered,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
