//! Session descriptors exchanged by the subscription endpoints.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::offset::Offset;

/// How a session receives new records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// The consumer polls for batches and acknowledges them explicitly.
    #[default]
    LongPoll,
    /// The server POSTs batches to a callback URL; a 2xx reply acknowledges.
    Push,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::LongPoll => "long-poll",
            DeliveryMode::Push => "push",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long-poll" | "longpoll" => Ok(DeliveryMode::LongPoll),
            "push" | "fanout" => Ok(DeliveryMode::Push),
            other => Err(format!("Unknown delivery mode: {other}")),
        }
    }
}

/// Snapshot of one session, as returned by subscribe and discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project: String,
    pub stream: String,
    pub mode: DeliveryMode,
    /// Position just past the last acknowledged record.
    pub last_offset: Offset,
    /// Milliseconds left before the session is reclaimed without renewal.
    pub expires_in_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mode_parse() {
        assert_eq!("long-poll".parse(), Ok(DeliveryMode::LongPoll));
        assert_eq!("PUSH".parse(), Ok(DeliveryMode::Push));
        assert!("carrier-pigeon".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn test_session_info_json_shape() {
        let info = SessionInfo {
            id: "s1".to_string(),
            project: "acme".to_string(),
            stream: "orders".to_string(),
            mode: DeliveryMode::Push,
            last_offset: Offset::new(0, 3),
            expires_in_ms: 1500,
            callback: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["mode"], "push");
        assert_eq!(json["lastOffset"], "0_0000000000000003");
        assert_eq!(json["expiresInMs"], 1500);
        assert!(json.get("callback").is_none());
    }
}
