use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Relay-assigned identifier of a single client connection.
///
/// Identifiers are totally ordered; the ordering is what breaks ties when both
/// members of a channel offer at the same time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn generate() -> Self {
        ConnectionId(Uuid::new_v4().to_string())
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Deref for ConnectionId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a relayed payload carries. The relay never looks at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// A negotiation message addressed to the other members of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub channel: String,
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalingMessage {
    pub fn new(channel: impl Into<String>, kind: SignalKind, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            kind,
            payload: payload.into(),
        }
    }
}

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        channel: String,
    },
    Leave {
        channel: String,
    },
    Signal {
        #[serde(flatten)]
        message: SignalingMessage,
    },
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame on every connection, carrying the id the relay assigned.
    Welcome { connection_id: ConnectionId },
    MemberJoined {
        channel: String,
        member: ConnectionId,
    },
    MemberLeft {
        channel: String,
        member: ConnectionId,
    },
    Signal {
        from: ConnectionId,
        #[serde(flatten)]
        message: SignalingMessage,
    },
}

impl ServerFrame {
    /// The channel this frame concerns, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            ServerFrame::Welcome { .. } => None,
            ServerFrame::MemberJoined { channel, .. } | ServerFrame::MemberLeft { channel, .. } => {
                Some(channel)
            }
            ServerFrame::Signal { message, .. } => Some(&message.channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_signal_frame_is_flat() {
        let frame = ClientFrame::Signal {
            message: SignalingMessage::new("room-42", SignalKind::Offer, "{}"),
        };
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "signal",
                "channel": "room-42",
                "kind": "offer",
                "payload": "{}"
            })
        );
    }

    #[test]
    fn server_frames_parse_from_text() {
        let text = r#"{"type":"signal","from":"abc","channel":"room-42","kind":"candidate","payload":"x"}"#;
        let frame: ServerFrame = serde_json::from_str(text).unwrap();

        assert_eq!(
            frame,
            ServerFrame::Signal {
                from: ConnectionId::new("abc"),
                message: SignalingMessage::new("room-42", SignalKind::Candidate, "x"),
            }
        );
        assert_eq!(frame.channel(), Some("room-42"));

        let welcome: ServerFrame =
            serde_json::from_str(r#"{"type":"welcome","connection_id":"abc"}"#).unwrap();
        assert_eq!(welcome.channel(), None);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let text = r#"{"type":"signal","channel":"c","kind":"bye","payload":""}"#;
        assert!(serde_json::from_str::<ClientFrame>(text).is_err());
    }

    #[test]
    fn connection_ids_order_lexicographically() {
        let a = ConnectionId::new("0a");
        let b = ConnectionId::new("0b");
        assert!(a < b);
        assert_eq!(ConnectionId::new("abcdefghij").short(), "abcdefgh");
    }
}
