use thiserror::Error;

use crate::model::description::SdpType;
use crate::model::message::SignalKind;
use crate::negotiation::session::NegotiationState;

/// Failure reported by a peer-connection engine.
#[derive(Debug, Clone, Error)]
#[error("{operation} failed: {reason}")]
pub struct EngineError {
    pub operation: &'static str,
    pub reason: String,
}

impl EngineError {
    pub fn new(operation: &'static str, reason: impl ToString) -> Self {
        Self {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// The capture device could not be opened.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("no capture device satisfies the constraints")]
    Unavailable,
    #[error("access to the capture device was denied")]
    Denied,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("channel '{0}' has not been joined")]
    NotJoined(String),

    #[error("a negotiation is already active on channel '{0}'")]
    AlreadyActive(String),

    #[error("engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("device error: {0}")]
    DeviceError(#[from] DeviceError),

    /// An engine call completed after the session was closed. Never returned
    /// from the public session operations.
    #[error("completion arrived after the session closed")]
    StaleCompletion,

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} message carried a {found:?} description")]
    DescriptionMismatch { kind: SignalKind, found: SdpType },

    /// The engine refused a remote candidate. The session stays usable.
    #[error("candidate rejected: {0}")]
    CandidateRejected(#[source] EngineError),

    #[error("unexpected {kind} while {state:?}")]
    UnexpectedMessage {
        state: NegotiationState,
        kind: SignalKind,
    },

    #[error("session is closed")]
    Closed,

    #[error("relay connection is gone")]
    RelayGone,
}

impl NegotiationError {
    /// Whether the error was reported by the engine or the capture device.
    pub fn from_engine(&self) -> bool {
        matches!(
            self,
            NegotiationError::EngineFailure(_)
                | NegotiationError::DeviceError(_)
                | NegotiationError::CandidateRejected(_)
        )
    }

    /// Whether the session must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NegotiationError::EngineFailure(_) | NegotiationError::DeviceError(_)
        )
    }
}
