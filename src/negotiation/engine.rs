//! Collaborator interfaces driven by a negotiation session
//!
//! A session never talks to a concrete WebRTC stack or capture device. It goes
//! through these traits, so the same state machine runs against the `str0m`
//! engine in [`crate::rtc`] and against the mocks in the tests.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::model::description::{IceCandidate, SessionDescription};
use crate::negotiation::error::{DeviceError, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Local media acquired from a capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub tracks: Vec<TrackKind>,
}

/// Remote media announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteStreamReady(RemoteStream),
    ConnectionStateChange(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Local address the engine binds its media socket to.
    pub bind_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync + 'static {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, DeviceError>;

    fn release(&self, handle: MediaHandle);
}

/// One native peer connection.
///
/// Every method may suspend; callers must await each call before issuing the
/// next one on the same connection.
#[async_trait]
pub trait PeerEngine: Send + Sync + 'static {
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: &SessionDescription)
        -> Result<(), EngineError>;

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    /// Discards a local offer that has not been answered yet.
    async fn rollback(&self) -> Result<(), EngineError>;

    fn close(&self);
}

#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    type Engine: PeerEngine;

    async fn create_connection(
        &self,
        config: &EngineConfig,
    ) -> Result<(Self::Engine, mpsc::UnboundedReceiver<EngineEvent>), EngineError>;
}
