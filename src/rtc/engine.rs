use std::net::SocketAddr;

use async_trait::async_trait;
use str0m::Rtc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::driver::{Command, Driver, Reply};
use crate::model::description::{IceCandidate, SessionDescription};
use crate::negotiation::engine::{
    EngineConfig, EngineEvent, EngineFactory, MediaHandle, PeerEngine,
};
use crate::negotiation::error::EngineError;
use crate::util::get_candidates;

/// Creates peer connections backed by `str0m`, gathering host candidates only.
#[derive(Debug, Default)]
pub struct Str0mFactory;

#[async_trait]
impl EngineFactory for Str0mFactory {
    type Engine = Str0mEngine;

    /// Binds a UDP socket on `config.bind_addr` and starts a peer connection
    /// on it.
    ///
    /// The host candidates of the socket are added to the `Rtc` and reported
    /// straight away as [`EngineEvent::LocalCandidate`]s, so they are the first
    /// events on the returned receiver. The `Rtc` then runs on its own task
    /// until [`PeerEngine::close`] is called or the engine handle is dropped.
    ///
    /// ## Returns
    ///
    /// * `Ok((engine, events))`: The handle for issuing negotiation calls and
    ///   the receiver for everything the connection reports.
    /// * `Err(EngineError)`: The socket could not be bound, or it has no usable
    ///   host candidate.
    async fn create_connection(
        &self,
        config: &EngineConfig,
    ) -> Result<(Str0mEngine, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| EngineError::new("create_connection", e))?;
        let local = socket
            .local_addr()
            .map_err(|e| EngineError::new("create_connection", e))?;

        let candidates = get_candidates(local);
        let Some(first) = candidates.first() else {
            return Err(EngineError::new(
                "create_connection",
                "no usable host candidate",
            ));
        };
        let destination: SocketAddr = first.addr();

        let mut rtc = Rtc::builder().build();
        let (events, events_rx) = mpsc::unbounded_channel();

        for candidate in candidates {
            let sdp = candidate.to_sdp_string();
            rtc.add_local_candidate(candidate);
            let _ = events.send(EngineEvent::LocalCandidate(IceCandidate::new(sdp)));
        }
        info!("Peer connection bound to {}", local);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(Driver::new(rtc, socket, destination, events).run(commands_rx));

        Ok((Str0mEngine { commands }, events_rx))
    }
}

/// Handle to a peer connection running on its own task.
pub struct Str0mEngine {
    commands: mpsc::UnboundedSender<Command>,
}

impl Str0mEngine {
    async fn request<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::new(operation, "connection closed"))?;
        response
            .await
            .map_err(|_| EngineError::new(operation, "connection closed"))?
    }
}

#[async_trait]
impl PeerEngine for Str0mEngine {
    async fn attach_media(&self, media: &MediaHandle) -> Result<(), EngineError> {
        let tracks = media.tracks.clone();
        self.request("attach_media", |reply| Command::AttachMedia(tracks, reply))
            .await
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.request("create_offer", Command::CreateOffer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.request("create_answer", Command::CreateAnswer).await
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let description = description.clone();
        self.request("set_local_description", |reply| {
            Command::SetLocal(description, reply)
        })
        .await
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        let description = description.clone();
        self.request("set_remote_description", |reply| {
            Command::SetRemote(description, reply)
        })
        .await
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let candidate = candidate.clone();
        self.request("add_candidate", |reply| Command::AddCandidate(candidate, reply))
            .await
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        self.request("rollback", Command::Rollback).await
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}
