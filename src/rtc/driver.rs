use std::net::SocketAddr;
use std::time::Instant;

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::model::description::{IceCandidate, SdpType, SessionDescription};
use crate::negotiation::engine::{ConnectionState, EngineEvent, RemoteStream, TrackKind};
use crate::negotiation::error::EngineError;

pub(super) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

pub(super) enum Command {
    AttachMedia(Vec<TrackKind>, Reply<()>),
    CreateOffer(Reply<SessionDescription>),
    CreateAnswer(Reply<SessionDescription>),
    SetLocal(SessionDescription, Reply<()>),
    SetRemote(SessionDescription, Reply<()>),
    AddCandidate(IceCandidate, Reply<()>),
    Rollback(Reply<()>),
    Close,
}

/// Owns one `Rtc` and the UDP socket it talks over.
pub(super) struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    /// Address incoming datagrams are reported as arriving on.
    destination: SocketAddr,
    events: mpsc::UnboundedSender<EngineEvent>,
    tracks: Vec<TrackKind>,
    pending: Option<SdpPendingOffer>,
    local_offer: Option<String>,
    remote_offer: Option<SdpOffer>,
    local_answer: Option<String>,
}

impl Driver {
    pub(super) fn new(
        rtc: Rtc,
        socket: UdpSocket,
        destination: SocketAddr,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            rtc,
            socket,
            destination,
            events,
            tracks: vec![],
            pending: None,
            local_offer: None,
            remote_offer: None,
            local_answer: None,
        }
    }

    /// Runs until closed, the command side is dropped, or the `Rtc` dies.
    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0; 2000];

        loop {
            let Some(timeout) = self.poll_until_timeout() else {
                break;
            };
            let wait = timeout.saturating_duration_since(Instant::now());

            // Scale up buffer to receive an entire UDP packet.
            buf.resize(2000, 0);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => {
                        let Ok(contents) = buf[..n].try_into() else {
                            debug!("Ignoring unrecognised datagram from {}", source);
                            continue;
                        };
                        let input = Input::Receive(
                            Instant::now(),
                            Receive {
                                proto: Protocol::Udp,
                                source,
                                destination: self.destination,
                                contents,
                            },
                        );
                        self.handle_input(input);
                    }
                    Err(e) => warn!("UdpSocket read failed: {}", e),
                },
                _ = tokio::time::sleep(wait) => {
                    self.handle_input(Input::Timeout(Instant::now()));
                }
            }
        }

        self.rtc.disconnect();
        self.emit(EngineEvent::ConnectionStateChange(ConnectionState::Closed));
        debug!("Peer connection on {} stopped", self.destination);
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer connection failed: {:?}", e);
            self.rtc.disconnect();
            self.emit(EngineEvent::ConnectionStateChange(ConnectionState::Failed));
        }
    }

    /// Transmits and forwards output until the `Rtc` asks to be woken later.
    /// Returns `None` once it is no longer alive.
    fn poll_until_timeout(&mut self) -> Option<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return None;
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        debug!("Dropped datagram to {}: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                    self.emit(EngineEvent::ConnectionStateChange(ConnectionState::Failed));
                    return None;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE state: {:?}", state);
                let state = match state {
                    IceConnectionState::New => ConnectionState::New,
                    IceConnectionState::Checking => ConnectionState::Checking,
                    IceConnectionState::Connected => ConnectionState::Connected,
                    IceConnectionState::Completed => ConnectionState::Completed,
                    IceConnectionState::Disconnected => ConnectionState::Disconnected,
                };
                self.emit(EngineEvent::ConnectionStateChange(state));
            }
            Event::MediaAdded(added) => {
                let kind = match added.kind {
                    MediaKind::Audio => TrackKind::Audio,
                    MediaKind::Video => TrackKind::Video,
                };
                info!("Remote {:?} media added on mid {}", kind, added.mid);
                self.emit(EngineEvent::RemoteStreamReady(RemoteStream {
                    id: added.mid.to_string(),
                    kind,
                }));
            }
            other => debug!("Event: {:?}", other),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AttachMedia(tracks, reply) => {
                self.tracks = tracks;
                let _ = reply.send(Ok(()));
            }
            Command::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer());
            }
            Command::CreateAnswer(reply) => {
                let _ = reply.send(self.create_answer());
            }
            Command::SetLocal(description, reply) => {
                let _ = reply.send(self.set_local(&description));
            }
            Command::SetRemote(description, reply) => {
                let _ = reply.send(self.set_remote(&description));
            }
            Command::AddCandidate(candidate, reply) => {
                let _ = reply.send(self.add_candidate(&candidate));
            }
            Command::Rollback(reply) => {
                if self.pending.take().is_some() {
                    debug!("Rolled back unanswered local offer");
                }
                self.local_offer = None;
                let _ = reply.send(Ok(()));
            }
            // Handled by the run loop.
            Command::Close => {}
        }
    }

    fn create_offer(&mut self) -> Result<SessionDescription, EngineError> {
        if self.pending.is_some() {
            return Err(EngineError::new("create_offer", "an offer is already pending"));
        }

        let mut change = self.rtc.sdp_api();
        if self.tracks.is_empty() {
            change.add_media(MediaKind::Video, Direction::RecvOnly, None, None, None);
        }
        for track in &self.tracks {
            let kind = match track {
                TrackKind::Audio => MediaKind::Audio,
                TrackKind::Video => MediaKind::Video,
            };
            change.add_media(kind, Direction::SendRecv, None, None, None);
        }

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| EngineError::new("create_offer", "nothing to offer"))?;
        self.pending = Some(pending);

        let sdp = offer.to_sdp_string();
        self.local_offer = Some(sdp.clone());
        Ok(SessionDescription::offer(sdp))
    }

    fn create_answer(&mut self) -> Result<SessionDescription, EngineError> {
        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| EngineError::new("create_answer", "no remote offer"))?;

        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| EngineError::new("create_answer", e))?;

        let sdp = answer.to_sdp_string();
        self.local_answer = Some(sdp.clone());
        Ok(SessionDescription::answer(sdp))
    }

    /// `str0m` applies its own descriptions when creating them, so this only
    /// checks the description is the one it produced.
    fn set_local(&mut self, description: &SessionDescription) -> Result<(), EngineError> {
        let produced = match description.sdp_type {
            SdpType::Offer => self.local_offer.as_deref(),
            SdpType::Answer => self.local_answer.as_deref(),
        };
        if produced == Some(description.sdp.as_str()) {
            Ok(())
        } else {
            Err(EngineError::new(
                "set_local_description",
                format!("{:?} was not produced by this connection", description.sdp_type),
            ))
        }
    }

    fn set_remote(&mut self, description: &SessionDescription) -> Result<(), EngineError> {
        match description.sdp_type {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&description.sdp)
                    .map_err(|e| EngineError::new("set_remote_description", e))?;
                self.remote_offer = Some(offer);
                Ok(())
            }
            SdpType::Answer => {
                let pending = self.pending.take().ok_or_else(|| {
                    EngineError::new("set_remote_description", "no offer awaiting an answer")
                })?;
                let answer = SdpAnswer::from_sdp_string(&description.sdp)
                    .map_err(|e| EngineError::new("set_remote_description", e))?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| EngineError::new("set_remote_description", e))
            }
        }
    }

    fn add_candidate(&mut self, candidate: &IceCandidate) -> Result<(), EngineError> {
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| EngineError::new("add_candidate", e))?;
        self.rtc.add_remote_candidate(parsed);
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
