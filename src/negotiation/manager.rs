//! Per-client bookkeeping of joined channels and their sessions
//!
//! A [`CallManager`] belongs to one relay connection. It keeps at most one
//! session per channel and routes relay frames to them; there is no process-wide
//! state, so independent managers (and independent channels within one
//! manager) never interfere.
//!
//! Membership changes end stale attempts: when the member a session talks to
//! leaves, the session is discarded. With auto-call, a member joining replaces
//! an offer nobody answered with a fresh one.

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::model::message::{ClientFrame, ConnectionId, ServerFrame, SignalKind};
use crate::negotiation::engine::EngineFactory;
use crate::negotiation::error::NegotiationError;
use crate::negotiation::session::{CallEvent, NegotiationState, Session, SessionContext};

pub struct CallManager<F: EngineFactory> {
    ctx: SessionContext<F>,
    joined: Mutex<HashSet<String>>,
    sessions: Mutex<HashMap<String, Session<F>>>,
    auto_call: bool,
}

impl<F: EngineFactory> CallManager<F> {
    pub fn new(ctx: SessionContext<F>) -> Self {
        Self {
            ctx,
            joined: Mutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
            auto_call: false,
        }
    }

    /// Calls whoever joins a joined channel.
    pub fn with_auto_call(mut self) -> Self {
        self.auto_call = true;
        self
    }

    pub fn local_id(&self) -> &ConnectionId {
        &self.ctx.local_id
    }

    pub async fn join(&self, channel: &str) -> Result<(), NegotiationError> {
        if !self.joined.lock().await.insert(channel.to_string()) {
            return Err(NegotiationError::AlreadyActive(channel.to_string()));
        }

        info!("Joining '{}'", channel);
        self.send(ClientFrame::Join {
            channel: channel.to_string(),
        })
    }

    /// Starts a call on a joined channel.
    pub async fn call(&self, channel: &str) -> Result<(), NegotiationError> {
        self.ensure_joined(channel).await?;

        let session = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(channel) {
                match existing.state().await {
                    // Idle sessions only hold early candidates.
                    NegotiationState::Idle | NegotiationState::Closed => {}
                    _ => return Err(NegotiationError::AlreadyActive(channel.to_string())),
                }
            }
            self.session_in(&mut sessions, channel).await
        };

        session.start().await
    }

    /// Starts a call on `channel`, replacing an offer that is still waiting
    /// for an answer. A call that is answering or connected is left alone.
    pub async fn redial(&self, channel: &str) -> Result<(), NegotiationError> {
        self.ensure_joined(channel).await?;

        let session = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(channel).cloned() {
                match existing.state().await {
                    NegotiationState::Idle | NegotiationState::Closed => {}
                    state if state.is_offering() => {
                        info!("Replacing unanswered offer on '{}'", channel);
                        existing.discard().await;
                    }
                    _ => return Err(NegotiationError::AlreadyActive(channel.to_string())),
                }
            }
            self.session_in(&mut sessions, channel).await
        };

        session.start().await
    }

    /// Ends the call on `channel` and leaves it.
    pub async fn hangup(&self, channel: &str) -> Result<(), NegotiationError> {
        if !self.joined.lock().await.remove(channel) {
            return Err(NegotiationError::NotJoined(channel.to_string()));
        }

        let session = self.sessions.lock().await.remove(channel);
        match session {
            Some(session) => session.hangup().await,
            None => self.send(ClientFrame::Leave {
                channel: channel.to_string(),
            }),
        }
    }

    /// Hangs up every joined channel.
    pub async fn hangup_all(&self) {
        let channels: Vec<String> = self.joined.lock().await.iter().cloned().collect();
        for channel in channels {
            let _ = self.hangup(&channel).await;
        }
    }

    pub async fn session(&self, channel: &str) -> Option<Session<F>> {
        self.sessions.lock().await.get(channel).cloned()
    }

    pub async fn session_state(&self, channel: &str) -> Option<NegotiationState> {
        match self.session(channel).await {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }

    /// Routes one frame from the relay.
    pub async fn handle_frame(&self, frame: ServerFrame) -> Result<(), NegotiationError> {
        if let Some(channel) = frame.channel() {
            if !self.joined.lock().await.contains(channel) {
                debug!("Ignoring frame for channel '{}' we did not join", channel);
                return Ok(());
            }
        }

        match frame {
            ServerFrame::Welcome { connection_id } => {
                debug!("Unexpected welcome for {}", connection_id.short());
                Ok(())
            }
            ServerFrame::MemberJoined { channel, member } => {
                info!("{} joined '{}'", member.short(), channel);
                self.notify(CallEvent::MemberJoined {
                    channel: channel.clone(),
                    member,
                });
                if !self.auto_call {
                    return Ok(());
                }
                match self.redial(&channel).await {
                    Err(NegotiationError::AlreadyActive(_)) => {
                        debug!("Call on '{}' already under way", channel);
                        Ok(())
                    }
                    other => other,
                }
            }
            ServerFrame::MemberLeft { channel, member } => {
                info!("{} left '{}'", member.short(), channel);
                self.drop_session_with(&channel, &member).await;
                self.notify(CallEvent::MemberLeft { channel, member });
                Ok(())
            }
            ServerFrame::Signal { from, message } => {
                debug!(
                    "Received {} from {} on '{}'",
                    message.kind,
                    from.short(),
                    message.channel
                );
                match message.kind {
                    SignalKind::Offer => {
                        let session = self.session_for(&message.channel).await;
                        session.receive_offer(&from, &message.payload).await
                    }
                    SignalKind::Answer => match self.session(&message.channel).await {
                        Some(session) => session.receive_answer(&message.payload).await,
                        None => {
                            debug!("No session on '{}' for answer", message.channel);
                            Ok(())
                        }
                    },
                    SignalKind::Candidate => {
                        let session = self.session_for(&message.channel).await;
                        session.receive_candidate(&message.payload).await
                    }
                }
            }
        }
    }

    /// Discards the session on `channel` if it was talking to `member`, or to
    /// nobody in particular yet.
    async fn drop_session_with(&self, channel: &str, member: &ConnectionId) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(channel) else {
                return;
            };
            match session.remote_peer().await {
                Some(peer) if peer != *member => return,
                _ => sessions.remove(channel),
            }
        };

        if let Some(session) = session {
            session.discard().await;
        }
    }

    async fn ensure_joined(&self, channel: &str) -> Result<(), NegotiationError> {
        if self.joined.lock().await.contains(channel) {
            Ok(())
        } else {
            Err(NegotiationError::NotJoined(channel.to_string()))
        }
    }

    /// The live session on `channel`, replacing a closed one.
    async fn session_for(&self, channel: &str) -> Session<F> {
        let mut sessions = self.sessions.lock().await;
        self.session_in(&mut sessions, channel).await
    }

    async fn session_in(
        &self,
        sessions: &mut HashMap<String, Session<F>>,
        channel: &str,
    ) -> Session<F> {
        if let Some(existing) = sessions.get(channel) {
            if !existing.is_closed().await {
                return existing.clone();
            }
        }

        debug!("New session on '{}'", channel);
        let session = Session::new(channel, self.ctx.clone());
        sessions.insert(channel.to_string(), session.clone());
        session
    }

    fn send(&self, frame: ClientFrame) -> Result<(), NegotiationError> {
        self.ctx
            .outbox
            .send(frame)
            .map_err(|_| NegotiationError::RelayGone)
    }

    fn notify(&self, event: CallEvent) {
        let _ = self.ctx.events.send(event);
    }
}
