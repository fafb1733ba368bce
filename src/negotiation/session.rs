//! Negotiation state machine for one call attempt on one channel
//!
//! A [`Session`] is a cheap handle around shared state. Transitions (start,
//! incoming offer/answer/candidate) are serialized by an operation lock and
//! await the engine without holding the state lock. Hangup skips the operation
//! lock, so it can close the session while an engine call is outstanding; every
//! completion re-checks liveness afterwards and is discarded once the session is
//! closed.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::model::description::{IceCandidate, SdpType, SessionDescription};
use crate::model::message::{ClientFrame, ConnectionId, SignalKind, SignalingMessage};
use crate::negotiation::candidates::CandidateQueue;
use crate::negotiation::engine::{
    ConnectionState, EngineConfig, EngineEvent, EngineFactory, MediaConstraints, MediaHandle,
    MediaSource, PeerEngine, RemoteStream,
};
use crate::negotiation::error::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    LocalOfferSet,
    AwaitingAnswer,
    RemoteOfferReceived,
    Answering,
    LocalAnswerSet,
    Connected,
    Closed,
}

impl NegotiationState {
    /// Whether a local offer is being made or awaits its answer.
    pub fn is_offering(self) -> bool {
        matches!(
            self,
            NegotiationState::Offering
                | NegotiationState::LocalOfferSet
                | NegotiationState::AwaitingAnswer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undetermined,
    Offerer,
    Answerer,
}

/// Notifications for whoever owns the sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        channel: String,
        state: NegotiationState,
    },
    RemoteStream {
        channel: String,
        stream: RemoteStream,
    },
    ConnectionState {
        channel: String,
        state: ConnectionState,
    },
    MemberJoined {
        channel: String,
        member: ConnectionId,
    },
    MemberLeft {
        channel: String,
        member: ConnectionId,
    },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub engine: EngineConfig,
    pub constraints: MediaConstraints,
    pub candidate_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            constraints: MediaConstraints::default(),
            candidate_capacity: 64,
        }
    }
}

/// Everything a session needs from its owner, shared by all sessions of one
/// client.
pub struct SessionContext<F: EngineFactory> {
    pub local_id: ConnectionId,
    pub factory: Arc<F>,
    pub media: Arc<dyn MediaSource>,
    pub config: SessionConfig,
    pub outbox: mpsc::UnboundedSender<ClientFrame>,
    pub events: mpsc::UnboundedSender<CallEvent>,
}

impl<F: EngineFactory> Clone for SessionContext<F> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id.clone(),
            factory: self.factory.clone(),
            media: self.media.clone(),
            config: self.config.clone(),
            outbox: self.outbox.clone(),
            events: self.events.clone(),
        }
    }
}

struct Inner<E> {
    state: NegotiationState,
    role: Role,
    engine: Option<Arc<E>>,
    local_media: Option<MediaHandle>,
    remote_peer: Option<ConnectionId>,
    remote_description_set: bool,
    remote_candidates: CandidateQueue,
    remote_stream: Option<RemoteStream>,
}

struct Shared<F: EngineFactory> {
    channel: String,
    ctx: SessionContext<F>,
    op: Mutex<()>,
    inner: Mutex<Inner<F::Engine>>,
}

pub struct Session<F: EngineFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: EngineFactory> Clone for Session<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: EngineFactory> Session<F> {
    pub fn new(channel: impl Into<String>, ctx: SessionContext<F>) -> Self {
        let capacity = ctx.config.candidate_capacity;
        Self {
            shared: Arc::new(Shared {
                channel: channel.into(),
                ctx,
                op: Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: NegotiationState::Idle,
                    role: Role::Undetermined,
                    engine: None,
                    local_media: None,
                    remote_peer: None,
                    remote_description_set: false,
                    remote_candidates: CandidateQueue::new(capacity),
                    remote_stream: None,
                }),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub async fn state(&self) -> NegotiationState {
        self.lock().await.state
    }

    pub async fn role(&self) -> Role {
        self.lock().await.role
    }

    pub async fn remote_peer(&self) -> Option<ConnectionId> {
        self.lock().await.remote_peer.clone()
    }

    pub async fn remote_stream(&self) -> Option<RemoteStream> {
        self.lock().await.remote_stream.clone()
    }

    pub async fn queued_candidates(&self) -> usize {
        self.lock().await.remote_candidates.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state().await == NegotiationState::Closed
    }

    /// Begins negotiating as the offerer.
    pub async fn start(&self) -> Result<(), NegotiationError> {
        let _op = self.shared.op.lock().await;
        let result = self.start_inner().await;
        self.settle(result).await
    }

    /// Handles an offer relayed from `from`.
    pub async fn receive_offer(
        &self,
        from: &ConnectionId,
        payload: &str,
    ) -> Result<(), NegotiationError> {
        let _op = self.shared.op.lock().await;
        let result = self.receive_offer_inner(from, payload).await;
        self.settle(result).await
    }

    pub async fn receive_answer(&self, payload: &str) -> Result<(), NegotiationError> {
        let _op = self.shared.op.lock().await;
        let result = self.receive_answer_inner(payload).await;
        self.settle(result).await
    }

    pub async fn receive_candidate(&self, payload: &str) -> Result<(), NegotiationError> {
        let _op = self.shared.op.lock().await;
        let result = self.receive_candidate_inner(payload).await;
        self.settle(result).await
    }

    /// Tears the session down and leaves the channel. Valid in every state and
    /// safe while another operation is waiting on the engine.
    pub async fn hangup(&self) -> Result<(), NegotiationError> {
        info!("Hanging up on '{}'", self.shared.channel);
        self.close(true).await;
        Ok(())
    }

    /// Tears the session down but stays in the channel, for when the remote
    /// side is gone or a fresh attempt replaces this one.
    pub async fn discard(&self) {
        debug!("Discarding session on '{}'", self.shared.channel);
        self.close(false).await;
    }

    async fn start_inner(&self) -> Result<(), NegotiationError> {
        {
            let mut inner = self.lock().await;
            match inner.state {
                NegotiationState::Idle => {}
                NegotiationState::Closed => return Err(NegotiationError::Closed),
                _ => return Err(NegotiationError::AlreadyActive(self.shared.channel.clone())),
            }
            inner.role = Role::Offerer;
            self.transition(&mut inner, NegotiationState::Offering);
        }

        let engine = self.ensure_engine().await?;

        let offer = engine.create_offer().await?;
        self.check_open().await?;

        engine.set_local_description(&offer).await?;
        let mut inner = self.live().await?;
        self.transition(&mut inner, NegotiationState::LocalOfferSet);

        // Committed locally above, only now is it advertised.
        self.emit(SignalKind::Offer, encode_description(&offer, SignalKind::Offer)?)?;
        self.transition(&mut inner, NegotiationState::AwaitingAnswer);

        Ok(())
    }

    async fn receive_offer_inner(
        &self,
        from: &ConnectionId,
        payload: &str,
    ) -> Result<(), NegotiationError> {
        let offer = decode_description(payload, SignalKind::Offer)?;

        let rollback = {
            let mut inner = self.lock().await;
            let rollback = match inner.state {
                NegotiationState::Idle => false,
                state if state.is_offering() => {
                    if self.shared.ctx.local_id < *from {
                        info!(
                            "Glare on '{}': keeping our offer, ignoring offer from {}",
                            self.shared.channel,
                            from.short()
                        );
                        return Ok(());
                    }
                    info!(
                        "Glare on '{}': yielding to offer from {}",
                        self.shared.channel,
                        from.short()
                    );
                    true
                }
                NegotiationState::Closed => return Err(NegotiationError::Closed),
                state => {
                    return Err(NegotiationError::UnexpectedMessage {
                        state,
                        kind: SignalKind::Offer,
                    })
                }
            };

            inner.role = Role::Answerer;
            inner.remote_peer = Some(from.clone());
            self.transition(&mut inner, NegotiationState::RemoteOfferReceived);
            rollback
        };

        if rollback {
            if let Some(engine) = self.engine().await {
                engine.rollback().await?;
                self.check_open().await?;
            }
        }

        let engine = self.ensure_engine().await?;

        engine.set_remote_description(&offer).await?;
        {
            let mut inner = self.live().await?;
            inner.remote_description_set = true;
            self.transition(&mut inner, NegotiationState::Answering);
        }
        self.flush_candidates(&engine).await?;

        let answer = engine.create_answer().await?;
        self.check_open().await?;

        engine.set_local_description(&answer).await?;
        let mut inner = self.live().await?;
        self.transition(&mut inner, NegotiationState::LocalAnswerSet);
        self.emit(
            SignalKind::Answer,
            encode_description(&answer, SignalKind::Answer)?,
        )?;

        if inner.remote_stream.is_some() {
            self.transition(&mut inner, NegotiationState::Connected);
        }

        Ok(())
    }

    async fn receive_answer_inner(&self, payload: &str) -> Result<(), NegotiationError> {
        let answer = decode_description(payload, SignalKind::Answer)?;

        let engine = {
            let inner = self.lock().await;
            match (inner.state, inner.engine.clone()) {
                (NegotiationState::AwaitingAnswer, Some(engine)) => engine,
                (NegotiationState::Closed, _) => return Err(NegotiationError::Closed),
                (state, _) => {
                    return Err(NegotiationError::UnexpectedMessage {
                        state,
                        kind: SignalKind::Answer,
                    })
                }
            }
        };

        engine.set_remote_description(&answer).await?;
        {
            let mut inner = self.live().await?;
            inner.remote_description_set = true;
            self.transition(&mut inner, NegotiationState::Connected);
        }

        self.flush_candidates(&engine).await
    }

    async fn receive_candidate_inner(&self, payload: &str) -> Result<(), NegotiationError> {
        let candidate = IceCandidate::from_payload(payload).map_err(|source| {
            NegotiationError::MalformedPayload {
                kind: SignalKind::Candidate,
                source,
            }
        })?;

        let engine = {
            let mut inner = self.lock().await;
            if inner.state == NegotiationState::Closed {
                return Err(NegotiationError::Closed);
            }
            match inner.engine.clone() {
                Some(engine) if inner.remote_description_set => engine,
                _ => {
                    debug!(
                        "Queueing early candidate on '{}' ({:?})",
                        self.shared.channel, inner.state
                    );
                    inner.remote_candidates.push(candidate);
                    return Ok(());
                }
            }
        };

        engine
            .add_candidate(&candidate)
            .await
            .map_err(NegotiationError::CandidateRejected)?;
        self.check_open().await
    }

    /// Applies queued remote candidates in arrival order. A rejected candidate
    /// does not stop the others.
    async fn flush_candidates(&self, engine: &Arc<F::Engine>) -> Result<(), NegotiationError> {
        let queued = self.lock().await.remote_candidates.drain();
        if !queued.is_empty() {
            debug!(
                "Replaying {} queued candidate(s) on '{}'",
                queued.len(),
                self.shared.channel
            );
        }

        for candidate in queued {
            if let Err(e) = engine.add_candidate(&candidate).await {
                warn!("Queued candidate rejected on '{}': {}", self.shared.channel, e);
            }
            self.check_open().await?;
        }

        Ok(())
    }

    /// Returns the session's engine, creating it (with local media attached)
    /// on first use.
    async fn ensure_engine(&self) -> Result<Arc<F::Engine>, NegotiationError> {
        if let Some(engine) = self.engine().await {
            return Ok(engine);
        }

        let ctx = &self.shared.ctx;
        let media = ctx.media.acquire(&ctx.config.constraints).await?;
        {
            let mut inner = self.lock().await;
            if inner.state == NegotiationState::Closed {
                ctx.media.release(media);
                return Err(NegotiationError::StaleCompletion);
            }
            inner.local_media = Some(media.clone());
        }

        let (engine, events) = ctx.factory.create_connection(&ctx.config.engine).await?;
        let engine = Arc::new(engine);
        {
            let mut inner = self.lock().await;
            if inner.state == NegotiationState::Closed {
                engine.close();
                return Err(NegotiationError::StaleCompletion);
            }
            inner.engine = Some(engine.clone());
        }
        info!("Created peer connection for '{}'", self.shared.channel);

        tokio::spawn(pump_events(self.clone(), events));

        engine.attach_media(&media).await?;
        self.check_open().await?;

        Ok(engine)
    }

    async fn on_engine_event(&self, event: EngineEvent) {
        let mut inner = self.lock().await;
        if inner.state == NegotiationState::Closed {
            debug!("Dropping engine event on closed '{}'", self.shared.channel);
            return;
        }

        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let payload = match candidate.to_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Unable to encode local candidate: {}", e);
                        return;
                    }
                };
                if self.emit(SignalKind::Candidate, payload).is_err() {
                    warn!("Relay gone, local candidate not sent");
                }
            }
            EngineEvent::RemoteStreamReady(stream) => {
                info!(
                    "Remote stream {} ready on '{}'",
                    stream.id, self.shared.channel
                );
                inner.remote_stream = Some(stream.clone());
                self.notify(CallEvent::RemoteStream {
                    channel: self.shared.channel.clone(),
                    stream,
                });
                if inner.state == NegotiationState::LocalAnswerSet {
                    self.transition(&mut inner, NegotiationState::Connected);
                }
            }
            EngineEvent::ConnectionStateChange(state) => {
                info!("Connection state on '{}': {:?}", self.shared.channel, state);
                self.notify(CallEvent::ConnectionState {
                    channel: self.shared.channel.clone(),
                    state,
                });
                if state == ConnectionState::Failed {
                    warn!("Peer connection failed on '{}'", self.shared.channel);
                    drop(inner);
                    self.close(false).await;
                }
            }
        }
    }

    /// Moves the session to `Closed` and releases the engine and media. Only
    /// the first call tears down; `leave` is honoured every time.
    async fn close(&self, leave: bool) {
        let (engine, media) = {
            let mut inner = self.lock().await;
            if leave {
                let _ = self.shared.ctx.outbox.send(ClientFrame::Leave {
                    channel: self.shared.channel.clone(),
                });
            }
            if inner.state == NegotiationState::Closed {
                return;
            }
            self.transition(&mut inner, NegotiationState::Closed);
            inner.remote_candidates.drain();
            (inner.engine.take(), inner.local_media.take())
        };

        if let Some(engine) = engine {
            engine.close();
        }
        if let Some(media) = media {
            self.shared.ctx.media.release(media);
        }
    }

    /// Maps an operation result to what the caller sees: stale completions
    /// (successful or failed) vanish and fatal failures close the session.
    async fn settle(&self, result: Result<(), NegotiationError>) -> Result<(), NegotiationError> {
        // A pending engine call may be rejected because hangup closed it.
        let rejected_after_close = match &result {
            Err(e) if e.from_engine() => self.is_closed().await,
            _ => false,
        };

        match result {
            Err(NegotiationError::StaleCompletion) => {
                debug!(
                    "Discarding completion on closed '{}'",
                    self.shared.channel
                );
                Ok(())
            }
            Err(e) if rejected_after_close => {
                debug!(
                    "Discarding failed completion on closed '{}': {}",
                    self.shared.channel, e
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                warn!("Negotiation on '{}' failed: {}", self.shared.channel, e);
                self.close(false).await;
                Err(e)
            }
            other => other,
        }
    }

    fn transition(&self, inner: &mut Inner<F::Engine>, state: NegotiationState) {
        if inner.state == state {
            return;
        }
        debug!(
            "'{}': {:?} -> {:?}",
            self.shared.channel, inner.state, state
        );
        inner.state = state;
        self.notify(CallEvent::StateChanged {
            channel: self.shared.channel.clone(),
            state,
        });
    }

    fn emit(&self, kind: SignalKind, payload: String) -> Result<(), NegotiationError> {
        self.shared
            .ctx
            .outbox
            .send(ClientFrame::Signal {
                message: SignalingMessage::new(self.shared.channel.clone(), kind, payload),
            })
            .map_err(|_| NegotiationError::RelayGone)
    }

    fn notify(&self, event: CallEvent) {
        let _ = self.shared.ctx.events.send(event);
    }

    async fn engine(&self) -> Option<Arc<F::Engine>> {
        self.lock().await.engine.clone()
    }

    async fn lock(&self) -> MutexGuard<'_, Inner<F::Engine>> {
        self.shared.inner.lock().await
    }

    async fn check_open(&self) -> Result<(), NegotiationError> {
        self.live().await.map(|_| ())
    }

    /// Locks the state, failing with `StaleCompletion` if the session closed
    /// while the caller was waiting on the engine.
    async fn live(&self) -> Result<MutexGuard<'_, Inner<F::Engine>>, NegotiationError> {
        let inner = self.lock().await;
        if inner.state == NegotiationState::Closed {
            return Err(NegotiationError::StaleCompletion);
        }
        Ok(inner)
    }
}

async fn pump_events<F: EngineFactory>(
    session: Session<F>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        if session.is_closed().await {
            break;
        }
        session.on_engine_event(event).await;
    }
    debug!("Engine events ended for '{}'", session.channel());
}

fn decode_description(
    payload: &str,
    kind: SignalKind,
) -> Result<SessionDescription, NegotiationError> {
    let description = SessionDescription::from_payload(payload)
        .map_err(|source| NegotiationError::MalformedPayload { kind, source })?;

    let expected = match kind {
        SignalKind::Answer => SdpType::Answer,
        _ => SdpType::Offer,
    };
    if description.sdp_type != expected {
        return Err(NegotiationError::DescriptionMismatch {
            kind,
            found: description.sdp_type,
        });
    }

    Ok(description)
}

fn encode_description(
    description: &SessionDescription,
    kind: SignalKind,
) -> Result<String, NegotiationError> {
    description
        .to_payload()
        .map_err(|source| NegotiationError::MalformedPayload { kind, source })
}
