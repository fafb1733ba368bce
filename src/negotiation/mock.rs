//! In-memory engine and media source for exercising sessions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::model::description::{IceCandidate, SdpType, SessionDescription};
use crate::negotiation::engine::{
    EngineConfig, EngineEvent, EngineFactory, MediaConstraints, MediaHandle, MediaSource,
    PeerEngine, RemoteStream, TrackKind,
};
use crate::negotiation::error::{DeviceError, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AttachMedia,
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Rollback,
}

pub struct MockState {
    label: String,
    calls: Mutex<Vec<Call>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    answer_gate: Option<Arc<Notify>>,
    answer_entered: Arc<Notify>,
    reject_when_closed: bool,
    pub closed: AtomicBool,
}

impl MockState {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub struct MockEngine(Arc<MockState>);

#[async_trait]
impl PeerEngine for MockEngine {
    async fn attach_media(&self, _media: &MediaHandle) -> Result<(), EngineError> {
        self.0.record(Call::AttachMedia);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.0.record(Call::CreateOffer);
        Ok(SessionDescription::offer(format!("offer-from-{}", self.0.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.0.record(Call::CreateAnswer);
        if let Some(gate) = &self.0.answer_gate {
            self.0.answer_entered.notify_one();
            gate.notified().await;
        }
        if self.0.reject_when_closed && self.0.closed.load(Ordering::SeqCst) {
            return Err(EngineError::new("create_answer", "connection closed"));
        }
        Ok(SessionDescription::answer(format!("answer-from-{}", self.0.label)))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        self.0.record(Call::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), EngineError> {
        if description.sdp.contains("reject") {
            return Err(EngineError::new("set_remote_description", "bad sdp"));
        }
        self.0.record(Call::SetRemote(description.sdp_type));
        self.0.emit(EngineEvent::RemoteStreamReady(RemoteStream {
            id: format!("stream-at-{}", self.0.label),
            kind: TrackKind::Video,
        }));
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
        if candidate.candidate.contains("reject") {
            return Err(EngineError::new("add_candidate", "bad candidate"));
        }
        self.0.record(Call::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), EngineError> {
        self.0.record(Call::Rollback);
        Ok(())
    }

    fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockFactory {
    label: String,
    local_candidates: Vec<String>,
    answer_gate: Option<Arc<Notify>>,
    answer_entered: Arc<Notify>,
    reject_when_closed: bool,
    engines: Mutex<Vec<Arc<MockState>>>,
}

impl MockFactory {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    /// Candidates every new engine reports as soon as it exists.
    pub fn with_local_candidates(mut self, candidates: &[&str]) -> Self {
        self.local_candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Holds `create_answer` until the gate is notified.
    pub fn with_answer_gate(mut self, gate: Arc<Notify>) -> Self {
        self.answer_gate = Some(gate);
        self
    }

    /// Pending `create_answer` calls fail once the engine is closed, as a
    /// browser peer connection rejects them.
    pub fn rejecting_when_closed(mut self) -> Self {
        self.reject_when_closed = true;
        self
    }

    /// Notified each time an engine enters a gated `create_answer`.
    pub fn answer_entered(&self) -> Arc<Notify> {
        self.answer_entered.clone()
    }

    pub fn engines(&self) -> Vec<Arc<MockState>> {
        self.engines.lock().unwrap().clone()
    }

    pub fn engine(&self) -> Arc<MockState> {
        self.engines()
            .pop()
            .expect("no engine has been created")
    }
}

#[async_trait]
impl EngineFactory for MockFactory {
    type Engine = MockEngine;

    async fn create_connection(
        &self,
        _config: &EngineConfig,
    ) -> Result<(MockEngine, mpsc::UnboundedReceiver<EngineEvent>), EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            label: self.label.clone(),
            calls: Mutex::new(vec![]),
            events: tx,
            answer_gate: self.answer_gate.clone(),
            answer_entered: self.answer_entered.clone(),
            reject_when_closed: self.reject_when_closed,
            closed: AtomicBool::new(false),
        });

        for candidate in &self.local_candidates {
            state.emit(EngineEvent::LocalCandidate(IceCandidate::new(candidate.clone())));
        }

        self.engines.lock().unwrap().push(state.clone());
        Ok((MockEngine(state), rx))
    }
}

#[derive(Default)]
pub struct MockMedia {
    pub deny: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl MockMedia {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaHandle, DeviceError> {
        if self.deny {
            return Err(DeviceError::Denied);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut tracks = vec![];
        if constraints.video {
            tracks.push(TrackKind::Video);
        }
        if constraints.audio {
            tracks.push(TrackKind::Audio);
        }
        Ok(MediaHandle {
            id: format!("local-{n}"),
            tracks,
        })
    }

    fn release(&self, _handle: MediaHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
