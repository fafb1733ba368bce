//! Peer client
//!
//! Connects to the relay, joins one channel and negotiates a `str0m` peer
//! connection with whoever else is in it. With `call`, this side offers right
//! after joining and again to every member that joins later; otherwise it waits
//! for an offer. Ctrl-C hangs up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::message::{ConnectionId, ServerFrame};
use crate::negotiation::error::NegotiationError;
use crate::negotiation::manager::CallManager;
use crate::negotiation::session::{CallEvent, SessionContext};
use crate::rtc::{Str0mFactory, SyntheticMedia};
use crate::util::init_log;

pub fn main(channel: String, call: bool) -> Result<()> {
    init_log();
    start(Config::from_env(), channel, call)
}

/// Runs the peer on its own runtime until it hangs up.
fn start(config: Config, channel: String, call: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(run(config, channel, call))
}

async fn run(config: Config, channel: String, call: bool) -> Result<()> {

    let (ws, _) = connect_async(config.relay_url.as_str())
        .await
        .with_context(|| format!("connecting to {}", config.relay_url))?;
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let local_id = match next_frame(&mut ws_receiver).await? {
        Some(ServerFrame::Welcome { connection_id }) => connection_id,
        Some(other) => bail!("expected welcome, got {:?}", other),
        None => bail!("relay closed before welcome"),
    };
    info!("Connected to {} as {}", config.relay_url, local_id);

    let (outbox, mut outbound) = mpsc::unbounded_channel();
    let (events, mut call_events) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode frame: {}", e),
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut manager = CallManager::new(SessionContext {
        local_id: local_id.clone(),
        factory: Arc::new(Str0mFactory),
        media: Arc::new(SyntheticMedia::new()),
        config: config.session(),
        outbox,
        events,
    });
    if call {
        // Members joining later get a fresh offer.
        manager = manager.with_auto_call();
    }
    let manager = Arc::new(manager);

    manager.join(&channel).await?;
    if call {
        start_call(&manager, &channel).await;
    }

    loop {
        tokio::select! {
            frame = next_frame(&mut ws_receiver) => match frame {
                Ok(Some(frame)) => {
                    if let Err(e) = manager.handle_frame(frame).await {
                        warn!("{}", e);
                    }
                }
                Ok(None) => {
                    info!("Relay closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Relay connection failed: {:#}", e);
                    break;
                }
            },
            Some(event) = call_events.recv() => log_event(&local_id, &event),
            _ = tokio::signal::ctrl_c() => {
                info!("Hanging up");
                break;
            }
        }
    }

    manager.hangup_all().await;
    drop(manager);
    // Let the writer flush the leave frames.
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

    Ok(())
}

async fn start_call(manager: &CallManager<Str0mFactory>, channel: &str) {
    match manager.call(channel).await {
        Ok(()) => info!("Calling on '{}'", channel),
        Err(NegotiationError::AlreadyActive(_)) => debug!("Call on '{}' already active", channel),
        Err(e) => warn!("Call on '{}' failed: {}", channel, e),
    }
}

/// Next decodable frame, skipping malformed and non-text messages.
async fn next_frame<S>(receiver: &mut S) -> Result<Option<ServerFrame>>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = receiver.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!("Ignoring malformed frame: {}", e),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

fn log_event(local_id: &ConnectionId, event: &CallEvent) {
    match event {
        CallEvent::StateChanged { channel, state } => {
            info!("[{}] '{}' is {:?}", local_id.short(), channel, state)
        }
        CallEvent::RemoteStream { channel, stream } => info!(
            "[{}] remote {:?} stream {} on '{}'",
            local_id.short(),
            stream.kind,
            stream.id,
            channel
        ),
        CallEvent::ConnectionState { channel, state } => {
            info!("[{}] '{}' connection {:?}", local_id.short(), channel, state)
        }
        CallEvent::MemberJoined { channel, member } => {
            info!("[{}] {} joined '{}'", local_id.short(), member.short(), channel)
        }
        CallEvent::MemberLeft { channel, member } => {
            info!("[{}] {} left '{}'", local_id.short(), member.short(), channel)
        }
    }
}
