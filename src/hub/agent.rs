//! Connection agent: one per live participant connection.
//!
//! The inbound pump reads and dispatches frames; the outbound pump drains the
//! agent's bounded queue to the peer and sends liveness probes when idle. The
//! two share only a cancellation token and the queue. Whichever side stops
//! first triggers a teardown that runs at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{AgentId, Envelope, InboundMessage, ServerEvent, CODE_UNKNOWN_KIND};
use super::transport::{FrameReader, FrameWriter};
use super::{AgentRegistration, HubHandle};
use crate::config::HubConfig;
use crate::error::{ConnectionError, ConnectionResult};

/// The session an agent has joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub session_id: String,
    pub project_id: i64,
    pub participant_id: i64,
}

/// Whether the inbound pump keeps reading after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Leave,
}

/// Session-level handling of inbound messages.
///
/// Protocol concerns (probe responses, unknown kinds, malformed frames) are
/// handled by the agent itself and never reach the handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message.
    async fn handle(&self, ctx: &AgentContext, message: InboundMessage) -> Flow;

    /// Called once after both pumps have stopped.
    async fn on_disconnect(&self, _ctx: &AgentContext) {}
}

/// State shared by an agent's pumps and its message handler.
pub struct AgentContext {
    id: AgentId,
    hub: HubHandle,
    outbound: mpsc::Sender<Envelope>,
    live: Arc<AtomicBool>,
    cancel: CancellationToken,
    membership: Mutex<Option<Membership>>,
}

impl AgentContext {
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// The joined session, if any.
    pub fn membership(&self) -> Option<Membership> {
        self.membership
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Register with the hub under `membership`, replacing any earlier one.
    pub async fn join(&self, membership: Membership) -> ConnectionResult<()> {
        self.hub
            .register(AgentRegistration {
                agent_id: self.id,
                session_id: membership.session_id.clone(),
                project_id: membership.project_id,
                participant_id: membership.participant_id,
                outbound: self.outbound.clone(),
                live: Arc::clone(&self.live),
                cancel: self.cancel.clone(),
            })
            .await?;
        *self.membership.lock().unwrap_or_else(|e| e.into_inner()) = Some(membership);
        Ok(())
    }

    /// Queue an event for this connection only. A full queue tears the agent down.
    pub async fn reply(&self, event: ServerEvent) {
        match self.outbound.try_send(Envelope::new(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = ConnectionError::CapacityExceeded {
                    agent_id: self.id.to_string(),
                };
                warn!(agent_id = %self.id, error = %err, "Reply dropped");
                self.teardown("outbound queue full").await;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(agent_id = %self.id, "Reply after outbound queue closed");
            }
        }
    }

    /// Stop both pumps and leave the hub. Only the first call has any effect.
    pub async fn teardown(&self, reason: &str) {
        if !self.live.swap(false, Ordering::SeqCst) {
            // The hub may have dropped the agent already; make sure the pumps stop.
            self.cancel.cancel();
            return;
        }
        self.cancel.cancel();
        if let Err(e) = self.hub.unregister(self.id).await {
            debug!(agent_id = %self.id, error = %e, "Hub gone during teardown");
        }
        info!(agent_id = %self.id, reason, "Connection torn down");
    }
}

/// A live connection and the pumps that serve it.
pub struct ConnectionAgent<R, W> {
    reader: R,
    writer: W,
    config: HubConfig,
    context: Arc<AgentContext>,
    outbound: mpsc::Receiver<Envelope>,
    handler: Arc<dyn MessageHandler>,
}

impl<R, W> ConnectionAgent<R, W>
where
    R: FrameReader + 'static,
    W: FrameWriter + 'static,
{
    pub fn new(
        reader: R,
        writer: W,
        config: HubConfig,
        hub: HubHandle,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_buffer);
        let context = Arc::new(AgentContext {
            id: Uuid::new_v4(),
            hub,
            outbound: tx,
            live: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            membership: Mutex::new(None),
        });
        Self {
            reader,
            writer,
            config,
            context,
            outbound: rx,
            handler,
        }
    }

    pub fn id(&self) -> AgentId {
        self.context.id
    }

    /// Cancelling the returned token stops the agent.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    /// Serve the connection until either side stops.
    pub async fn run(self) {
        let ConnectionAgent {
            reader,
            writer,
            config,
            context,
            outbound,
            handler,
        } = self;

        info!(agent_id = %context.id, "Connection opened");

        let outbound_task = tokio::spawn(outbound_pump(
            Arc::clone(&context),
            writer,
            outbound,
            config.clone(),
        ));

        inbound_pump(&context, reader, handler.as_ref(), &config).await;
        context.teardown("inbound closed").await;

        if let Err(e) = outbound_task.await {
            warn!(agent_id = %context.id, error = %e, "Outbound pump panicked");
        }
        handler.on_disconnect(&context).await;

        info!(agent_id = %context.id, "Connection closed");
    }
}

async fn inbound_pump<R: FrameReader>(
    ctx: &AgentContext,
    mut reader: R,
    handler: &dyn MessageHandler,
    config: &HubConfig,
) {
    let pong_wait = config.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                let err = ConnectionError::LivenessTimeout {
                    timeout_ms: config.pong_wait_ms,
                };
                warn!(agent_id = %ctx.id, error = %err, "Peer unresponsive");
                break;
            }
            frame = reader.read_frame() => frame,
        };

        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(agent_id = %ctx.id, "Peer closed the stream");
                break;
            }
            Err(e @ ConnectionError::MessageTooLarge { .. }) => {
                warn!(agent_id = %ctx.id, error = %e, "Rejecting frame");
                ctx.reply(ServerEvent::error(e.code(), e.to_string())).await;
                break;
            }
            Err(e) => {
                debug!(agent_id = %ctx.id, error = %e, "Read failed");
                break;
            }
        };

        match InboundMessage::decode(&bytes) {
            Ok(InboundMessage::Pong) => {
                deadline = Instant::now() + pong_wait;
            }
            Ok(InboundMessage::Unknown { kind, .. }) => {
                debug!(agent_id = %ctx.id, kind = %kind, "Unknown message kind");
                ctx.reply(ServerEvent::error(
                    CODE_UNKNOWN_KIND,
                    format!("unknown message kind: {}", kind),
                ))
                .await;
            }
            Ok(message) => {
                debug!(agent_id = %ctx.id, kind = message.kind(), "Dispatching message");
                if handler.handle(ctx, message).await == Flow::Leave {
                    break;
                }
            }
            Err(e @ ConnectionError::InvalidPayload { .. }) => {
                ctx.reply(ServerEvent::error(e.code(), e.to_string())).await;
            }
            Err(e) => {
                warn!(agent_id = %ctx.id, error = %e, "Undecodable frame");
                ctx.reply(ServerEvent::error(e.code(), e.to_string())).await;
                break;
            }
        }
    }
}

async fn outbound_pump<W: FrameWriter>(
    ctx: Arc<AgentContext>,
    mut writer: W,
    mut queue: mpsc::Receiver<Envelope>,
    config: HubConfig,
) {
    let write_wait = config.write_wait();
    let interval = config.ping_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent_since_tick = false;

    let result: ConnectionResult<()> = loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break Ok(()),
            envelope = queue.recv() => match envelope {
                Some(envelope) => {
                    if let Err(e) = write_envelope(&mut writer, &envelope, write_wait).await {
                        break Err(e);
                    }
                    sent_since_tick = true;
                }
                None => break Err(ConnectionError::Closed),
            },
            _ = ticker.tick() => {
                if !sent_since_tick {
                    if let Err(e) = write_envelope(&mut writer, &Envelope::new(ServerEvent::Ping), write_wait).await {
                        break Err(e);
                    }
                }
                sent_since_tick = false;
            }
        }
    };

    queue.close();
    if result.is_ok() {
        // Best effort: deliver what was queued before the cancel, e.g. a final error.
        while let Ok(envelope) = queue.try_recv() {
            if write_envelope(&mut writer, &envelope, write_wait).await.is_err() {
                break;
            }
        }
    }

    match &result {
        Ok(()) => debug!(agent_id = %ctx.id, "Outbound pump stopped"),
        Err(e) => debug!(agent_id = %ctx.id, error = %e, "Outbound pump failed"),
    }

    ctx.teardown("outbound closed").await;
    if let Err(e) = writer.close().await {
        debug!(agent_id = %ctx.id, error = %e, "Transport close failed");
    }
}

async fn write_envelope<W: FrameWriter>(
    writer: &mut W,
    envelope: &Envelope,
    write_wait: Duration,
) -> ConnectionResult<()> {
    let frame = envelope.to_frame()?;
    match tokio::time::timeout(write_wait, writer.write_frame(&frame)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::WriteTimeout {
            timeout_ms: write_wait.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::transport::split_lines;
    use crate::hub::Hub;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        handled: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _ctx: &AgentContext, message: InboundMessage) -> Flow {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if message == InboundMessage::LeaveSession {
                Flow::Leave
            } else {
                Flow::Continue
            }
        }

        async fn on_disconnect(&self, _ctx: &AgentContext) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let config = HubConfig::default();
        let (hub, _task) = Hub::spawn(&config);
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = split_lines(server, config.max_message_size);
        let handler = Arc::new(CountingHandler {
            handled: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        let agent = ConnectionAgent::new(reader, writer, config, hub, handler.clone());
        let ctx = Arc::clone(&agent.context);

        ctx.teardown("first").await;
        ctx.teardown("second").await;
        assert!(!ctx.is_live());
        assert!(ctx.cancel.is_cancelled());

        agent.run().await;
        drop(client);
        assert_eq!(handler.disconnects.load(Ordering::SeqCst), 1);
    }
}
