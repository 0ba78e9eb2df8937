//! Satellite connector: owns the outbound socket, runs the reconnect
//! loop, and routes incoming calls through the main-thread dispatcher.
//!
//! The loop is a small state machine, Disconnected → Connecting →
//! Connected → Disconnected. At every iteration boundary the connector
//! re-checks whether it should stop at all: disposed, superseded by a
//! newer generation, or no longer named by the session lease. A stale
//! instance must never reach the socket again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use patchbay_wire::{Hello, LineCodec, Message, ResultEnvelope};

use crate::config::BridgeConfig;
use crate::dispatch::MainThreadQueue;
use crate::registry::HandlerRegistry;
use crate::satellite::generation::GenerationCounter;
use crate::satellite::lease::SessionLease;

/// Link-state signals for an external supervisor. `PeerUnreachable`
/// fires once per outage, after the configured number of consecutive
/// connect failures; the supervisor may restart the hub process, the
/// connector itself takes no restart action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorEvent {
    Connected,
    Disconnected,
    PeerUnreachable,
}

/// Why a connected session ended.
enum SessionEnd {
    Disposed,
    ChannelDown,
}

pub struct Connector {
    peer_id: String,
    generation: u64,
    counter: Arc<GenerationCounter>,
    lease: Arc<dyn SessionLease>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connector {
    /// Construct a connector (capturing a fresh generation) and start
    /// its reconnect loop on the background I/O context.
    pub fn spawn(
        config: BridgeConfig,
        registry: Arc<HandlerRegistry>,
        queue: Arc<MainThreadQueue>,
        counter: Arc<GenerationCounter>,
        lease: Arc<dyn SessionLease>,
        events: Option<mpsc::UnboundedSender<ConnectorEvent>>,
    ) -> Self {
        let peer_id = Uuid::new_v4().to_string();
        let generation = counter.next();
        let cancel = CancellationToken::new();

        tracing::info!(
            target: "patchbay::satellite",
            %peer_id,
            generation,
            "Connector starting"
        );

        let ctx = RunCtx {
            config,
            registry,
            queue,
            counter: Arc::clone(&counter),
            lease: Arc::clone(&lease),
            peer_id: peer_id.clone(),
            generation,
            cancel: cancel.clone(),
            events,
        };
        let task = tokio::spawn(run_loop(ctx));

        Self {
            peer_id,
            generation,
            counter,
            lease,
            cancel,
            task,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_superseded(&self) -> bool {
        self.counter.current() > self.generation
    }

    /// True once the reconnect loop has halted for good.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop, unblock any outstanding read, and give up the
    /// session lease. Idempotent.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(target: "patchbay::satellite", peer_id = %self.peer_id, "Connector disposed");
            self.cancel.cancel();
        }
        // Released here and again on loop exit: a claim already in
        // flight when dispose() lands can re-take the token after this
        // release, so one release is not enough.
        self.lease.release(&self.peer_id);
    }
}

struct RunCtx {
    config: BridgeConfig,
    registry: Arc<HandlerRegistry>,
    queue: Arc<MainThreadQueue>,
    counter: Arc<GenerationCounter>,
    lease: Arc<dyn SessionLease>,
    peer_id: String,
    generation: u64,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<ConnectorEvent>>,
}

impl RunCtx {
    fn emit(&self, event: ConnectorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Stop checks, evaluated at every loop iteration boundary.
    fn should_stop(&self) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!(target: "patchbay::satellite", peer_id = %self.peer_id, "Stopping: disposed");
            return true;
        }
        if self.counter.current() > self.generation {
            tracing::info!(
                target: "patchbay::satellite",
                peer_id = %self.peer_id,
                generation = self.generation,
                current = self.counter.current(),
                "Stopping: superseded by newer connector"
            );
            return true;
        }
        if !self.lease.claim(&self.peer_id) {
            tracing::info!(
                target: "patchbay::satellite",
                peer_id = %self.peer_id,
                "Stopping: session token names another connector"
            );
            return true;
        }
        false
    }
}

/// Doubling backoff, saturating at the cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

async fn run_loop(ctx: RunCtx) {
    let mut backoff = ctx.config.backoff_base;
    let mut failures: u32 = 0;
    let mut unreachable_signaled = false;

    loop {
        if ctx.should_stop() {
            break;
        }

        let addr = ctx.config.addr();
        match connect(&addr, ctx.config.connect_timeout).await {
            Ok(stream) => {
                backoff = ctx.config.backoff_base;
                failures = 0;
                unreachable_signaled = false;
                ctx.emit(ConnectorEvent::Connected);

                let end = run_connected(&ctx, stream).await;
                ctx.emit(ConnectorEvent::Disconnected);
                if matches!(end, SessionEnd::Disposed) {
                    break;
                }
            }
            Err(e) => {
                failures += 1;
                if failures >= ctx.config.unreachable_threshold && !unreachable_signaled {
                    tracing::warn!(
                        target: "patchbay::satellite",
                        %addr,
                        failures,
                        "Peer unreachable after repeated connect failures"
                    );
                    ctx.emit(ConnectorEvent::PeerUnreachable);
                    unreachable_signaled = true;
                }
                tracing::debug!(
                    target: "patchbay::satellite",
                    %addr,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Connect failed, backing off"
                );
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff, ctx.config.backoff_cap);
            }
        }
    }

    // The exiting loop always gives the token back. Without this, a
    // claim that was in flight when dispose() released the token leaves
    // it re-claimed by a halted instance, and no later claimant ever
    // succeeds.
    ctx.lease.release(&ctx.peer_id);

    tracing::debug!(
        target: "patchbay::satellite",
        peer_id = %ctx.peer_id,
        generation = ctx.generation,
        "Connector loop exiting"
    );
}

async fn connect(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect timed out",
        )),
    }
}

/// One connected session: hello, then the read loop until the channel
/// drops or the connector is disposed. Responses flow back through an
/// mpsc so handler jobs never touch the socket directly.
async fn run_connected(ctx: &RunCtx, stream: TcpStream) -> SessionEnd {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LineCodec::<Message>::new());
    let mut writer = FramedWrite::new(write_half, LineCodec::<Message>::new());

    let hello = Message::Hello(Hello {
        peer_id: ctx.peer_id.clone(),
        time_utc: Utc::now(),
    });
    if let Err(e) = writer.send(hello).await {
        tracing::warn!(target: "patchbay::satellite", error = %e, "Failed to send hello");
        return SessionEnd::ChannelDown;
    }
    tracing::info!(
        target: "patchbay::satellite",
        peer_id = %ctx.peer_id,
        addr = %ctx.config.addr(),
        "Connected to hub"
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return SessionEnd::Disposed;
            }

            Some(msg) = out_rx.recv() => {
                if let Err(e) = writer.send(msg).await {
                    tracing::warn!(target: "patchbay::satellite", error = %e, "Response write failed");
                    return SessionEnd::ChannelDown;
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(Message::Call { id, name, args })) => {
                    tracing::debug!(target: "patchbay::satellite", call_id = %id, %name, "Call received");
                    dispatch_call(ctx, id, name, args, out_tx.clone());
                }
                Some(Ok(other)) => {
                    tracing::debug!(target: "patchbay::satellite", ?other, "Ignoring unexpected message");
                }
                Some(Err(e)) => {
                    tracing::warn!(target: "patchbay::satellite", error = %e, "Channel read error");
                    return SessionEnd::ChannelDown;
                }
                None => {
                    tracing::debug!(target: "patchbay::satellite", "Hub closed the connection");
                    return SessionEnd::ChannelDown;
                }
            }
        }
    }
}

/// Hand a call off to the host's cooperative execution context. The job
/// resolves the handler, runs it under catch_unwind, and ships the
/// envelope back through the outbound channel. If the dispatcher is not
/// installed the job is dropped there and the hub-side deadline covers
/// the call.
fn dispatch_call(
    ctx: &RunCtx,
    id: String,
    name: String,
    args: serde_json::Value,
    out: mpsc::UnboundedSender<Message>,
) {
    let registry = Arc::clone(&ctx.registry);
    ctx.queue.enqueue(Box::new(move || {
        let result = match registry.lookup(&name) {
            Some(handler) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        tracing::error!(target: "patchbay::satellite", %name, "Handler panicked");
                        ResultEnvelope::error(format!("handler '{}' panicked", name))
                    }
                }
            }
            None => {
                tracing::warn!(target: "patchbay::satellite", %name, "Unknown handler");
                ResultEnvelope::error(format!("unknown handler: {}", name))
            }
        };
        let _ = out.send(Message::Response { id, result });
    }));
}
