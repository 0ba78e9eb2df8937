//! Connection arbiter: accepts raw connections, runs the hello
//! handshake, and owns the single live channel.
//!
//! Per-connection state machine: Pending (buffering, pre-hello) →
//! Live (promoted) or Rejected (closed immediately). A live channel
//! moves to Closed on any read error, EOF, or supersession by a newer
//! arrival.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use patchbay_wire::{Hello, LineCodec, Message};

use super::mux::RequestMux;
use crate::config::BridgeConfig;

pub(crate) type ChannelWriter =
    Arc<tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LineCodec<Message>>>>;

/// The currently promoted channel and its recorded hello.
pub(crate) struct LiveChannel {
    pub(crate) epoch: u64,
    pub(crate) hello: Hello,
    pub(crate) writer: ChannelWriter,
    reader: JoinHandle<()>,
}

/// Shared hub state: the one live-channel slot plus an epoch counter so
/// a stale channel's teardown can never clear its replacement. Injected
/// into the arbiter and the multiplexer rather than living as a global,
/// so every test gets a fresh instance.
pub(crate) struct HubShared {
    pub(crate) live: tokio::sync::Mutex<Option<LiveChannel>>,
    epoch: AtomicU64,
}

impl HubShared {
    pub(crate) fn new() -> Self {
        Self {
            live: tokio::sync::Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Hub side of the bridge: listener, arbiter, and call multiplexer.
pub struct Hub {
    shared: Arc<HubShared>,
    mux: Arc<RequestMux>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Hub {
    /// Bind the listener and start the accept loop. `port` 0 binds an
    /// ephemeral port, readable via `local_addr`.
    pub async fn bind(config: &BridgeConfig) -> Result<Self, HubError> {
        let addr = config.addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| HubError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| HubError::Bind {
            addr,
            source,
        })?;

        let shared = Arc::new(HubShared::new());
        let mux = Arc::new(RequestMux::new(Arc::clone(&shared), config.call_timeout));

        tracing::info!(target: "patchbay::hub", %local_addr, "Hub listening");

        let shared_for_loop = Arc::clone(&shared);
        let mux_for_loop = Arc::clone(&mux);
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, shared_for_loop, mux_for_loop).await;
        });

        Ok(Self {
            shared,
            mux,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mux(&self) -> Arc<RequestMux> {
        Arc::clone(&self.mux)
    }

    /// Issue a call over the current live channel. See [`RequestMux::issue`].
    pub async fn issue(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> patchbay_wire::ResultEnvelope {
        self.mux.issue(name, args).await
    }

    /// The hello recorded for the current live channel, if any.
    pub async fn live_peer(&self) -> Option<Hello> {
        self.shared.live.lock().await.as_ref().map(|c| c.hello.clone())
    }

    /// Stop accepting, close the live channel, fail anything pending.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let old = self.shared.live.lock().await.take();
        if let Some(old) = old {
            old.reader.abort();
        }
        self.mux.fail_all_pending("hub shutting down");
        tracing::info!(target: "patchbay::hub", "Hub shut down");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<HubShared>, mux: Arc<RequestMux>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                tracing::debug!(target: "patchbay::hub", %peer_addr, "Connection accepted, awaiting hello");
                let shared = Arc::clone(&shared);
                let mux = Arc::clone(&mux);
                tokio::spawn(async move {
                    handshake(stream, peer_addr, shared, mux).await;
                });
            }
            Err(e) => {
                tracing::warn!(target: "patchbay::hub", error = %e, "Accept failed");
            }
        }
    }
}

/// Drive one pending connection to promotion or rejection.
async fn handshake(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<HubShared>,
    mux: Arc<RequestMux>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LineCodec::<Message>::new());

    // Pending state: hello must arrive first; anything else on the
    // connection is decoded and dropped.
    let hello = loop {
        match reader.next().await {
            Some(Ok(Message::Hello(hello))) => break hello,
            Some(Ok(other)) => {
                tracing::trace!(target: "patchbay::hub", %peer_addr, ?other, "Dropping pre-hello message");
            }
            Some(Err(e)) => {
                tracing::debug!(target: "patchbay::hub", %peer_addr, error = %e, "Pending connection errored");
                return;
            }
            None => {
                tracing::debug!(target: "patchbay::hub", %peer_addr, "Pending connection closed before hello");
                return;
            }
        }
    };

    let mut live = shared.live.lock().await;

    if let Some(current) = live.as_ref() {
        let same_peer = hello.peer_id == current.hello.peer_id;
        let newer_or_tie = hello.time_utc >= current.hello.time_utc;
        if !same_peer && !newer_or_tie {
            // Zombie: a stale session must never evict a newer one.
            // Dropping the halves closes the socket without promotion.
            tracing::info!(
                target: "patchbay::hub",
                %peer_addr,
                peer_id = %hello.peer_id,
                live_peer_id = %current.hello.peer_id,
                "Rejecting zombie connection"
            );
            return;
        }
    }

    // Promote. Detach the old channel's reader before dropping it so
    // its teardown cannot observe the new channel as "down", then fail
    // whatever was in flight: responses only arrive on the connection
    // their calls were written to.
    if let Some(old) = live.take() {
        old.reader.abort();
        tracing::info!(
            target: "patchbay::hub",
            old_peer_id = %old.hello.peer_id,
            new_peer_id = %hello.peer_id,
            "Replacing live channel"
        );
        mux.fail_all_pending("channel replaced by newer connection");
    }

    let epoch = shared.next_epoch();
    let writer: ChannelWriter = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
        write_half,
        LineCodec::new(),
    )));

    let reader_task = {
        let shared = Arc::clone(&shared);
        let mux = Arc::clone(&mux);
        tokio::spawn(async move {
            read_live(reader, epoch, shared, mux).await;
        })
    };

    tracing::info!(
        target: "patchbay::hub",
        %peer_addr,
        peer_id = %hello.peer_id,
        session_time = %hello.time_utc,
        "Channel promoted to live"
    );

    *live = Some(LiveChannel {
        epoch,
        hello,
        writer,
        reader: reader_task,
    });
}

/// Read loop for the promoted channel: route responses into the mux,
/// ignore protocol violations, tear down on error or EOF.
async fn read_live(
    mut reader: FramedRead<OwnedReadHalf, LineCodec<Message>>,
    epoch: u64,
    shared: Arc<HubShared>,
    mux: Arc<RequestMux>,
) {
    loop {
        match reader.next().await {
            Some(Ok(Message::Response { id, result })) => {
                mux.resolve(&id, result);
            }
            Some(Ok(Message::Hello(_))) => {
                tracing::debug!(target: "patchbay::hub", "Ignoring hello after promotion");
            }
            Some(Ok(Message::Call { name, .. })) => {
                tracing::debug!(target: "patchbay::hub", %name, "Ignoring call from satellite");
            }
            Some(Err(e)) => {
                tracing::warn!(target: "patchbay::hub", error = %e, "Live channel read error");
                break;
            }
            None => {
                tracing::debug!(target: "patchbay::hub", "Live channel closed by peer");
                break;
            }
        }
    }

    // Only clear the slot if this channel is still the live one; a
    // replacement may already have been promoted.
    let cleared = {
        let mut live = shared.live.lock().await;
        if live.as_ref().map(|c| c.epoch) == Some(epoch) {
            *live = None;
            true
        } else {
            false
        }
    };
    if cleared {
        mux.fail_all_pending("channel lost");
    }
}
