//! Request multiplexer: pending-call table, deadlines, and the
//! exactly-once resolution cell.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::SinkExt;
use tokio::sync::oneshot;
use uuid::Uuid;

use patchbay_wire::{Message, ResultEnvelope};

use super::arbiter::HubShared;

/// Write-once result cell. Three writers race to set the outcome of a
/// pending call (response, deadline, channel loss); the slot is taken
/// under a mutex so exactly one wins and the rest observe `false`.
pub(crate) struct ResolveOnce {
    slot: StdMutex<Option<oneshot::Sender<ResultEnvelope>>>,
}

impl ResolveOnce {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<ResultEnvelope>) {
        let (tx, rx) = oneshot::channel();
        let cell = Arc::new(Self {
            slot: StdMutex::new(Some(tx)),
        });
        (cell, rx)
    }

    /// Returns true if this call set the outcome, false if it was
    /// already set.
    pub(crate) fn resolve(&self, result: ResultEnvelope) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

struct PendingCall {
    cell: Arc<ResolveOnce>,
    issued_at: Instant,
}

/// Hub-side call correlation over the current live channel.
pub struct RequestMux {
    shared: Arc<HubShared>,
    pending: DashMap<String, PendingCall>,
    call_timeout: Duration,
}

impl RequestMux {
    pub(crate) fn new(shared: Arc<HubShared>, call_timeout: Duration) -> Self {
        Self {
            shared,
            pending: DashMap::new(),
            call_timeout,
        }
    }

    /// Issue a call and await exactly one outcome: the response, a
    /// deadline expiry, or channel loss. With no live channel this
    /// resolves immediately without allocating an id or writing
    /// anything.
    pub async fn issue(&self, name: &str, args: serde_json::Value) -> ResultEnvelope {
        let writer = {
            let live = self.shared.live.lock().await;
            match live.as_ref() {
                Some(channel) => Arc::clone(&channel.writer),
                None => {
                    tracing::debug!(target: "patchbay::hub", %name, "Call issued with no live channel");
                    return ResultEnvelope::error("not connected: no live channel");
                }
            }
        };

        let id = Uuid::new_v4().to_string();
        let (cell, rx) = ResolveOnce::new();
        self.pending.insert(
            id.clone(),
            PendingCall {
                cell,
                issued_at: Instant::now(),
            },
        );

        let call = Message::Call {
            id: id.clone(),
            name: name.to_string(),
            args,
        };
        {
            let mut w = writer.lock().await;
            if let Err(e) = w.send(call).await {
                tracing::warn!(target: "patchbay::hub", call_id = %id, error = %e, "Call write failed");
                self.pending.remove(&id);
                return ResultEnvelope::error(format!("channel lost: {}", e));
            }
        }
        tracing::debug!(target: "patchbay::hub", call_id = %id, %name, "Call issued");

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without resolving; should not happen,
                // but never leave the caller hanging.
                self.pending.remove(&id);
                ResultEnvelope::error("channel lost: call aborted")
            }
            Err(_) => {
                // Entry removed first, so a late response finds no id
                // and is dropped.
                self.pending.remove(&id);
                tracing::debug!(target: "patchbay::hub", call_id = %id, %name, "Call timed out");
                ResultEnvelope::error(format!(
                    "call timed out after {}ms",
                    self.call_timeout.as_millis()
                ))
            }
        }
    }

    /// Route an incoming response to its pending call. Late or unknown
    /// ids are dropped.
    pub(crate) fn resolve(&self, id: &str, result: ResultEnvelope) {
        match self.pending.remove(id) {
            Some((_, call)) => {
                tracing::debug!(
                    target: "patchbay::hub",
                    call_id = %id,
                    elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                    "Call resolved"
                );
                call.cell.resolve(result);
            }
            None => {
                tracing::debug!(target: "patchbay::hub", call_id = %id, "Dropping late or unknown response");
            }
        }
    }

    /// Resolve every pending call with a channel-lost error and clear
    /// the table.
    pub(crate) fn fail_all_pending(&self, reason: &str) {
        let count = self.pending.len();
        if count > 0 {
            tracing::warn!(target: "patchbay::hub", pending = count, %reason, "Failing all pending calls");
        }
        self.pending.retain(|_, call| {
            call.cell
                .resolve(ResultEnvelope::error(format!("channel lost: {}", reason)));
            false
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::hub::Hub;
    use chrono::Utc;
    use futures::StreamExt;
    use patchbay_wire::{Hello, LineCodec};
    use tokio::net::TcpStream;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn resolve_once_first_writer_wins() {
        let (cell, mut rx) = ResolveOnce::new();
        assert!(cell.resolve(ResultEnvelope::text("first")));
        assert!(!cell.resolve(ResultEnvelope::text("second")));
        assert!(!cell.resolve(ResultEnvelope::error("third")));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.text_joined(), "first");
    }

    async fn hub_with_timeout(ms: u64) -> Hub {
        let config = BridgeConfig {
            port: 0,
            call_timeout: Duration::from_millis(ms),
            ..BridgeConfig::default()
        };
        Hub::bind(&config).await.unwrap()
    }

    /// Raw satellite stand-in: connects, says hello, hands back the
    /// framed halves for the test to script.
    async fn dial(
        hub: &Hub,
    ) -> (
        FramedRead<tokio::net::tcp::OwnedReadHalf, LineCodec<Message>>,
        FramedWrite<tokio::net::tcp::OwnedWriteHalf, LineCodec<Message>>,
    ) {
        let stream = TcpStream::connect(hub.local_addr()).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, LineCodec::<Message>::new());
        let mut writer = FramedWrite::new(write_half, LineCodec::<Message>::new());
        writer
            .send(Message::Hello(Hello {
                peer_id: "sat".to_string(),
                time_utc: Utc::now(),
            }))
            .await
            .unwrap();
        for _ in 0..100 {
            if hub.live_peer().await.is_some() {
                return (reader, writer);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("satellite never became live");
    }

    #[tokio::test]
    async fn issue_without_channel_fails_immediately() {
        let hub = hub_with_timeout(5000).await;
        let start = Instant::now();
        let result = hub.issue("ping", serde_json::Value::Null).await;
        assert!(result.is_error);
        assert!(result.text_joined().contains("not connected"));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(hub.mux().pending_count(), 0);
    }

    #[tokio::test]
    async fn response_resolves_call() {
        let hub = hub_with_timeout(5000).await;
        let (mut reader, mut writer) = dial(&hub).await;

        let mux = hub.mux();
        let issue = tokio::spawn(async move { mux.issue("ping", serde_json::json!(1)).await });

        // Echo back a response for whatever id arrives.
        let call = reader.next().await.unwrap().unwrap();
        let Message::Call { id, name, args } = call else {
            panic!("expected call");
        };
        assert_eq!(name, "ping");
        assert_eq!(args, serde_json::json!(1));
        writer
            .send(Message::Response {
                id,
                result: ResultEnvelope::text("pong"),
            })
            .await
            .unwrap();

        let result = issue.await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text_joined(), "pong");
        assert_eq!(hub.mux().pending_count(), 0);
    }

    #[tokio::test]
    async fn deadline_fires_and_late_response_is_dropped() {
        let hub = hub_with_timeout(100).await;
        let (mut reader, mut writer) = dial(&hub).await;

        let result = hub.issue("slow", serde_json::Value::Null).await;
        assert!(result.is_error);
        assert!(result.text_joined().contains("timed out"));
        assert_eq!(hub.mux().pending_count(), 0);

        // Respond well after the deadline; nothing should blow up and
        // the table stays empty.
        let Message::Call { id, .. } = reader.next().await.unwrap().unwrap() else {
            panic!("expected call");
        };
        writer
            .send(Message::Response {
                id,
                result: ResultEnvelope::text("too late"),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.mux().pending_count(), 0);
    }

    #[tokio::test]
    async fn channel_loss_fails_all_pending_calls() {
        let hub = hub_with_timeout(10_000).await;
        let (mut reader, writer) = dial(&hub).await;

        let mut issues = Vec::new();
        for i in 0..3 {
            let mux = hub.mux();
            issues.push(tokio::spawn(async move {
                mux.issue("hang", serde_json::json!(i)).await
            }));
        }

        // Wait until all three calls are on the wire, then drop the
        // connection with none of them answered.
        for _ in 0..3 {
            let msg = reader.next().await.unwrap().unwrap();
            assert!(matches!(msg, Message::Call { .. }));
        }
        drop(reader);
        drop(writer);

        for issue in issues {
            let result = tokio::time::timeout(Duration::from_secs(2), issue)
                .await
                .expect("call did not resolve on channel loss")
                .unwrap();
            assert!(result.is_error);
            assert!(result.text_joined().contains("channel lost"));
        }
        assert_eq!(hub.mux().pending_count(), 0);
    }
}
