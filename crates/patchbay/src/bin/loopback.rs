//! Loopback smoke tool: hub and satellite in one process.
//!
//! Binds a hub on an ephemeral port, points a connector with an `echo`
//! handler at it, issues one call, and prints the result envelope.

use std::sync::Arc;
use std::time::Duration;

use patchbay::{
    BridgeConfig, Connector, FsSessionLease, GenerationCounter, HandlerRegistry, Hub,
    MainThreadQueue,
};
use patchbay_wire::ResultEnvelope;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    patchbay::logging::init();

    let mut config = BridgeConfig::from_env();
    config.port = 0;
    let hub = Hub::bind(&config).await?;
    config.port = hub.local_addr().port();

    let mut registry = HandlerRegistry::new();
    registry.register("echo", |args| ResultEnvelope::text(args.to_string()));

    let queue = Arc::new(MainThreadQueue::new());
    queue.install();
    let ticker_queue = Arc::clone(&queue);
    std::thread::spawn(move || loop {
        ticker_queue.tick();
        std::thread::sleep(Duration::from_millis(5));
    });

    let lease = FsSessionLease::from_config(&config);
    lease.clear_stale();

    let connector = Connector::spawn(
        config,
        Arc::new(registry),
        queue,
        Arc::new(GenerationCounter::new()),
        Arc::new(lease),
        None,
    );

    for _ in 0..100 {
        if hub.live_peer().await.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::ensure!(hub.live_peer().await.is_some(), "satellite never connected");

    let result = hub
        .issue("echo", serde_json::json!({"ping": true}))
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    connector.dispose();
    hub.shutdown().await;
    Ok(())
}
