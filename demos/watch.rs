//! Live monitor: runs the sync engine against a real cloud account and
//! prints every bus state change.
//!
//! Usage: cargo run --example watch -- <base-url> <email> <secret>

use std::sync::Arc;

use robovac_bridge::{Bus, MemoryBus, SyncEngine};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(base_url), Some(email), Some(secret)) = (args.next(), args.next(), args.next())
    else {
        eprintln!("usage: watch <base-url> <email> <secret>");
        std::process::exit(1);
    };

    let bus = Arc::new(MemoryBus::new("robovac"));
    let mut watcher = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = watcher.recv().await {
            let marker = if event.ack { " " } else { "*" };
            println!("{marker} {} = {:?}", event.path, event.value);
        }
    });

    let mut engine = SyncEngine::builder(base_url)
        .credentials(email, secret)
        .build(bus);
    engine.run().await;
}
