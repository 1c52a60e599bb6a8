//! Minimal single-machine demo: one publisher, one subscriber.
//!
//! Run with `cargo run --example sensor_feed`. The "sensor" publishes ten
//! frames at 10 Hz; the subscriber prints what it observes out of shared
//! memory.

use std::sync::Arc;
use std::time::Duration;

use carla_streaming::{ClientReader, Frame, Server, StreamId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Arc::new(Server::bind("127.0.0.1:0".parse()?).await?);
    let stream_id = StreamId::new(1);
    let broadcaster = server.make_stream(stream_id);

    let runner = server.clone();
    tokio::spawn(async move { runner.run().await });

    let reader = ClientReader::subscribe(server.token_for(stream_id), |frame| {
        println!("observed frame: {} bytes, first byte {:?}", frame.len(), frame.first());
    });

    // Give the subscriber a moment to finish its handshake, then feed it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 0u8..10 {
        broadcaster.publish(&Frame::message([vec![i; 32]]));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    reader.join().await;
    server.shutdown();
    Ok(())
}
