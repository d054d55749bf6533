use std::error::Error;
use std::time::Duration;

use telemetry_stream::retry::ReconnectPolicy;
use telemetry_stream::stream::{ConnectionState, StreamClient, StreamConfig};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8081".to_string());
    let config = StreamConfig::new(address).with_reconnect_policy(ReconnectPolicy::exponential(
        Duration::from_millis(500),
        Duration::from_secs(8),
        5,
    ));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::spawn(config);
        let mut status = client.status();
        client.connect().await?;

        loop {
            status.changed().await?;
            let state = *status.borrow_and_update();
            let snapshot = client.snapshot().await?;
            println!(
                "state={} attempts={} last_rtt_ms={}",
                state.as_str(),
                snapshot.attempts,
                snapshot
                    .last_round_trip
                    .map(|rtt| rtt.as_millis().to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
            if state == ConnectionState::Failed {
                break;
            }
        }

        client.disconnect().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
