use std::error::Error;
use std::time::Duration;

use telemetry_stream::stream::proto::{AlertPayload, SensorData};
use telemetry_stream::stream::{Category, ConnectionState, StreamClient, StreamConfig};

const SENSOR_IDS: [&str; 6] = ["WL001", "WL002", "TEMP001", "TEMP002", "FLOW001", "PH001"];
const RUN_FOR: Duration = Duration::from_secs(60);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8081".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::spawn(StreamConfig::new(address.clone()));

        client
            .on(Category::SensorData, |payload| {
                for reading in SensorData::from_payload(payload)?.readings() {
                    println!(
                        "sensor={} value={} unit={}",
                        reading.sensor_id,
                        reading.value,
                        reading.unit.as_deref().unwrap_or("-"),
                    );
                }
                Ok(())
            })
            .await?;
        client
            .on(Category::Alert, |payload| {
                let alert = AlertPayload::from_payload(payload)?;
                println!(
                    "alert severity={} {}",
                    alert.severity.as_deref().unwrap_or("info"),
                    alert.headline().unwrap_or("(no text)"),
                );
                Ok(())
            })
            .await?;

        // Resubscribe on every (re)connect. A weak handle keeps the observer
        // from holding the worker open.
        let weak = client.downgrade();
        client
            .on(Category::Connected, move |_| {
                if let Some(client) = weak.upgrade() {
                    tokio::spawn(async move {
                        client.subscribe(SENSOR_IDS).await;
                        client.get_status().await;
                    });
                }
                Ok(())
            })
            .await?;

        client.connect().await?;
        let mut status = client.status();
        status
            .wait_for(|state| matches!(state, ConnectionState::Open | ConnectionState::Failed))
            .await?;
        if client.state() == ConnectionState::Failed {
            println!("could not reach {address}");
            return Ok(());
        }

        tokio::time::sleep(RUN_FOR).await;
        client.shutdown().await?;

        Ok::<(), Box<dyn Error>>(())
    })
}
