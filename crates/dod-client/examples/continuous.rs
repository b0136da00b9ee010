//! Continuous event-driven acquisition against the mock front end.
//!
//! Assembles a device from an optional TOML file, streams a few triggered
//! chunks through an `OnEvent` session and prints their metadata.
//!
//! Usage:
//! ```bash
//! cargo run --example continuous
//! # or with a config file:
//! DOD_CONFIG=device.toml cargo run --example continuous
//! ```

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dod_client::{DeviceContext, HardwareHandles};
use dod_core::position::AccessMode;
use dod_core::MetaId;
use dod_hardware::mock::{DataPattern, MockBpm};

const DEFAULT_CONFIG: &str = r#"
[device]
name = "bpm-demo"
profile = "dpp"

[buffer]
capacity_atoms = 65536

[controller]
timeout = "2s"
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match env::var("DOD_CONFIG") {
        Ok(path) => dod_core::load_device_config(Path::new(&path))?,
        Err(_) => dod_core::config::load_device_config_from_str(DEFAULT_CONFIG)?,
    };

    let mock = MockBpm::builder()
        .atom_size(config.device.profile.atom_size())
        .pattern(DataPattern::Noise)
        .build();
    let device = DeviceContext::open(
        &config,
        HardwareHandles {
            bus: mock.clone(),
            port: mock.clone(),
            interrupts: mock.clone(),
        },
    )?;
    device.start()?;
    println!(
        "device {} up ({} profile, {} B atoms)",
        device.name(),
        device.profile(),
        device.profile().atom_size()
    );

    let client = device.client();
    client.open(AccessMode::OnEvent, 128, -32)?;

    // Feed a block of samples, then fire a trigger into it, every 50 ms.
    let trigger_mock = Arc::clone(&mock);
    let trigger_task = tokio::spawn(async move {
        for n in 1..=5_u64 {
            trigger_mock.feed_atoms(2_048);
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger_mock.push_event(4, n * 2_048 - 256);
        }
    });

    for n in 1..=5 {
        let chunk = client.read(None).await?;
        println!(
            "chunk {n}: {} atoms at position {} (lmt {}, trigger kind {})",
            chunk.meta.get(MetaId::AtomCount).unwrap_or(0),
            chunk.meta.get(MetaId::AbsolutePosition).unwrap_or(-1),
            chunk.meta.get(MetaId::Lmt).unwrap_or(-1),
            chunk.meta.get(MetaId::EventKind).unwrap_or(-1),
        );
    }
    trigger_task.await?;

    let stats = client.queue_stats();
    println!("queue: {} accepted, {} rejected", stats.total, stats.rejected);

    client.close().await;
    device.shutdown().await;
    println!("device {} shut down", device.name());
    Ok(())
}
