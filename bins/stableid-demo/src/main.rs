// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Walkthrough of the stable-id lifecycle across two simulated devices
//! sharing one in-memory cloud store.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use stableid_core::{ChangeSource, IdentityConfig, ShortIdGenerator, StableId};
use stableid_mem::{MemoryCloudKv, MemorySecureStore};
use tokio::task::yield_now;
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Two-device stable-id walkthrough")]
struct Args {
    /// Use the 8-character alphanumeric generator instead of UUIDs.
    #[arg(long)]
    short: bool,

    /// Explicit initial identifier for device A.
    #[arg(long)]
    id: Option<String>,
}

fn config_for(args: &Args) -> IdentityConfig {
    IdentityConfig {
        id: args.id.clone(),
        generator: args.short.then(|| {
            let generator: Arc<dyn stableid_core::IdGenerator> = Arc::new(ShortIdGenerator);
            generator
        }),
        policy: None,
    }
}

/// Give detached secure-store writes and cloud echoes a chance to land.
async fn settle() {
    for _ in 0..8 {
        yield_now().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cloud = MemoryCloudKv::new();
    let device_a = StableId::new(
        Arc::new(cloud.clone()),
        Arc::new(MemorySecureStore::new()),
    );
    let device_b = StableId::new(
        Arc::new(cloud.clone()),
        Arc::new(MemorySecureStore::new()),
    );

    // Device A comes up first and mints (or adopts) the identity.
    let id_a = device_a.configure(config_for(&args)).await;
    info!(device = "a", id = %id_a, "configured");

    // Device B signs into the same account and inherits A's identity from
    // the cloud.
    let id_b = device_b.configure(IdentityConfig::default()).await;
    info!(device = "b", id = %id_b, "configured");
    assert_eq!(id_a, id_b);

    // B watches for changes and vetoes nothing, just logs.
    let _listener = device_b.add_change_listener(|event| {
        let source = match event.source {
            ChangeSource::Cloud => "cloud",
            ChangeSource::Manual => "manual",
        };
        info!(
            device = "b",
            previous = ?event.previous_id,
            new = %event.new_id,
            source,
            "identity changed"
        );
    })?;

    // A regenerates; the new value reaches B through the cloud push.
    let regenerated = device_a.generate_new_id()?;
    settle().await;
    info!(device = "a", id = %regenerated, "regenerated");
    assert_eq!(device_b.get_id(), Some(regenerated));

    // An explicit override propagates the same way.
    device_a.identify("demo-final-identity")?;
    settle().await;
    assert_eq!(device_b.get_id().as_deref(), Some("demo-final-identity"));
    info!(
        a = ?device_a.get_id(),
        b = ?device_b.get_id(),
        "devices converged"
    );

    device_a.reset();
    device_b.reset();
    Ok(())
}
