//! Host-side diagnostic entry point: discover capacity, probe the GPU,
//! and print the full status snapshot. The production daemon wires the
//! real instance/image/volume listers in from its API and storage layers;
//! this binary reports a host with no instances, which is exactly what an
//! operator wants when validating a new machine.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use hypeman::config::Settings;
use hypeman::resources::types::InstanceAllocation;
use hypeman::resources::{ImageStoreLister, InstanceLister, ResourceManager, VolumeLister};

/// Stand-in listers for a host with nothing provisioned yet.
struct NoInstances;

#[async_trait]
impl InstanceLister for NoInstances {
    async fn list_instances(&self) -> Result<Vec<InstanceAllocation>> {
        Ok(Vec::new())
    }
}

struct NoImages;

#[async_trait]
impl ImageStoreLister for NoImages {
    async fn image_bytes(&self) -> Result<u64> {
        Ok(0)
    }
    async fn oci_cache_bytes(&self) -> Result<u64> {
        Ok(0)
    }
}

struct NoVolumes;

#[async_trait]
impl VolumeLister for NoVolumes {
    async fn volume_bytes(&self) -> Result<u64> {
        Ok(0)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hypeman=info".into()),
        )
        .init();

    info!("Starting hypeman v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;
    info!(data_dir = %settings.data_dir.display(), "Configuration loaded");

    let manager = ResourceManager::new(settings);
    manager.set_instance_lister(Arc::new(NoInstances)).await;
    manager.set_image_lister(Arc::new(NoImages)).await;
    manager.set_volume_lister(Arc::new(NoVolumes)).await;
    manager.initialize().await?;

    let status = manager.get_full_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
