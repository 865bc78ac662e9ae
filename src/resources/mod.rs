pub mod parse;
pub mod probes;
pub mod types;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Settings;
use crate::gpu;
use probes::{
    AllocationSnapshot, CpuProbe, DiskProbe, HostReader, MemoryProbe, NetworkProbe, Probe,
    ProcReader,
};
use types::{FullStatus, InstanceAllocation, ResourceKind, ResourceStatus};

/// Image pulls are refused once effective disk availability drops below this.
pub const MIN_PULL_DISK_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Pull-based view of live instances, supplied by the host manager.
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<InstanceAllocation>>;
}

/// Pull-based view of exported rootfs images and the OCI layer cache.
#[async_trait]
pub trait ImageStoreLister: Send + Sync {
    async fn image_bytes(&self) -> Result<u64>;
    async fn oci_cache_bytes(&self) -> Result<u64>;
}

/// Pull-based view of base volume storage.
#[async_trait]
pub trait VolumeLister: Send + Sync {
    async fn volume_bytes(&self) -> Result<u64>;
}

/// Admission failures; the API layer surfaces these strings verbatim.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("insufficient disk space for image pull: {available} bytes available, minimum {required} bytes required")]
    InsufficientDiskForPull { available: u64, required: u64 },
    #[error("image storage limit reached: {current} bytes in use, limit {limit} bytes ({fraction} of disk capacity)")]
    ImageStorageFull {
        current: u64,
        limit: u64,
        fraction: f64,
    },
}

struct Probes {
    cpu: CpuProbe,
    memory: MemoryProbe,
    disk: DiskProbe,
    network: NetworkProbe,
}

impl Probes {
    fn get(&self, kind: ResourceKind) -> &dyn Probe {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Memory => &self.memory,
            ResourceKind::Disk => &self.disk,
            ResourceKind::Network => &self.network,
        }
    }
}

#[derive(Default)]
struct Inner {
    probes: Option<Probes>,
    instances: Option<Arc<dyn InstanceLister>>,
    images: Option<Arc<dyn ImageStoreLister>>,
    volumes: Option<Arc<dyn VolumeLister>>,
}

/// Composes the capacity probes, oversubscription ratios, and the three
/// external views; answers status and admission queries.
///
/// Cloning is cheap — clones share the same underlying state via `Arc`.
/// Install the listers before calling [`initialize`](Self::initialize);
/// everything after initialization is read-mostly and safe under
/// concurrent readers.
#[derive(Clone)]
pub struct ResourceManager {
    settings: Arc<Settings>,
    reader: Arc<dyn HostReader>,
    inner: Arc<RwLock<Inner>>,
}

impl ResourceManager {
    pub fn new(settings: Settings) -> Self {
        Self::with_reader(settings, Arc::new(ProcReader))
    }

    /// Construct with an injected host reader (tests use synthetic hosts).
    pub fn with_reader(settings: Settings, reader: Arc<dyn HostReader>) -> Self {
        Self {
            settings: Arc::new(settings),
            reader,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub async fn set_instance_lister(&self, lister: Arc<dyn InstanceLister>) {
        self.inner.write().await.instances = Some(lister);
    }

    pub async fn set_image_lister(&self, lister: Arc<dyn ImageStoreLister>) {
        self.inner.write().await.images = Some(lister);
    }

    pub async fn set_volume_lister(&self, lister: Arc<dyn VolumeLister>) {
        self.inner.write().await.volumes = Some(lister);
    }

    /// Discover host capacity. Probes are constructed CPU → memory → disk →
    /// network; the first construction error aborts initialization and the
    /// manager stays unusable.
    pub async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let reader = self.reader.as_ref();

        let cpu = CpuProbe::new(reader).context("cpu probe initialization failed")?;
        let memory = MemoryProbe::new(reader).context("memory probe initialization failed")?;
        let disk = DiskProbe::new(reader, &self.settings.data_dir, self.settings.disk_limit)
            .context("disk probe initialization failed")?;
        let network = NetworkProbe::new(
            reader,
            self.settings.network_limit,
            self.settings.uplink_interface.as_deref(),
        );

        info!(
            cpu = cpu.capacity(),
            memory_bytes = memory.capacity(),
            disk_bytes = disk.capacity(),
            network_bps = network.capacity(),
            "host capacity discovered"
        );

        inner.probes = Some(Probes {
            cpu,
            memory,
            disk,
            network,
        });
        Ok(())
    }

    fn probes(inner: &Inner) -> Result<&Probes> {
        inner
            .probes
            .as_ref()
            .context("resource manager is not initialized")
    }

    /// Gather the live allocation snapshot. Storage listers are only
    /// consulted when the caller needs disk accounting.
    async fn snapshot(inner: &Inner, include_storage: bool) -> Result<AllocationSnapshot> {
        let instances = inner
            .instances
            .as_ref()
            .context("instance lister not installed")?;
        let mut snapshot = AllocationSnapshot {
            instances: instances
                .list_instances()
                .await
                .context("instance lister failed")?,
            ..Default::default()
        };

        if include_storage {
            let images = inner.images.as_ref().context("image lister not installed")?;
            snapshot.images_bytes = images.image_bytes().await.context("image lister failed")?;
            snapshot.oci_cache_bytes = images
                .oci_cache_bytes()
                .await
                .context("image lister failed")?;
            let volumes = inner
                .volumes
                .as_ref()
                .context("volume lister not installed")?;
            snapshot.volumes_bytes = volumes
                .volume_bytes()
                .await
                .context("volume lister failed")?;
        }
        Ok(snapshot)
    }

    /// Like [`snapshot`](Self::snapshot) but degrades per failing view:
    /// the full status report must not fail just because one lister did.
    async fn snapshot_tolerant(inner: &Inner) -> AllocationSnapshot {
        let mut snapshot = AllocationSnapshot::default();

        match &inner.instances {
            Some(lister) => match lister.list_instances().await {
                Ok(instances) => snapshot.instances = instances,
                Err(e) => warn!(error = %e, "instance lister failed; reporting empty allocation list"),
            },
            None => warn!("instance lister not installed; reporting empty allocation list"),
        }

        if let Some(images) = &inner.images {
            match images.image_bytes().await {
                Ok(v) => snapshot.images_bytes = v,
                Err(e) => warn!(error = %e, "image lister failed"),
            }
            match images.oci_cache_bytes().await {
                Ok(v) => snapshot.oci_cache_bytes = v,
                Err(e) => warn!(error = %e, "image lister failed"),
            }
        }
        if let Some(volumes) = &inner.volumes {
            match volumes.volume_bytes().await {
                Ok(v) => snapshot.volumes_bytes = v,
                Err(e) => warn!(error = %e, "volume lister failed"),
            }
        }
        snapshot
    }

    fn status_for(&self, probe: &dyn Probe, snapshot: &AllocationSnapshot) -> ResourceStatus {
        let kind = probe.kind();
        let capacity = probe.capacity();
        let ratio = self.settings.oversub(kind);
        let effective_limit = scale(capacity, ratio);
        let allocated = probe.allocated(snapshot);
        ResourceStatus {
            kind,
            capacity,
            effective_limit,
            allocated,
            available: effective_limit.saturating_sub(allocated),
            oversub_ratio: ratio,
            source: (kind == ResourceKind::Network).then(|| probe.source()),
        }
    }

    /// Current accounting for one resource kind. View failures propagate.
    pub async fn get_status(&self, kind: ResourceKind) -> Result<ResourceStatus> {
        let inner = self.inner.read().await;
        let probes = Self::probes(&inner)?;
        let snapshot = Self::snapshot(&inner, kind == ResourceKind::Disk).await?;
        Ok(self.status_for(probes.get(kind), &snapshot))
    }

    /// The complete snapshot consumed by the API layer: every kind, the
    /// disk breakdown, GPU status, and the active allocation list. View
    /// failures degrade (empty list / zero counters) rather than erroring.
    pub async fn get_full_status(&self) -> Result<FullStatus> {
        let inner = self.inner.read().await;
        let probes = Self::probes(&inner)?;
        let snapshot = Self::snapshot_tolerant(&inner).await;

        Ok(FullStatus {
            cpu: self.status_for(probes.get(ResourceKind::Cpu), &snapshot),
            memory: self.status_for(probes.get(ResourceKind::Memory), &snapshot),
            disk: self.status_for(probes.get(ResourceKind::Disk), &snapshot),
            network: self.status_for(probes.get(ResourceKind::Network), &snapshot),
            disk_breakdown: probes.disk.breakdown(&snapshot),
            gpu: gpu::detect(),
            allocations: snapshot.active().map(Into::into).collect(),
        })
    }

    /// Whether `amount` more of `kind` fits under the effective limit.
    pub async fn can_allocate(&self, kind: ResourceKind, amount: u64) -> Result<bool> {
        Ok(amount <= self.get_status(kind).await?.available)
    }

    /// Symmetric per-instance network rates proportional to the vCPU share
    /// of the effective network capacity. Zero CPU or network capacity
    /// yields (0, 0).
    pub async fn default_network_bandwidth(&self, vcpus: u64) -> Result<(u64, u64)> {
        let inner = self.inner.read().await;
        let probes = Self::probes(&inner)?;
        let rate = proportional_rate(
            vcpus,
            probes.network.capacity(),
            self.settings.oversub_network,
            probes.cpu.capacity(),
        );
        Ok((rate, rate))
    }

    /// The proportional network rates plus their burst ceilings, the shape
    /// the traffic-control layer programs.
    pub async fn default_network_bandwidth_with_burst(&self, vcpus: u64) -> Result<NetworkRates> {
        let (download_bps, upload_bps) = self.default_network_bandwidth(vcpus).await?;
        Ok(NetworkRates {
            download_bps,
            upload_bps,
            download_burst_bps: download_bps * self.settings.download_burst_multiplier,
            upload_burst_bps: upload_bps * self.settings.upload_burst_multiplier,
        })
    }

    /// Per-instance disk I/O rate `(sustained, burst)` in bytes/sec, the
    /// same proportional formula against the configured disk I/O capacity.
    pub async fn default_disk_io_bandwidth(&self, vcpus: u64) -> Result<(u64, u64)> {
        let inner = self.inner.read().await;
        let probes = Self::probes(&inner)?;
        let sustained = proportional_rate(
            vcpus,
            self.settings.disk_io_limit,
            self.settings.oversub_disk_io,
            probes.cpu.capacity(),
        );
        Ok((sustained, sustained * 4))
    }

    /// Refuse image pulls when effective disk availability is below 5 GiB.
    pub async fn has_sufficient_disk_for_pull(&self) -> Result<()> {
        let status = self.get_status(ResourceKind::Disk).await?;
        if status.available < MIN_PULL_DISK_BYTES {
            bail!(AdmissionError::InsufficientDiskForPull {
                available: status.available,
                required: MIN_PULL_DISK_BYTES,
            });
        }
        Ok(())
    }

    /// `⌊disk capacity × MAX_IMAGE_STORAGE⌋`.
    pub async fn max_image_storage_bytes(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        let probes = Self::probes(&inner)?;
        Ok(scale(probes.disk.capacity(), self.settings.max_image_storage))
    }

    /// Bytes currently spent on exported images plus the OCI layer cache.
    pub async fn current_image_storage_bytes(&self) -> Result<u64> {
        let inner = self.inner.read().await;
        let images = inner.images.as_ref().context("image lister not installed")?;
        Ok(images.image_bytes().await? + images.oci_cache_bytes().await?)
    }

    /// Refuse further image pulls once the image-storage budget is spent.
    pub async fn has_sufficient_image_storage(&self) -> Result<()> {
        let limit = self.max_image_storage_bytes().await?;
        let current = self.current_image_storage_bytes().await?;
        if limit > 0 && current >= limit {
            bail!(AdmissionError::ImageStorageFull {
                current,
                limit,
                fraction: self.settings.max_image_storage,
            });
        }
        Ok(())
    }
}

/// Per-instance network defaults with burst ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkRates {
    pub download_bps: u64,
    pub upload_bps: u64,
    pub download_burst_bps: u64,
    pub upload_burst_bps: u64,
}

/// `⌊capacity × ratio⌋`, with the zero-capacity short circuit.
fn scale(capacity: u64, ratio: f64) -> u64 {
    if capacity == 0 {
        return 0;
    }
    (capacity as f64 * ratio).floor() as u64
}

/// `⌊vcpus × ⌊capacity × ratio⌋ ÷ cpu_capacity⌋`; 0 when either capacity
/// is 0.
fn proportional_rate(vcpus: u64, capacity: u64, ratio: f64, cpu_capacity: u64) -> u64 {
    if capacity == 0 || cpu_capacity == 0 {
        return 0;
    }
    let effective = scale(capacity, ratio);
    ((vcpus as u128 * effective as u128) / cpu_capacity as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::probes::tests::{instance, FakeReader};
    use super::types::InstanceState;
    use super::*;

    struct StaticInstances(Vec<InstanceAllocation>);

    #[async_trait]
    impl InstanceLister for StaticInstances {
        async fn list_instances(&self) -> Result<Vec<InstanceAllocation>> {
            Ok(self.0.clone())
        }
    }

    struct FailingInstances;

    #[async_trait]
    impl InstanceLister for FailingInstances {
        async fn list_instances(&self) -> Result<Vec<InstanceAllocation>> {
            bail!("database unavailable")
        }
    }

    struct StaticImages {
        images: u64,
        oci_cache: u64,
    }

    #[async_trait]
    impl ImageStoreLister for StaticImages {
        async fn image_bytes(&self) -> Result<u64> {
            Ok(self.images)
        }
        async fn oci_cache_bytes(&self) -> Result<u64> {
            Ok(self.oci_cache)
        }
    }

    struct StaticVolumes(u64);

    #[async_trait]
    impl VolumeLister for StaticVolumes {
        async fn volume_bytes(&self) -> Result<u64> {
            Ok(self.0)
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    /// FakeReader defaults: 8 CPUs, 16 MiB RAM, 4 GiB disk, 1 Gb/s uplink.
    async fn manager_with(
        settings: Settings,
        instances: Vec<InstanceAllocation>,
    ) -> ResourceManager {
        let manager = ResourceManager::with_reader(settings, Arc::new(FakeReader::default()));
        manager
            .set_instance_lister(Arc::new(StaticInstances(instances)))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 0,
                oci_cache: 0,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(0))).await;
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn cpu_status_end_to_end() {
        let settings = Settings {
            oversub_cpu: 2.0,
            ..Settings::default()
        };
        let manager = manager_with(
            settings,
            vec![
                instance("a", 4, 0, InstanceState::Running),
                instance("b", 2, 0, InstanceState::Created),
            ],
        )
        .await;

        let status = manager.get_status(ResourceKind::Cpu).await.unwrap();
        assert_eq!(status.capacity, 8);
        assert_eq!(status.effective_limit, 16);
        assert_eq!(status.allocated, 6);
        assert_eq!(status.available, 10);
        assert_eq!(status.oversub_ratio, 2.0);
        assert!(status.source.is_none());
    }

    #[tokio::test]
    async fn status_fails_before_initialize() {
        let manager =
            ResourceManager::with_reader(Settings::default(), Arc::new(FakeReader::default()));
        assert!(manager.get_status(ResourceKind::Cpu).await.is_err());
    }

    #[tokio::test]
    async fn available_never_goes_negative() {
        let settings = Settings {
            oversub_memory: 1.0,
            ..Settings::default()
        };
        // FakeReader reports 16 MiB of RAM; allocate far more.
        let manager = manager_with(
            settings,
            vec![instance("a", 0, 1 << 30, InstanceState::Running)],
        )
        .await;
        let status = manager.get_status(ResourceKind::Memory).await.unwrap();
        assert_eq!(status.available, 0);
        assert_eq!(status.allocated, 1 << 30);
    }

    #[tokio::test]
    async fn get_status_propagates_view_failure() {
        let manager =
            ResourceManager::with_reader(Settings::default(), Arc::new(FakeReader::default()));
        manager
            .set_instance_lister(Arc::new(FailingInstances))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 0,
                oci_cache: 0,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(0))).await;
        manager.initialize().await.unwrap();

        assert!(manager.get_status(ResourceKind::Cpu).await.is_err());
    }

    #[tokio::test]
    async fn full_status_tolerates_view_failure() {
        let manager =
            ResourceManager::with_reader(Settings::default(), Arc::new(FakeReader::default()));
        manager
            .set_instance_lister(Arc::new(FailingInstances))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 123,
                oci_cache: 45,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(6))).await;
        manager.initialize().await.unwrap();

        let full = manager.get_full_status().await.unwrap();
        assert!(full.allocations.is_empty());
        assert_eq!(full.disk_breakdown.images_bytes, 123);
        assert_eq!(full.disk_breakdown.oci_cache_bytes, 45);
        assert_eq!(full.disk_breakdown.volumes_bytes, 6);
        assert_eq!(full.cpu.allocated, 0);
    }

    #[tokio::test]
    async fn full_status_filters_inactive_instances() {
        let manager = manager_with(
            Settings::default(),
            vec![
                instance("up", 2, 0, InstanceState::Running),
                instance("down", 4, 0, InstanceState::Stopped),
            ],
        )
        .await;

        let full = manager.get_full_status().await.unwrap();
        assert_eq!(full.allocations.len(), 1);
        assert_eq!(full.allocations[0].instance_id, "up");
        assert_eq!(full.network.source, Some(types::CapacitySource::Detected));
    }

    #[tokio::test]
    async fn full_status_serializes_wire_shape() {
        let manager = manager_with(
            Settings::default(),
            vec![instance("a", 1, 1024, InstanceState::Running)],
        )
        .await;
        let full = manager.get_full_status().await.unwrap();
        let json = serde_json::to_value(&full).unwrap();

        for kind in ["cpu", "memory", "disk", "network"] {
            for field in [
                "type",
                "capacity",
                "effective_limit",
                "allocated",
                "available",
                "oversub_ratio",
            ] {
                assert!(json[kind].get(field).is_some(), "{kind}.{field} missing");
            }
        }
        assert!(json["disk_breakdown"].get("overlays_bytes").is_some());
        assert_eq!(json["allocations"][0]["instance_id"], "a");
        assert_eq!(json["allocations"][0]["cpu"], 1);
    }

    #[tokio::test]
    async fn can_allocate_compares_against_available() {
        let settings = Settings {
            oversub_cpu: 2.0,
            ..Settings::default()
        };
        let manager = manager_with(
            settings,
            vec![instance("a", 6, 0, InstanceState::Running)],
        )
        .await;
        // effective = 16, allocated = 6, available = 10
        assert!(manager.can_allocate(ResourceKind::Cpu, 10).await.unwrap());
        assert!(!manager.can_allocate(ResourceKind::Cpu, 11).await.unwrap());
    }

    // -----------------------------------------------------------------------
    // proportional defaults
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn default_network_bandwidth_is_proportional() {
        // FakeReader uplink: 1000 Mb/s → 125 MB/s; ratio 2.0 → 250 MB/s
        // effective; 8 CPUs. 2 vCPUs → 62_500_000.
        let manager = manager_with(Settings::default(), vec![]).await;
        let (down, up) = manager.default_network_bandwidth(2).await.unwrap();
        assert_eq!(down, 62_500_000);
        assert_eq!(up, down);
    }

    #[tokio::test]
    async fn default_network_bandwidth_zero_when_undetected() {
        let reader = FakeReader {
            default_route: Err(std::io::Error::new(std::io::ErrorKind::NotFound, "none")),
            ..Default::default()
        };
        let manager = ResourceManager::with_reader(Settings::default(), Arc::new(reader));
        manager
            .set_instance_lister(Arc::new(StaticInstances(vec![])))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 0,
                oci_cache: 0,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(0))).await;
        manager.initialize().await.unwrap();

        assert_eq!(
            manager.default_network_bandwidth(4).await.unwrap(),
            (0, 0)
        );
    }

    #[tokio::test]
    async fn default_network_bandwidth_is_idempotent() {
        let manager = manager_with(Settings::default(), vec![]).await;
        let first = manager.default_network_bandwidth(3).await.unwrap();
        let second = manager.default_network_bandwidth(3).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn burst_rates_apply_multipliers() {
        let settings = Settings {
            upload_burst_multiplier: 4,
            download_burst_multiplier: 2,
            ..Settings::default()
        };
        let manager = manager_with(settings, vec![]).await;
        let rates = manager.default_network_bandwidth_with_burst(2).await.unwrap();
        assert_eq!(rates.download_burst_bps, rates.download_bps * 2);
        assert_eq!(rates.upload_burst_bps, rates.upload_bps * 4);
    }

    #[tokio::test]
    async fn default_disk_io_bandwidth_proportional_with_burst() {
        // 1 GiB/s capacity × 2.0 ratio = 2 GiB/s effective; 8 CPUs.
        let manager = manager_with(Settings::default(), vec![]).await;
        let (sustained, burst) = manager.default_disk_io_bandwidth(4).await.unwrap();
        assert_eq!(sustained, 2 * GIB / 2);
        assert_eq!(burst, sustained * 4);
    }

    // -----------------------------------------------------------------------
    // admission
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn disk_pull_admission_fails_below_5gib() {
        // FakeReader disk: 4 GiB total — below the floor even when empty.
        let manager = manager_with(Settings::default(), vec![]).await;
        let err = manager.has_sufficient_disk_for_pull().await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("insufficient disk space for image pull"), "{msg}");
        assert!(msg.contains("5368709120"), "{msg}");
    }

    #[tokio::test]
    async fn disk_pull_admission_passes_with_headroom() {
        let settings = Settings {
            disk_limit: Some(100 * GIB),
            ..Settings::default()
        };
        let manager = manager_with(settings, vec![]).await;
        manager.has_sufficient_disk_for_pull().await.unwrap();
    }

    #[tokio::test]
    async fn image_storage_limit_is_fraction_of_capacity() {
        let settings = Settings {
            disk_limit: Some(500 * GIB),
            max_image_storage: 0.2,
            ..Settings::default()
        };
        let manager = manager_with(settings, vec![]).await;
        assert_eq!(
            manager.max_image_storage_bytes().await.unwrap(),
            100 * GIB
        );
    }

    #[tokio::test]
    async fn image_storage_admission() {
        let settings = Settings {
            disk_limit: Some(500 * GIB),
            max_image_storage: 0.2,
            ..Settings::default()
        };
        // images + cache = 75 GiB < 100 GiB limit → passes
        let manager = ResourceManager::with_reader(settings.clone(), Arc::new(FakeReader::default()));
        manager
            .set_instance_lister(Arc::new(StaticInstances(vec![])))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 50 * GIB,
                oci_cache: 25 * GIB,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(0))).await;
        manager.initialize().await.unwrap();

        assert_eq!(
            manager.current_image_storage_bytes().await.unwrap(),
            75 * GIB
        );
        manager.has_sufficient_image_storage().await.unwrap();

        // at the limit → fails
        let full = ResourceManager::with_reader(settings, Arc::new(FakeReader::default()));
        full.set_instance_lister(Arc::new(StaticInstances(vec![])))
            .await;
        full.set_image_lister(Arc::new(StaticImages {
            images: 80 * GIB,
            oci_cache: 20 * GIB,
        }))
        .await;
        full.set_volume_lister(Arc::new(StaticVolumes(0))).await;
        full.initialize().await.unwrap();

        let err = full.has_sufficient_image_storage().await.unwrap_err();
        assert!(err.to_string().contains("image storage limit reached"));
    }

    // -----------------------------------------------------------------------
    // aggregation invariants
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn disk_allocated_sums_breakdown() {
        let settings = Settings {
            disk_limit: Some(100 * GIB),
            ..Settings::default()
        };
        let mut a = instance("a", 1, 0, InstanceState::Running);
        a.overlay_bytes = 10;
        a.volume_overlay_bytes = 5;
        let manager = ResourceManager::with_reader(settings, Arc::new(FakeReader::default()));
        manager
            .set_instance_lister(Arc::new(StaticInstances(vec![a])))
            .await;
        manager
            .set_image_lister(Arc::new(StaticImages {
                images: 100,
                oci_cache: 20,
            }))
            .await;
        manager.set_volume_lister(Arc::new(StaticVolumes(7))).await;
        manager.initialize().await.unwrap();

        let status = manager.get_status(ResourceKind::Disk).await.unwrap();
        assert_eq!(status.allocated, 100 + 20 + 7 + 15);
    }

    #[tokio::test]
    async fn network_allocated_uses_max_direction() {
        let mut a = instance("a", 1, 0, InstanceState::Running);
        a.network_download_bps = 9_000;
        a.network_upload_bps = 1_000;
        let mut b = instance("b", 1, 0, InstanceState::Paused);
        b.network_download_bps = 2_000;
        b.network_upload_bps = 3_000;
        let manager = manager_with(Settings::default(), vec![a, b]).await;
        let status = manager.get_status(ResourceKind::Network).await.unwrap();
        assert_eq!(status.allocated, 12_000);
    }
}
