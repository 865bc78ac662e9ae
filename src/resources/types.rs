use serde::Serialize;

use crate::gpu::GpuStatus;

/// The four over-subscribable resource kinds. Disk I/O and GPU are adjacent
/// concepts with their own, narrower reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a capacity figure came from host probing or operator config.
/// Recorded on the network status so operators can tell when auto-detect
/// failed and the limit is a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacitySource {
    Detected,
    Configured,
}

/// Point-in-time accounting for one resource kind.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    /// Raw host number in native units (cores, bytes, bytes/sec).
    pub capacity: u64,
    /// `⌊capacity × oversub_ratio⌋` — the admission ceiling.
    pub effective_limit: u64,
    pub allocated: u64,
    /// `max(effective_limit − allocated, 0)`.
    pub available: u64,
    pub oversub_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CapacitySource>,
}

/// Instance lifecycle states as reported by the host manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Paused,
    Created,
    Stopped,
    Standby,
}

impl InstanceState {
    /// The single predicate governing aggregation: an instance counts
    /// toward `allocated` iff it is running, paused, or created.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Running | InstanceState::Paused | InstanceState::Created
        )
    }
}

/// Read-only snapshot of one instance's resource requests, supplied by the
/// host manager's instance lister.
#[derive(Debug, Clone)]
pub struct InstanceAllocation {
    pub id: String,
    pub name: String,
    pub vcpus: u64,
    /// Includes any hot-pluggable reservation.
    pub memory_bytes: u64,
    /// Rootfs overlay file size on disk.
    pub overlay_bytes: u64,
    /// Sum of attached volume overlay sizes.
    pub volume_overlay_bytes: u64,
    /// Sum of attached volume base sizes. Reported per-instance but not
    /// part of the per-instance disk aggregation (base volumes are counted
    /// once, host-wide, by the volume lister).
    pub volume_bytes: u64,
    pub network_download_bps: u64,
    pub network_upload_bps: u64,
    pub state: InstanceState,
}

impl InstanceAllocation {
    /// Contribution to the shared physical link: the larger of the two
    /// per-direction caps (a deliberate conservative over-estimate).
    pub fn network_bps(&self) -> u64 {
        self.network_download_bps.max(self.network_upload_bps)
    }

    /// Per-instance disk footprint: both overlays; base volumes excluded.
    pub fn overlay_total_bytes(&self) -> u64 {
        self.overlay_bytes + self.volume_overlay_bytes
    }
}

/// Where the data-dir bytes went. `allocated` for disk is the sum of all
/// four counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskBreakdown {
    pub images_bytes: u64,
    pub oci_cache_bytes: u64,
    pub volumes_bytes: u64,
    pub overlays_bytes: u64,
}

impl DiskBreakdown {
    pub fn total(&self) -> u64 {
        self.images_bytes + self.oci_cache_bytes + self.volumes_bytes + self.overlays_bytes
    }
}

/// One row of the `allocations` list in the full status response.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationSummary {
    pub instance_id: String,
    pub instance_name: String,
    pub cpu: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_download_bps: u64,
    pub network_upload_bps: u64,
}

impl From<&InstanceAllocation> for AllocationSummary {
    fn from(a: &InstanceAllocation) -> Self {
        Self {
            instance_id: a.id.clone(),
            instance_name: a.name.clone(),
            cpu: a.vcpus,
            memory_bytes: a.memory_bytes,
            disk_bytes: a.overlay_bytes + a.volume_overlay_bytes + a.volume_bytes,
            network_download_bps: a.network_download_bps,
            network_upload_bps: a.network_upload_bps,
        }
    }
}

/// The full status snapshot consumed by the external HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct FullStatus {
    pub cpu: ResourceStatus,
    pub memory: ResourceStatus,
    pub disk: ResourceStatus,
    pub network: ResourceStatus,
    pub disk_breakdown: DiskBreakdown,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuStatus>,
    pub allocations: Vec<AllocationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(state: InstanceState) -> InstanceAllocation {
        InstanceAllocation {
            id: "inst-1".into(),
            name: "web".into(),
            vcpus: 2,
            memory_bytes: 1 << 30,
            overlay_bytes: 100,
            volume_overlay_bytes: 50,
            volume_bytes: 500,
            network_download_bps: 1000,
            network_upload_bps: 4000,
            state,
        }
    }

    #[test]
    fn active_states_are_running_paused_created() {
        assert!(InstanceState::Running.is_active());
        assert!(InstanceState::Paused.is_active());
        assert!(InstanceState::Created.is_active());
        assert!(!InstanceState::Stopped.is_active());
        assert!(!InstanceState::Standby.is_active());
    }

    #[test]
    fn network_contribution_is_max_of_directions() {
        let i = instance(InstanceState::Running);
        assert_eq!(i.network_bps(), 4000);
    }

    #[test]
    fn overlay_total_excludes_base_volumes() {
        let i = instance(InstanceState::Running);
        assert_eq!(i.overlay_total_bytes(), 150);
    }

    #[test]
    fn allocation_summary_disk_includes_base_volumes() {
        let i = instance(InstanceState::Running);
        let s = AllocationSummary::from(&i);
        assert_eq!(s.disk_bytes, 100 + 50 + 500);
        assert_eq!(s.cpu, 2);
    }

    #[test]
    fn breakdown_total_sums_all_counters() {
        let b = DiskBreakdown {
            images_bytes: 1,
            oci_cache_bytes: 2,
            volumes_bytes: 3,
            overlays_bytes: 4,
        };
        assert_eq!(b.total(), 10);
    }

    #[test]
    fn resource_status_serializes_kind_as_type() {
        let status = ResourceStatus {
            kind: ResourceKind::Cpu,
            capacity: 8,
            effective_limit: 32,
            allocated: 6,
            available: 26,
            oversub_ratio: 4.0,
            source: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "cpu");
        assert!(json.get("source").is_none());
    }

    #[test]
    fn network_status_serializes_source() {
        let status = ResourceStatus {
            kind: ResourceKind::Network,
            capacity: 125_000_000,
            effective_limit: 250_000_000,
            allocated: 0,
            available: 250_000_000,
            oversub_ratio: 2.0,
            source: Some(CapacitySource::Detected),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["source"], "detected");
    }
}
