use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use atelier_types::{ResourceVector, WorkerType};

/// Static per-worker-type resource requirements.
pub fn requirements_for(worker_type: WorkerType) -> ResourceVector {
    match worker_type {
        WorkerType::General => ResourceVector::new(1.0, 2.0, 0.0, 0),
        WorkerType::Gpu => ResourceVector::new(2.0, 4.0, 8.0, 1),
        WorkerType::Cpu => ResourceVector::new(2.0, 3.0, 0.0, 0),
        WorkerType::Io => ResourceVector::new(0.5, 1.0, 0.0, 0),
    }
}

/// A live reservation against the ledger. Releasing it (by value or by id)
/// returns the full vector; release is idempotent.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: String,
    pub worker_type: WorkerType,
    pub resources: ResourceVector,
}

#[derive(Default)]
struct LedgerInner {
    allocated: ResourceVector,
    live: HashMap<String, ResourceVector>,
}

/// Authoritative record of total versus allocated compute. All four
/// dimensions move together under one lock; `can_admit` is advisory and
/// `allocate` re-checks before committing.
pub struct ResourceLedger {
    totals: ResourceVector,
    inner: Mutex<LedgerInner>,
}

impl ResourceLedger {
    pub fn new(totals: ResourceVector) -> Self {
        Self {
            totals,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Discover host CPU and memory totals; GPU capacity comes from
    /// configuration since it cannot be probed portably.
    pub fn discover(gpu_memory_gb: f64, gpu_count: u32) -> Self {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.refresh_cpu();
        let cpu_cores = system.cpus().len().max(1) as f64;
        let memory_gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        Self::new(ResourceVector::new(
            cpu_cores,
            memory_gb,
            gpu_memory_gb,
            gpu_count,
        ))
    }

    pub fn totals(&self) -> ResourceVector {
        self.totals
    }

    pub async fn allocated(&self) -> ResourceVector {
        self.inner.lock().await.allocated
    }

    pub async fn available(&self) -> ResourceVector {
        let allocated = self.inner.lock().await.allocated;
        self.totals.minus(&allocated)
    }

    /// Advisory check; the answer can be stale by the time a spawn happens.
    pub async fn can_admit(&self, worker_type: WorkerType) -> bool {
        let required = requirements_for(worker_type);
        let allocated = self.inner.lock().await.allocated;
        required.fits_within(&self.totals.minus(&allocated))
    }

    /// Reserve resources for a worker. Fails when the re-check under the
    /// lock finds the capacity gone.
    pub async fn allocate(&self, worker_type: WorkerType) -> Option<Allocation> {
        let required = requirements_for(worker_type);
        let mut inner = self.inner.lock().await;
        if !required.fits_within(&self.totals.minus(&inner.allocated)) {
            return None;
        }
        inner.allocated = inner.allocated.plus(&required);
        let id = format!("alloc_{}", uuid::Uuid::new_v4().simple());
        inner.live.insert(id.clone(), required);
        debug!(allocation = %id, worker_type = worker_type.as_str(), "resources allocated");
        Some(Allocation {
            id,
            worker_type,
            resources: required,
        })
    }

    pub async fn release(&self, allocation: &Allocation) {
        self.release_by_id(&allocation.id).await;
    }

    /// Release by id; unknown or already-released ids are ignored.
    pub async fn release_by_id(&self, allocation_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.live.remove(allocation_id) {
            Some(resources) => {
                inner.allocated = inner.allocated.minus(&resources);
                debug!(allocation = %allocation_id, "resources released");
                true
            }
            None => false,
        }
    }

    pub async fn live_allocations(&self) -> usize {
        self.inner.lock().await.live.len()
    }
}
