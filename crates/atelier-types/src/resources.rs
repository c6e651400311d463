use serde::{Deserialize, Serialize};

/// A vector of compute resources. Used both for system totals and for
/// per-worker allocations; all arithmetic is component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub gpu_memory_gb: f64,
    #[serde(default)]
    pub gpu_count: u32,
}

impl ResourceVector {
    pub fn new(cpu_cores: f64, memory_gb: f64, gpu_memory_gb: f64, gpu_count: u32) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            gpu_memory_gb,
            gpu_count,
        }
    }

    /// True when `self` fits inside `other` on every dimension.
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        self.cpu_cores <= other.cpu_cores
            && self.memory_gb <= other.memory_gb
            && self.gpu_memory_gb <= other.gpu_memory_gb
            && self.gpu_count <= other.gpu_count
    }

    pub fn plus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            memory_gb: self.memory_gb + other.memory_gb,
            gpu_memory_gb: self.gpu_memory_gb + other.gpu_memory_gb,
            gpu_count: self.gpu_count + other.gpu_count,
        }
    }

    /// Component-wise subtraction, saturating at zero so a double release
    /// can never drive the ledger negative.
    pub fn minus(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_cores: (self.cpu_cores - other.cpu_cores).max(0.0),
            memory_gb: (self.memory_gb - other.memory_gb).max(0.0),
            gpu_memory_gb: (self.gpu_memory_gb - other.gpu_memory_gb).max(0.0),
            gpu_count: self.gpu_count.saturating_sub(other.gpu_count),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0.0
            && self.memory_gb == 0.0
            && self.gpu_memory_gb == 0.0
            && self.gpu_count == 0
    }
}
