use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuCount(u16);

impl CpuCount {
    pub fn new(count: u16) -> Self {
        Self(count)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl Display for CpuCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Memory size in MiB, the unit every hypervisor command line takes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySize(u64);

impl MemorySize {
    pub fn from_mib(mib: u64) -> Self {
        Self(mib)
    }

    pub fn as_mib(&self) -> u64 {
        self.0
    }
}

impl Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MiB", self.0)
    }
}
