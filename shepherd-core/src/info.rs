use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::str::FromStr;

/// Global identifier of a device within a device registry.
///
/// Not to be confused with the *sequence id* of a device, which is its position inside one
/// particular grid topology.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn new(index: usize) -> Self {
        DeviceId(index as u32)
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceId").field(&self.0).finish()
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of hardware (or simulation) behind a device.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[serde(alias = "cpu")]
    HostCpu,
    #[serde(alias = "thsim")]
    ThreadSimulated,
    #[serde(alias = "nvgpu")]
    CudaGpu,
    #[serde(alias = "opencl")]
    OpenClGpu,
    #[serde(alias = "itlmic")]
    Mic,
    #[serde(alias = "mpi")]
    Remote,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 6] = [
        DeviceKind::HostCpu,
        DeviceKind::ThreadSimulated,
        DeviceKind::CudaGpu,
        DeviceKind::OpenClGpu,
        DeviceKind::Mic,
        DeviceKind::Remote,
    ];

    pub fn short_name(&self) -> &'static str {
        match self {
            DeviceKind::HostCpu => "HOSTCPU",
            DeviceKind::ThreadSimulated => "THSIM",
            DeviceKind::CudaGpu => "NVCUDA",
            DeviceKind::OpenClGpu => "OPENCL",
            DeviceKind::Mic => "ITLMIC",
            DeviceKind::Remote => "MPI",
        }
    }

    /// Memory organisation of this kind of device unless overridden by its spec.
    pub fn default_memory(&self) -> MemoryKind {
        match self {
            DeviceKind::HostCpu => MemoryKind::Shared,
            _ => MemoryKind::Discrete,
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown device kind {0:?}")]
pub struct UnknownDeviceKind(pub String);

impl FromStr for DeviceKind {
    type Err = UnknownDeviceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "hostcpu" => DeviceKind::HostCpu,
            "thsim" | "threadsimulated" => DeviceKind::ThreadSimulated,
            "nvgpu" | "nvcuda" | "cudagpu" => DeviceKind::CudaGpu,
            "opencl" | "nvcl" | "itlgpu" | "openclgpu" => DeviceKind::OpenClGpu,
            "itlmic" | "mic" => DeviceKind::Mic,
            "mpi" | "remote" => DeviceKind::Remote,
            other => return Err(UnknownDeviceKind(other.to_string())),
        };

        Ok(kind)
    }
}

/// Whether a device can address host memory directly (`Shared`) or has its own separate
/// memory space that must be filled using explicit copies (`Discrete`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Shared,
    Discrete,
}

impl MemoryKind {
    #[inline]
    pub fn is_discrete(&self) -> bool {
        *self == MemoryKind::Discrete
    }
}

/// Performance figures of a device, used by the model-driven balancing policies.
#[derive(Copy, Clone, PartialEq, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct DevicePerf {
    /// Sustained floating-point throughput in GFLOP/s.
    pub flopss: f64,
    /// Host-device bandwidth in MB/s.
    pub bandwidth: f64,
    /// Host-device latency in microseconds.
    pub latency: f64,
}

impl Default for DevicePerf {
    fn default() -> Self {
        Self {
            flopss: 1.0,
            bandwidth: 1.0,
            latency: 0.0,
        }
    }
}

/// Description of one or more identical devices.
///
/// This is the in-memory form of a device descriptor entry. When `count > 1` the spec expands
/// into `count` devices with consecutive system ids starting at `sysid`.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub sysid: i32,
    #[serde(default = "one")]
    pub count: usize,
    #[serde(default = "one")]
    pub num_cores: usize,
    #[serde(default)]
    pub memory: Option<MemoryKind>,
    #[serde(default = "yes")]
    pub peer_access: bool,
    #[serde(default)]
    pub perf: DevicePerf,
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            sysid: 0,
            count: 1,
            num_cores: 1,
            memory: None,
            peer_access: true,
            perf: default(),
        }
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn memory(mut self, memory: MemoryKind) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn peer_access(mut self, enabled: bool) -> Self {
        self.peer_access = enabled;
        self
    }

    pub fn perf(mut self, perf: DevicePerf) -> Self {
        self.perf = perf;
        self
    }

    pub fn memory_kind(&self) -> MemoryKind {
        self.memory.unwrap_or_else(|| self.kind.default_memory())
    }
}

/// Static information about one concrete device, as held by the registry.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub sysid: i32,
    pub name: String,
    pub kind: DeviceKind,
    pub memory: MemoryKind,
    pub num_cores: usize,
    pub perf: DevicePerf,
}

impl Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mem = match self.memory {
            MemoryKind::Shared => "SHARED",
            MemoryKind::Discrete => "DISCRETE",
        };

        write!(
            f,
            "{}|sysid: {}, type: {}, name: {}, ncores: {}, mem: {}, flops: {:.2}GFLOPS/s, \
             bandwidth: {:.2}MB/s, latency: {:.2}us",
            self.id,
            self.sysid,
            self.kind,
            self.name,
            self.num_cores,
            mem,
            self.perf.flopss,
            self.perf.bandwidth,
            self.perf.latency
        )
    }
}
