use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::prelude::*;

/// Runtime configuration, normally read from the environment using [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub devices: DeviceConfig,
    pub offload: OffloadConfig,
    pub halo: HaloConfig,
}

impl Config {
    pub fn new(devices: DeviceConfig, offload: OffloadConfig, halo: HaloConfig) -> Self {
        Self {
            devices,
            offload,
            halo,
        }
    }

    pub fn from_env() -> Self {
        Self {
            devices: DeviceConfig::from_env(),
            offload: OffloadConfig::from_env(),
            halo: HaloConfig::from_env(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(default(), default(), default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Limit on the number of devices that take part in offloading. `None` means all devices.
    pub num_active_devices: Option<usize>,
}

impl DeviceConfig {
    pub fn from_env() -> Self {
        let num_active_devices = match parse_var::<usize>("SHEPHERD_NUM_ACTIVE_DEVICES") {
            Some(0) | None => None,
            Some(n) => Some(n),
        };

        Self { num_active_devices }
    }
}

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// Maximum number of data maps an offload context can cache.
    pub map_cache_capacity: usize,
    /// Maximum nesting depth of offload contexts on a single device.
    pub stack_depth: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            map_cache_capacity: 64,
            stack_depth: 4,
        }
    }
}

impl OffloadConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(n) = parse_var("SHEPHERD_MAP_CACHE_SIZE") {
            out.map_cache_capacity = n;
        }

        if let Some(n) = parse_var("SHEPHERD_OFFLOAD_STACK_DEPTH") {
            out.stack_depth = n;
        }

        out
    }
}

#[derive(Debug, Clone)]
pub struct HaloConfig {
    /// How long a shepherd waits on a neighbor (relay handoff or map publication) before
    /// reporting the neighbor as stalled.
    pub timeout: Duration,
}

impl Default for HaloConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl HaloConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(ms) = parse_var::<u64>("SHEPHERD_HALO_TIMEOUT_MS") {
            info!("halo exchange timeout set to {} ms", ms);
            out.timeout = Duration::from_millis(ms);
        }

        out
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    let value = value.trim();

    if value.is_empty() {
        return None;
    }

    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("invalid value {:?} for {}, using default", value, key);
            None
        }
    }
}
