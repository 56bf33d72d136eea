//! Devices and the registry that owns them.
//!
//! The [`DeviceRegistry`] is constructed once by the embedder and shared (by reference) by all
//! offloads. Every device has a [`DeviceBackend`] that performs the actual allocations and
//! copies, the registry routes copies between arbitrary [`MemRegion`]s to the right backend.
mod backend;
mod memory;
mod simulated;

pub use backend::{BackendError, DeviceBackend, DevicePtr, StreamId};
pub use memory::{Element, HostArray, HostBuffer, HostRegion, MemRegion, MemoryError};
pub use simulated::SimulatedBackend;

use std::fmt::{self, Debug};

use crate::offload::OffloadStack;
use crate::prelude::*;
use crate::types::{Config, DeviceId, DeviceInfo, DeviceKind, DeviceSpec, MemoryKind};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("no backend available for devices of kind {0}")]
    NoBackend(DeviceKind),

    #[error("device spec {0:?} describes zero devices")]
    EmptySpec(String),

    #[error("device {name:?} ({kind}) is not available: {source}")]
    ProbeFailed {
        name: String,
        kind: DeviceKind,
        source: BackendError,
    },

    #[error("cannot copy {src} bytes into a region of {dst} bytes")]
    SizeMismatch { dst: usize, src: usize },
}

pub struct Device {
    info: DeviceInfo,
    peer_access: bool,
    backend: Arc<dyn DeviceBackend>,
    stack: OffloadStack,
}

impl Device {
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    #[inline]
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    #[inline]
    pub fn kind(&self) -> DeviceKind {
        self.info.kind
    }

    #[inline]
    pub fn memory(&self) -> MemoryKind {
        self.info.memory
    }

    #[inline]
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Stack of offloads currently active on this device.
    #[inline]
    pub fn stack(&self) -> &OffloadStack {
        &self.stack
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("peer_access", &self.peer_access)
            .field("backend", &self.backend)
            .finish()
    }
}

pub struct DeviceRegistry {
    config: Config,
    devices: Vec<Device>,
    peer_matrix: Mutex<HashMap<(DeviceId, DeviceId), bool>>,
}

impl DeviceRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            devices: vec![],
            peer_matrix: default(),
        }
    }

    /// Build a registry from a list of device specs. Only simulated kinds have a backend
    /// available in this crate, use [`DeviceRegistry::register_with`] for the others.
    pub fn from_specs(specs: &[DeviceSpec], config: Config) -> Result<Self> {
        let mut registry = Self::new(config);
        for spec in specs {
            registry.register(spec)?;
        }

        registry.log_summary();
        Ok(registry)
    }

    /// Build a registry from a JSON list of device specs.
    pub fn from_json(json: &str, config: Config) -> Result<Self> {
        let specs: Vec<DeviceSpec> =
            serde_json::from_str(json).context("failed to parse device specs")?;
        Self::from_specs(&specs, config)
    }

    /// Register the devices described by `spec`, backed by simulated backends.
    pub fn register(&mut self, spec: &DeviceSpec) -> Result<Vec<DeviceId>> {
        if !SimulatedBackend::is_supported(spec.kind) {
            return Err(RegistryError::NoBackend(spec.kind).into());
        }

        self.register_with(spec, |_| {
            let backend: Arc<dyn DeviceBackend> = Arc::new(SimulatedBackend::new(spec.kind));
            Ok(backend)
        })
    }

    /// Register the devices described by `spec`. The function `backend` is invoked once per
    /// device with the system id of that device.
    pub fn register_with<F>(
        &mut self,
        spec: &DeviceSpec,
        mut backend: F,
    ) -> Result<Vec<DeviceId>>
    where
        F: FnMut(i32) -> Result<Arc<dyn DeviceBackend>>,
    {
        if spec.count == 0 {
            return Err(RegistryError::EmptySpec(spec.name.clone()).into());
        }

        let mut ids = vec![];

        for i in 0..spec.count {
            let sysid = spec.sysid + i as i32;
            let backend = backend(sysid)?;

            if let Err(source) = backend.probe() {
                return Err(RegistryError::ProbeFailed {
                    name: spec.name.clone(),
                    kind: spec.kind,
                    source,
                }
                .into());
            }

            let id = DeviceId::new(self.devices.len());
            let name = if spec.count > 1 {
                format!("{}:{}", spec.name, i)
            } else {
                spec.name.clone()
            };

            let info = DeviceInfo {
                id,
                sysid,
                name,
                kind: spec.kind,
                memory: spec.memory_kind(),
                num_cores: spec.num_cores,
                perf: spec.perf,
            };

            debug!("registered device {}", info);

            self.devices.push(Device {
                info,
                peer_access: spec.peer_access,
                backend,
                stack: OffloadStack::new(self.config.offload.stack_depth),
            });

            ids.push(id);
        }

        Ok(ids)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of devices available to offloads, taking the configured cap into account.
    pub fn num_active(&self) -> usize {
        match self.config.devices.num_active_devices {
            Some(n) => min(n, self.devices.len()),
            None => self.devices.len(),
        }
    }

    pub fn active_devices(&self) -> &[Device] {
        &self.devices[..self.num_active()]
    }

    /// Whether `id` is registered and within the active-device cap.
    pub fn is_active(&self, id: DeviceId) -> bool {
        id.get() < self.num_active()
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device, RegistryError> {
        self.devices
            .get(id.get())
            .ok_or(RegistryError::UnknownDevice(id))
    }

    pub fn backend(&self, id: DeviceId) -> Result<&Arc<dyn DeviceBackend>, RegistryError> {
        Ok(self.device(id)?.backend())
    }

    /// Up to `max` active devices of the given kind, in registration order.
    pub fn devices_of_kind(&self, kind: DeviceKind, max: usize) -> Vec<DeviceId> {
        self.active_devices()
            .iter()
            .filter(|d| d.kind() == kind)
            .map(|d| d.id())
            .take(max)
            .collect()
    }

    /// The host CPU if one is registered, otherwise the first device.
    pub fn default_device(&self) -> Option<DeviceId> {
        let active = self.active_devices();
        active
            .iter()
            .find(|d| d.kind() == DeviceKind::HostCpu)
            .or_else(|| active.first())
            .map(|d| d.id())
    }

    /// Whether `dst` can copy directly from the memory of `src` without staging through a
    /// host relay. Probed once per pair and cached afterwards.
    pub fn peer_supported(&self, dst: DeviceId, src: DeviceId) -> bool {
        if dst == src {
            return true;
        }

        if let Some(&supported) = self.peer_matrix.lock().get(&(dst, src)) {
            return supported;
        }

        let supported = match (self.device(dst), self.device(src)) {
            (Ok(a), Ok(b)) if a.peer_access && b.peer_access => {
                match a.backend.enable_peer_access(b.backend.as_ref()) {
                    Ok(supported) => supported,
                    Err(e) => {
                        warn!(
                            "cannot enable peer access from device {} to device {}: {}",
                            dst, src, e
                        );
                        false
                    }
                }
            }
            _ => false,
        };

        trace!("peer access {} -> {}: {}", src, dst, supported);
        self.peer_matrix.lock().insert((dst, src), supported);
        supported
    }

    pub fn read(&self, region: &MemRegion) -> Result<Vec<u8>> {
        match region {
            MemRegion::Host(r) => Ok(r.read()?),
            &MemRegion::Device { device, ptr, len } => {
                let mut out = vec![0; len];
                self.backend(device)?.copy_from_device(&mut out, ptr)?;
                Ok(out)
            }
        }
    }

    pub fn write(&self, region: &MemRegion, bytes: &[u8]) -> Result {
        if region.len() != bytes.len() {
            return Err(RegistryError::SizeMismatch {
                dst: region.len(),
                src: bytes.len(),
            }
            .into());
        }

        match region {
            MemRegion::Host(r) => r.write(bytes)?,
            &MemRegion::Device { device, ptr, .. } => {
                self.backend(device)?.copy_to_device(ptr, bytes)?;
            }
        }

        Ok(())
    }

    /// Copy the contents of `src` into `dst`. Both regions must have the same length.
    pub fn copy(&self, dst: &MemRegion, src: &MemRegion) -> Result {
        if dst.len() != src.len() {
            return Err(RegistryError::SizeMismatch {
                dst: dst.len(),
                src: src.len(),
            }
            .into());
        }

        if src.is_empty() {
            return Ok(());
        }

        match (dst, src) {
            (
                &MemRegion::Device {
                    device: dst_device,
                    ptr: dst_ptr,
                    ..
                },
                &MemRegion::Device {
                    device: src_device,
                    ptr: src_ptr,
                    len,
                },
            ) => {
                let src_backend = self.backend(src_device)?;
                self.backend(dst_device)?.copy_from_peer(
                    dst_ptr,
                    src_backend.as_ref(),
                    src_ptr,
                    len,
                )?;
            }
            _ => {
                let bytes = self.read(src)?;
                self.write(dst, &bytes)?;
            }
        }

        Ok(())
    }

    /// Like [`DeviceRegistry::copy`], but host/device transfers are submitted to `stream` of
    /// the device involved. The caller must synchronize the stream before relying on the
    /// result.
    pub fn copy_async(&self, dst: &MemRegion, src: &MemRegion, stream: StreamId) -> Result {
        if dst.len() != src.len() {
            return Err(RegistryError::SizeMismatch {
                dst: dst.len(),
                src: src.len(),
            }
            .into());
        }

        match (dst, src) {
            (&MemRegion::Device { device, ptr, .. }, MemRegion::Host(host)) => {
                self.backend(device)?
                    .copy_to_device_async(ptr, host.clone(), stream)?;
            }
            (MemRegion::Host(host), &MemRegion::Device { device, ptr, .. }) => {
                self.backend(device)?
                    .copy_from_device_async(host.clone(), ptr, stream)?;
            }
            _ => self.copy(dst, src)?,
        }

        Ok(())
    }

    fn log_summary(&self) {
        info!(
            "{} devices registered, {} active",
            self.devices.len(),
            self.num_active()
        );

        for device in &self.devices {
            info!("{}", device.info);
        }
    }
}

impl Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish()
    }
}
