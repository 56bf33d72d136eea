use std::fmt::{self, Debug};

use super::memory::{HostRegion, MemoryError};
use crate::prelude::*;
use crate::types::DeviceKind;

/// Opaque location in the memory of one device: the allocation handle plus a byte offset
/// into that allocation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    pub handle: u64,
    pub offset: usize,
}

impl DevicePtr {
    pub const fn new(handle: u64) -> Self {
        Self { handle, offset: 0 }
    }

    #[must_use]
    pub fn add(self, nbytes: usize) -> Self {
        Self {
            handle: self.handle,
            offset: self.offset + nbytes,
        }
    }
}

impl Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x}+{})", self.handle, self.offset)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct StreamId(pub u64);

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("invalid device pointer {0:?}")]
    InvalidPointer(DevicePtr),

    #[error("access of {size} bytes at {ptr:?} exceeds allocation of {capacity} bytes")]
    OutOfBounds {
        ptr: DevicePtr,
        size: usize,
        capacity: usize,
    },

    #[error("invalid stream {0:?}")]
    InvalidStream(StreamId),

    #[error("device {0} is not available: {1}")]
    Unavailable(DeviceKind, String),

    #[error("asynchronous operation on stream {0:?} failed: {1}")]
    AsyncFailure(StreamId, Box<BackendError>),

    #[error("{0}")]
    Memory(#[from] MemoryError),
}

/// Capabilities a device adapter must provide to the runtime.
///
/// Adapters for real accelerators live outside this crate; [`super::SimulatedBackend`]
/// implements the host CPU and thread-simulated kinds. All copies are in bytes. Asynchronous
/// copies take ownership of the host side so they can outlive the call, the default
/// implementations simply perform the copy synchronously.
pub trait DeviceBackend: Send + Sync + Debug {
    fn kind(&self) -> DeviceKind;

    /// Check that the device is present and usable.
    fn probe(&self) -> Result<(), BackendError>;

    fn allocate(&self, nbytes: usize) -> Result<DevicePtr, BackendError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), BackendError>;

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError>;

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), BackendError>;

    /// Copy `nbytes` from the memory of `peer` into the memory of this device.
    fn copy_from_peer(
        &self,
        dst: DevicePtr,
        peer: &dyn DeviceBackend,
        src: DevicePtr,
        nbytes: usize,
    ) -> Result<(), BackendError> {
        let mut staging = vec![0; nbytes];
        peer.copy_from_device(&mut staging, src)?;
        self.copy_to_device(dst, &staging)
    }

    /// Try to enable direct access from this device to the memory of `peer`. Returns whether
    /// direct copies between the two are possible.
    fn enable_peer_access(&self, _peer: &dyn DeviceBackend) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn create_stream(&self) -> Result<StreamId, BackendError>;

    /// Block until all operations submitted to `stream` have completed.
    fn sync_stream(&self, stream: StreamId) -> Result<(), BackendError>;

    fn destroy_stream(&self, stream: StreamId) -> Result<(), BackendError>;

    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: HostRegion,
        _stream: StreamId,
    ) -> Result<(), BackendError> {
        self.copy_to_device(dst, &src.read()?)
    }

    fn copy_from_device_async(
        &self,
        dst: HostRegion,
        src: DevicePtr,
        _stream: StreamId,
    ) -> Result<(), BackendError> {
        let mut staging = vec![0; dst.len];
        self.copy_from_device(&mut staging, src)?;
        Ok(dst.write(&staging)?)
    }
}
