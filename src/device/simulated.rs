use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use std::fmt::{self, Debug};
use threadpool::ThreadPool;

use super::backend::{BackendError, DeviceBackend, DevicePtr, StreamId};
use super::memory::HostRegion;
use crate::prelude::*;
use crate::types::DeviceKind;

type Memory = Arc<Mutex<SlotMap<DefaultKey, Box<[u8]>>>>;

fn key_of(handle: u64) -> DefaultKey {
    KeyData::from_ffi(handle).into()
}

fn handle_of(key: DefaultKey) -> u64 {
    key.data().as_ffi()
}

fn with_allocation<F, R>(
    memory: &Memory,
    ptr: DevicePtr,
    size: usize,
    f: F,
) -> Result<R, BackendError>
where
    F: FnOnce(&mut [u8]) -> R,
{
    let mut memory = memory.lock();
    let alloc = memory
        .get_mut(key_of(ptr.handle))
        .ok_or(BackendError::InvalidPointer(ptr))?;

    let capacity = alloc.len();
    match ptr.offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(f(&mut alloc[ptr.offset..end])),
        _ => Err(BackendError::OutOfBounds {
            ptr,
            size,
            capacity,
        }),
    }
}

struct Stream {
    pool: ThreadPool,
    error: Arc<Mutex<Option<BackendError>>>,
}

/// Device whose memory lives in the address space of this process.
///
/// Used for the host CPU and for thread-simulated accelerators. Every allocation is a
/// separate heap buffer so out-of-bounds accesses are detected instead of silently corrupting
/// a neighboring allocation. Each stream is served by its own single worker thread, which gives
/// streams the in-order semantics of real accelerator streams.
pub struct SimulatedBackend {
    kind: DeviceKind,
    memory: Memory,
    streams: Mutex<SlotMap<DefaultKey, Stream>>,
}

impl SimulatedBackend {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            memory: default(),
            streams: Mutex::new(SlotMap::new()),
        }
    }

    pub fn is_supported(kind: DeviceKind) -> bool {
        matches!(kind, DeviceKind::HostCpu | DeviceKind::ThreadSimulated)
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        self.memory.lock().len()
    }

    fn submit<F>(&self, stream: StreamId, task: F) -> Result<(), BackendError>
    where
        F: FnOnce(&Memory) -> Result<(), BackendError> + Send + 'static,
    {
        let streams = self.streams.lock();
        let entry = streams
            .get(key_of(stream.0))
            .ok_or(BackendError::InvalidStream(stream))?;

        let memory = Arc::clone(&self.memory);
        let error = Arc::clone(&entry.error);

        entry.pool.execute(move || {
            if let Err(e) = task(&memory) {
                warn!("asynchronous copy on stream {:?} failed: {}", stream, e);
                error.lock().get_or_insert(e);
            }
        });

        Ok(())
    }
}

impl Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("kind", &self.kind)
            .field("allocations", &self.allocations())
            .finish()
    }
}

impl DeviceBackend for SimulatedBackend {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn probe(&self) -> Result<(), BackendError> {
        if Self::is_supported(self.kind) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                self.kind,
                "kind cannot be simulated".to_string(),
            ))
        }
    }

    fn allocate(&self, nbytes: usize) -> Result<DevicePtr, BackendError> {
        let key = self.memory.lock().insert(vec![0; nbytes].into_boxed_slice());
        trace!("{} allocated {} bytes as {:?}", self.kind, nbytes, key);

        Ok(DevicePtr::new(handle_of(key)))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), BackendError> {
        if ptr.offset != 0 {
            return Err(BackendError::InvalidPointer(ptr));
        }

        self.memory
            .lock()
            .remove(key_of(ptr.handle))
            .map(drop)
            .ok_or(BackendError::InvalidPointer(ptr))
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), BackendError> {
        with_allocation(&self.memory, dst, src.len(), |out| out.copy_from_slice(src))
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), BackendError> {
        with_allocation(&self.memory, src, dst.len(), |data| {
            dst.copy_from_slice(data)
        })
    }

    fn enable_peer_access(&self, peer: &dyn DeviceBackend) -> Result<bool, BackendError> {
        Ok(Self::is_supported(peer.kind()))
    }

    fn create_stream(&self) -> Result<StreamId, BackendError> {
        let stream = Stream {
            pool: ThreadPool::with_name(format!("{}-stream", self.kind), 1),
            error: default(),
        };

        let key = self.streams.lock().insert(stream);
        Ok(StreamId(handle_of(key)))
    }

    fn sync_stream(&self, stream: StreamId) -> Result<(), BackendError> {
        let (pool, error) = {
            let streams = self.streams.lock();
            let entry = streams
                .get(key_of(stream.0))
                .ok_or(BackendError::InvalidStream(stream))?;

            (entry.pool.clone(), Arc::clone(&entry.error))
        };

        pool.join();

        let result = error.lock().take();
        match result {
            Some(e) => Err(BackendError::AsyncFailure(stream, Box::new(e))),
            None => Ok(()),
        }
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), BackendError> {
        let entry = self
            .streams
            .lock()
            .remove(key_of(stream.0))
            .ok_or(BackendError::InvalidStream(stream))?;

        entry.pool.join();
        Ok(())
    }

    fn copy_to_device_async(
        &self,
        dst: DevicePtr,
        src: HostRegion,
        stream: StreamId,
    ) -> Result<(), BackendError> {
        self.submit(stream, move |memory| {
            let bytes = src.read()?;
            with_allocation(memory, dst, bytes.len(), |out| out.copy_from_slice(&bytes))
        })
    }

    fn copy_from_device_async(
        &self,
        dst: HostRegion,
        src: DevicePtr,
        stream: StreamId,
    ) -> Result<(), BackendError> {
        self.submit(stream, move |memory| {
            let mut staging = vec![0; dst.len];
            with_allocation(memory, src, staging.len(), |data| {
                staging.copy_from_slice(data)
            })?;

            Ok(dst.write(&staging)?)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::HostArray;

    #[test]
    fn test_alloc_copy() {
        let backend = SimulatedBackend::new(DeviceKind::ThreadSimulated);
        backend.probe().unwrap();

        let ptr = backend.allocate(16).unwrap();
        backend.copy_to_device(ptr.add(4), &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 8];
        backend.copy_from_device(&mut out, ptr).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);

        assert!(matches!(
            backend.copy_to_device(ptr.add(14), &[0; 4]),
            Err(BackendError::OutOfBounds { capacity: 16, .. })
        ));

        assert_eq!(backend.allocations(), 1);
        backend.free(ptr).unwrap();
        assert_eq!(backend.allocations(), 0);

        assert!(matches!(
            backend.free(ptr),
            Err(BackendError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_peer_copy() {
        let a = SimulatedBackend::new(DeviceKind::ThreadSimulated);
        let b = SimulatedBackend::new(DeviceKind::HostCpu);
        assert!(a.enable_peer_access(&b).unwrap());

        let src = b.allocate(4).unwrap();
        b.copy_to_device(src, &[9, 8, 7, 6]).unwrap();

        let dst = a.allocate(4).unwrap();
        a.copy_from_peer(dst, &b, src.add(1), 3).unwrap();

        let mut out = [0u8; 4];
        a.copy_from_device(&mut out, dst).unwrap();
        assert_eq!(out, [8, 7, 6, 0]);
    }

    #[test]
    fn test_streams() {
        let backend = SimulatedBackend::new(DeviceKind::ThreadSimulated);
        let stream = backend.create_stream().unwrap();
        let ptr = backend.allocate(8).unwrap();

        let input = HostArray::from_values(&[1u8, 2, 3, 4, 5, 6, 7, 8]);
        let output = HostArray::zeroed(8);

        backend
            .copy_to_device_async(ptr, HostRegion::whole(input), stream)
            .unwrap();
        backend
            .copy_from_device_async(HostRegion::whole(Arc::clone(&output)), ptr, stream)
            .unwrap();
        backend.sync_stream(stream).unwrap();

        assert_eq!(output.to_values::<u8>().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);

        // failures are reported when synchronizing
        let bad = HostRegion::whole(HostArray::zeroed(16));
        backend.copy_to_device_async(ptr, bad, stream).unwrap();
        assert!(matches!(
            backend.sync_stream(stream),
            Err(BackendError::AsyncFailure(..))
        ));
        backend.sync_stream(stream).unwrap();

        backend.destroy_stream(stream).unwrap();
        assert!(matches!(
            backend.sync_stream(stream),
            Err(BackendError::InvalidStream(_))
        ));
    }
}
