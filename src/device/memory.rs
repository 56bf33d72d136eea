use std::fmt::{self, Debug};

use super::backend::DevicePtr;
use crate::prelude::*;
use crate::types::DeviceId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {size} bytes at offset {offset} exceeds buffer of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("buffer of {len} bytes cannot hold elements of {elem_size} bytes")]
    ElementMismatch { len: usize, elem_size: usize },
}

fn check_bounds(offset: usize, size: usize, len: usize) -> Result<(), MemoryError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(MemoryError::OutOfBounds { offset, size, len }),
    }
}

/// Plain-old-data element type that can be stored in a [`HostArray`].
pub trait Element: Copy + Default + Send + Sync + Debug + 'static {
    const SIZE: usize;

    fn write_bytes(self, out: &mut [u8]);
    fn read_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($typ:ty),*) => {
        $(
            impl Element for $typ {
                const SIZE: usize = std::mem::size_of::<$typ>();

                fn write_bytes(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }

                fn read_bytes(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$typ>()];
                    raw.copy_from_slice(bytes);
                    <$typ>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// Host memory backing a mapped array.
///
/// The identity of a host array is its address: two [`HostBuffer`]s refer to the same source
/// array iff they point to the same allocation.
pub struct HostArray {
    data: Mutex<Box<[u8]>>,
}

pub type HostBuffer = Arc<HostArray>;

impl HostArray {
    pub fn zeroed(nbytes: usize) -> HostBuffer {
        Arc::new(Self {
            data: Mutex::new(vec![0; nbytes].into_boxed_slice()),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> HostBuffer {
        Arc::new(Self {
            data: Mutex::new(Box::from(bytes)),
        })
    }

    pub fn from_values<T: Element>(values: &[T]) -> HostBuffer {
        let mut bytes = vec![0; values.len() * T::SIZE];
        for (chunk, &v) in zip(bytes.chunks_exact_mut(T::SIZE), values) {
            v.write_bytes(chunk);
        }

        Arc::new(Self {
            data: Mutex::new(bytes.into_boxed_slice()),
        })
    }

    pub fn to_values<T: Element>(&self) -> Result<Vec<T>, MemoryError> {
        let data = self.data.lock();
        if data.len() % T::SIZE != 0 {
            return Err(MemoryError::ElementMismatch {
                len: data.len(),
                elem_size: T::SIZE,
            });
        }

        Ok(data.chunks_exact(T::SIZE).map(T::read_bytes).collect())
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<(), MemoryError> {
        let data = self.data.lock();
        check_bounds(offset, out.len(), data.len())?;
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut data = self.data.lock();
        check_bounds(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data.lock())
    }

    /// Run `f` with exclusive access to the entire buffer.
    pub fn with_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.data.lock())
    }
}

impl Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostArray({:p}, {} bytes)", self, self.len())
    }
}

/// Window of bytes `[offset, offset + len)` inside a host buffer.
#[derive(Clone, Debug)]
pub struct HostRegion {
    pub buffer: HostBuffer,
    pub offset: usize,
    pub len: usize,
}

impl HostRegion {
    pub fn new(buffer: HostBuffer, offset: usize, len: usize) -> Result<Self, MemoryError> {
        check_bounds(offset, len, buffer.len())?;
        Ok(Self {
            buffer,
            offset,
            len,
        })
    }

    pub fn whole(buffer: HostBuffer) -> Self {
        let len = buffer.len();
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    pub fn sub(&self, offset: usize, len: usize) -> Result<Self, MemoryError> {
        check_bounds(offset, len, self.len)?;
        Ok(Self {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn read(&self) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0; self.len];
        self.buffer.read(self.offset, &mut out)?;
        Ok(out)
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.len() != self.len {
            return Err(MemoryError::OutOfBounds {
                offset: self.offset,
                size: bytes.len(),
                len: self.len,
            });
        }

        self.buffer.write(self.offset, bytes)
    }
}

/// A contiguous range of bytes either in host memory or in the memory of a device.
#[derive(Clone, Debug)]
pub enum MemRegion {
    Host(HostRegion),
    Device {
        device: DeviceId,
        ptr: DevicePtr,
        len: usize,
    },
}

impl MemRegion {
    pub fn len(&self) -> usize {
        match self {
            MemRegion::Host(r) => r.len,
            MemRegion::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_host(&self) -> bool {
        matches!(self, MemRegion::Host(_))
    }

    pub fn sub(&self, offset: usize, len: usize) -> Result<Self, MemoryError> {
        match self {
            MemRegion::Host(r) => Ok(MemRegion::Host(r.sub(offset, len)?)),
            &MemRegion::Device {
                device,
                ptr,
                len: total,
            } => {
                check_bounds(offset, len, total)?;
                Ok(MemRegion::Device {
                    device,
                    ptr: ptr.add(offset),
                    len,
                })
            }
        }
    }
}
