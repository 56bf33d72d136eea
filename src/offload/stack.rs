use super::{MapCache, OffloadError};
use crate::prelude::*;
use crate::types::DeviceId;

/// The map caches of the offloads that are currently active on one device, outermost first.
#[derive(Debug)]
pub struct OffloadStack {
    frames: Mutex<Vec<Arc<MapCache>>>,
    depth: usize,
}

impl OffloadStack {
    pub fn new(depth: usize) -> Self {
        Self {
            frames: default(),
            depth,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, device: DeviceId, cache: Arc<MapCache>) -> Result<(), OffloadError> {
        let mut frames = self.frames.lock();
        if frames.len() >= self.depth {
            return Err(OffloadError::StackOverflow {
                device,
                depth: self.depth,
            });
        }

        frames.push(cache);
        Ok(())
    }

    pub fn pop(&self, device: DeviceId) -> Result<Arc<MapCache>, OffloadError> {
        self.frames
            .lock()
            .pop()
            .ok_or(OffloadError::StackUnderflow(device))
    }

    /// Snapshot of the frames, innermost first.
    pub fn frames(&self) -> Vec<Arc<MapCache>> {
        self.frames.lock().iter().rev().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_push_pop() {
        let device = DeviceId::new(3);
        let stack = OffloadStack::new(2);
        let (a, b) = (Arc::new(MapCache::new(1)), Arc::new(MapCache::new(2)));

        stack.push(device, Arc::clone(&a)).unwrap();
        stack.push(device, Arc::clone(&b)).unwrap();
        assert_eq!(
            stack.push(device, Arc::new(MapCache::new(3))),
            Err(OffloadError::StackOverflow { device, depth: 2 })
        );

        let frames = stack.frames();
        assert!(Arc::ptr_eq(&frames[0], &b));
        assert!(Arc::ptr_eq(&frames[1], &a));

        assert!(Arc::ptr_eq(&stack.pop(device).unwrap(), &b));
        assert!(Arc::ptr_eq(&stack.pop(device).unwrap(), &a));
        assert_eq!(stack.pop(device).unwrap_err(), OffloadError::StackUnderflow(device));
        assert!(stack.is_empty());
    }
}
