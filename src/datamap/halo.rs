//! Exchange of halo rows between neighboring positions.
//!
//! The device buffer of a map with a halo along dimension 0 has the layout
//!
//! ```text
//! | left_in | core rows ............................ | right_in |
//!           | left_out |              | right_out |
//! ```
//!
//! where `left_in` receives the last rows of the left neighbor (its `right_out`) and
//! `right_in` receives the first rows of the right neighbor (its `left_out`). If two devices
//! cannot copy directly between each other, the receiving side owns a host [`Relay`] into
//! which the sending side pushes its rows.
use std::fmt::{self, Display};
use std::time::{Duration, Instant};

use super::{AccessLevel, DataMap, HaloSpec, MapError, MapRef};
use crate::device::MemRegion;
use crate::prelude::*;
use crate::types::SeqId;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Which halo windows a pull should fill.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PullDirection {
    FromLeft,
    FromRight,
    FromLeftRight,
}

impl PullDirection {
    pub fn sides(self) -> &'static [Side] {
        match self {
            PullDirection::FromLeft => &[Side::Left],
            PullDirection::FromRight => &[Side::Right],
            PullDirection::FromLeftRight => &[Side::Left, Side::Right],
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HaloError {
    #[error("timed out after {waited:?} waiting for neighbor {neighbor} on the {side} side")]
    Timeout {
        neighbor: SeqId,
        side: Side,
        waited: Duration,
    },

    #[error("halo exchange with neighbor {neighbor} on the {side} side was cancelled")]
    Cancelled { neighbor: SeqId, side: Side },

    #[error("relay holds {expected} bytes but {got} bytes were pushed")]
    SizeMismatch { expected: usize, got: usize },
}

/// Byte range `[offset, offset + len)` inside a device buffer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct Window {
    pub offset: usize,
    pub len: usize,
}

impl Window {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn within(&self, region: &MemRegion) -> Result<MemRegion> {
        Ok(region.sub(self.offset, self.len)?)
    }
}

#[derive(Debug)]
struct RelaySlot {
    pushed: u64,
    pulled: u64,
    data: Vec<u8>,
    cancelled: bool,
}

/// Single-slot host buffer through which one neighbor hands rows to another.
///
/// `push` blocks until the previous push has been pulled and `pull` blocks until a push has
/// happened, so `pulled <= pushed <= pulled + 1` always holds.
#[derive(Debug)]
pub struct Relay {
    slot: Mutex<RelaySlot>,
    changed: Condvar,
}

impl Relay {
    pub fn new(size: usize) -> Self {
        Self {
            slot: Mutex::new(RelaySlot {
                pushed: 0,
                pulled: 0,
                data: vec![0; size],
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.slot.lock().data.len()
    }

    /// The `(pushed, pulled)` handoff counters.
    pub fn counters(&self) -> (u64, u64) {
        let slot = self.slot.lock();
        (slot.pushed, slot.pulled)
    }

    /// Wake up all waiters with an error. Further pushes and pulls fail immediately.
    pub fn cancel(&self) {
        self.slot.lock().cancelled = true;
        self.changed.notify_all();
    }

    fn wait_until<F>(
        &self,
        ready: F,
        timeout: Duration,
        neighbor: SeqId,
        side: Side,
    ) -> Result<parking_lot::MutexGuard<'_, RelaySlot>, HaloError>
    where
        F: Fn(&RelaySlot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();

        loop {
            if slot.cancelled {
                return Err(HaloError::Cancelled { neighbor, side });
            }

            if ready(&slot) {
                return Ok(slot);
            }

            if self.changed.wait_until(&mut slot, deadline).timed_out() && !ready(&slot) {
                return Err(if slot.cancelled {
                    HaloError::Cancelled { neighbor, side }
                } else {
                    HaloError::Timeout {
                        neighbor,
                        side,
                        waited: timeout,
                    }
                });
            }
        }
    }

    /// Hand `data` to the owner of this relay. `neighbor` and `side` identify the owner for
    /// error reporting.
    pub fn push(
        &self,
        data: &[u8],
        timeout: Duration,
        neighbor: SeqId,
        side: Side,
    ) -> Result<(), HaloError> {
        let mut slot = self.wait_until(|s| s.pushed <= s.pulled, timeout, neighbor, side)?;

        if slot.data.len() != data.len() {
            return Err(HaloError::SizeMismatch {
                expected: slot.data.len(),
                got: data.len(),
            });
        }

        slot.data.copy_from_slice(data);
        slot.pushed += 1;
        drop(slot);

        self.changed.notify_all();
        Ok(())
    }

    /// Take the data of the next push. `neighbor` and `side` identify the pusher for error
    /// reporting.
    pub fn pull(
        &self,
        timeout: Duration,
        neighbor: SeqId,
        side: Side,
    ) -> Result<Vec<u8>, HaloError> {
        let mut slot = self.wait_until(|s| s.pushed > s.pulled, timeout, neighbor, side)?;

        let data = slot.data.clone();
        slot.pulled += 1;
        drop(slot);

        self.changed.notify_all();
        Ok(data)
    }
}

/// Halo bookkeeping of one dimension of one map.
#[derive(Clone, Debug)]
pub struct HaloBufferSet {
    pub left: u64,
    pub right: u64,
    pub row_size: usize,
    pub left_in: Window,
    pub left_out: Window,
    pub right_in: Window,
    pub right_out: Window,
    pub left_neighbor: Option<SeqId>,
    pub right_neighbor: Option<SeqId>,
    /// Receives rows from the left neighbor if it cannot copy directly.
    pub left_relay: Option<Arc<Relay>>,
    /// Receives rows from the right neighbor if it cannot copy directly.
    pub right_relay: Option<Arc<Relay>>,
}

impl HaloBufferSet {
    /// Window layout for a core region of `map_size` bytes, without neighbors.
    pub fn new(spec: &HaloSpec, row_size: usize, map_size: usize) -> Self {
        let left = spec.left as usize * row_size;
        let right = spec.right as usize * row_size;

        Self {
            left: spec.left,
            right: spec.right,
            row_size,
            left_in: Window::new(0, left),
            left_out: Window::new(left, right),
            right_in: Window::new(left + map_size, right),
            // the last `left` rows of the core
            right_out: Window::new(map_size, left),
            left_neighbor: None,
            right_neighbor: None,
            left_relay: None,
            right_relay: None,
        }
    }

    /// Total size of the buffer: both halos plus the core.
    pub fn buffer_size(&self, map_size: usize) -> usize {
        self.left_in.len + map_size + self.right_in.len
    }

    /// Window that receives data from `side`.
    pub fn in_window(&self, side: Side) -> Window {
        match side {
            Side::Left => self.left_in,
            Side::Right => self.right_in,
        }
    }

    /// Window that is sent to the neighbor on `side`.
    pub fn out_window(&self, side: Side) -> Window {
        match side {
            Side::Left => self.left_out,
            Side::Right => self.right_out,
        }
    }

    pub fn neighbor(&self, side: Side) -> Option<SeqId> {
        match side {
            Side::Left => self.left_neighbor,
            Side::Right => self.right_neighbor,
        }
    }

    /// Relay that receives data from `side`, if that side has no direct path.
    pub fn relay(&self, side: Side) -> Option<&Arc<Relay>> {
        match side {
            Side::Left => self.left_relay.as_ref(),
            Side::Right => self.right_relay.as_ref(),
        }
    }

    pub(crate) fn cancel_relays(&self) {
        for relay in self.left_relay.iter().chain(&self.right_relay) {
            relay.cancel();
        }
    }
}

impl MapRef {
    /// Halo setup of dimension 0: window layout, neighbor lookup along the grid axis of the
    /// distribution, and a relay for every side that has no direct peer path.
    pub(super) fn build_halo_set(&self, spec: &HaloSpec, map_size: usize) -> HaloBufferSet {
        let info = self.info();
        let topology = self.offload().topology();
        let registry = self.offload().registry();

        let mut set = HaloBufferSet::new(spec, info.row_size(0), map_size);

        let axis = info.dist(0).target_axis();
        let cyclic = topology.is_periodic(axis) || spec.edging == super::Edging::Periodic;
        let (left, right) = topology.neighbors_cyclic(self.seqid(), axis, cyclic);
        set.left_neighbor = left;
        set.right_neighbor = right;

        let me = self.device();
        for &side in &[Side::Left, Side::Right] {
            let window = set.in_window(side);

            let neighbor = match set.neighbor(side) {
                Some(n) if !window.is_empty() => n,
                _ => continue,
            };

            if registry.peer_supported(me, topology.device(neighbor)) {
                continue;
            }

            debug!(
                "{}: no peer access to neighbor {} on the {} side, using host relay",
                self, neighbor, side
            );

            let relay = Some(Arc::new(Relay::new(window.len)));
            match side {
                Side::Left => set.left_relay = relay,
                Side::Right => set.right_relay = relay,
            }
        }

        set
    }

    fn neighbor_map(&self, neighbor: SeqId, level: AccessLevel) -> Result<&DataMap> {
        let map = self.info().map(neighbor)?;
        let timeout = self.offload().registry().config().halo.timeout;

        if map.wait_for(level, timeout).is_err() {
            return Err(MapError::NotReady {
                symbol: self.info().symbol().to_string(),
                seqid: neighbor,
                level,
            }
            .into());
        }

        Ok(map)
    }

    /// Fill the halo windows of dimension `dim` with the boundary rows of the neighbors.
    ///
    /// All neighbors involved must call this concurrently with the matching direction (a pull
    /// from the left on one position pairs with a pull from the right on its left neighbor).
    /// Only dimension 0 of contiguous maps is supported, other requests are ignored with a
    /// warning.
    pub fn halo_pull(&self, dim: usize, direction: PullDirection) -> Result {
        if dim != 0 {
            warn!(
                "{}: halo exchange along dimension {} is not supported",
                self, dim
            );
            return Ok(());
        }

        self.require(AccessLevel::Malloc)?;

        let (set, noncontiguous, buffer) = {
            let state = self.map().state();
            (
                state.halo.first().cloned().flatten(),
                state.noncontiguous,
                state.device_wextra.clone(),
            )
        };

        if noncontiguous {
            warn!("{}: halo exchange of a non-contiguous map is not supported", self);
            return Ok(());
        }

        let set = match set {
            Some(set) => set,
            None => {
                warn!("{}: no halo along dimension 0, nothing to pull", self);
                return Ok(());
            }
        };

        let buffer = buffer.ok_or_else(|| anyhow!("{}: device buffer is missing", self))?;
        let registry = self.offload().registry();
        let timeout = registry.config().halo.timeout;

        // Push our boundary rows first, so that two neighbors pulling from each other
        // never wait on one another.
        for &side in direction.sides() {
            let out = set.out_window(side);
            let neighbor = match set.neighbor(side) {
                Some(n) if !out.is_empty() => n,
                _ => continue,
            };

            let peer = self.neighbor_map(neighbor, AccessLevel::Halo)?;
            let relay = peer
                .halo_set(0)
                .and_then(|h| h.relay(side.opposite()).cloned());

            if let Some(relay) = relay {
                let data = registry.read(&out.within(&buffer)?)?;
                relay.push(&data, timeout, neighbor, side)?;
                trace!("{}: pushed {} bytes to {}", self, data.len(), neighbor);
            }
        }

        for &side in direction.sides() {
            let window = set.in_window(side);
            let neighbor = match set.neighbor(side) {
                Some(n) if !window.is_empty() => n,
                _ => continue,
            };

            let dst = window.within(&buffer)?;

            match set.relay(side) {
                Some(relay) => {
                    let data = relay.pull(timeout, neighbor, side)?;
                    registry.write(&dst, &data)?;
                    trace!("{}: pulled {} bytes from {}", self, data.len(), neighbor);
                }
                None => {
                    let peer = self.neighbor_map(neighbor, AccessLevel::Malloc)?;
                    let (peer_set, peer_buffer) = {
                        let state = peer.state();
                        (
                            state.halo.first().cloned().flatten(),
                            state.device_wextra.clone(),
                        )
                    };

                    let src = match (peer_set, peer_buffer) {
                        (Some(s), Some(b)) => s.out_window(side.opposite()).within(&b)?,
                        _ => bail!("{}: neighbor {} has no halo buffer", self, neighbor),
                    };

                    registry.copy(&dst, &src)?;
                    trace!("{}: copied {} bytes from {}", self, dst.len(), neighbor);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datamap::{DataMapInfo, Edging, MapDirection, MapType};
    use crate::device::{DeviceRegistry, HostArray};
    use crate::distribution::DistSpec;
    use crate::offload::test::{offload, registry};
    use crate::offload::OffloadInfo;
    use crate::types::{Config, DeviceKind, DeviceSpec, HaloConfig};
    use std::sync::Barrier;

    /// Array of 8 rows of 3 doubles split over two positions, with one halo row on each side.
    fn rows(registry: &Arc<DeviceRegistry>, edging: Edging) -> Arc<OffloadInfo> {
        let info = DataMapInfo::new(
            "u",
            HostArray::zeroed(8 * 3 * 8),
            &[8, 3],
            8,
            MapDirection::ToFrom,
            MapType::Copy,
        )
        .unwrap()
        .dist_init(0, DistSpec::block(0..8))
        .unwrap()
        .add_halo(0, 1, 1, edging)
        .unwrap();

        offload(registry, vec![info])
    }

    fn prepare(map: &MapRef) {
        map.init().unwrap();
        map.distribute().unwrap();
        map.setup_halo().unwrap();
        map.allocate().unwrap();
    }

    fn exchange(peer_access: bool, edging: Edging) {
        let registry = registry(DeviceKind::ThreadSimulated, 2, peer_access);
        let offload = rows(&registry, edging);
        let barrier = Barrier::new(2);
        let periodic = edging == Edging::Periodic;

        crossbeam::thread::scope(|s| {
            for seqid in 0..2 {
                let (registry, offload, barrier) = (&registry, &offload, &barrier);

                s.spawn(move |_| {
                    let map = offload.map_ref(0, seqid).unwrap();
                    prepare(&map);

                    // core rows of position p hold 100 * (p + 1) + i
                    let base = 100.0 * (seqid + 1) as f64;
                    let values = (0..12).map(|i| base + i as f64).collect_vec();
                    let core = map.map().device_region().unwrap();
                    let bytes = HostArray::from_values(&values).with(|b| b.to_vec());
                    registry.write(&core, &bytes).unwrap();

                    // direct copies read the core of the neighbor
                    barrier.wait();
                    map.halo_pull(0, PullDirection::FromLeftRight).unwrap();

                    let wextra = map.map().device_region_wextra().unwrap();
                    let all = HostArray::from_bytes(&registry.read(&wextra).unwrap())
                        .to_values::<f64>()
                        .unwrap();
                    assert_eq!(all.len(), 18);
                    assert_eq!(&all[3..15], &values[..]);

                    let (left, right) = (&all[..3], &all[15..]);
                    if seqid == 0 {
                        assert_eq!(right, &[200.0, 201.0, 202.0]);
                        if periodic {
                            assert_eq!(left, &[209.0, 210.0, 211.0]);
                        } else {
                            assert_eq!(left, &[0.0; 3]);
                        }
                    } else {
                        assert_eq!(left, &[109.0, 110.0, 111.0]);
                        if periodic {
                            assert_eq!(right, &[100.0, 101.0, 102.0]);
                        } else {
                            assert_eq!(right, &[0.0; 3]);
                        }
                    }

                    let set = map.map().halo_set(0).unwrap();
                    for &side in &[Side::Left, Side::Right] {
                        let has_neighbor = set.neighbor(side).is_some();
                        assert_eq!(set.relay(side).is_some(), has_neighbor && !peer_access);

                        if let Some(relay) = set.relay(side) {
                            assert_eq!(relay.counters(), (1, 1));
                        }
                    }
                });
            }
        })
        .unwrap();
    }

    #[test]
    fn test_exchange_relay() {
        exchange(false, Edging::None);
    }

    #[test]
    fn test_exchange_relay_periodic() {
        exchange(false, Edging::Periodic);
    }

    #[test]
    fn test_exchange_direct() {
        exchange(true, Edging::None);
        exchange(true, Edging::Periodic);
    }

    #[test]
    fn test_stalled_neighbor() {
        let spec = DeviceSpec::new("sim", DeviceKind::ThreadSimulated)
            .count(2)
            .peer_access(false);
        let config = Config {
            halo: HaloConfig {
                timeout: Duration::from_millis(50),
            },
            ..default()
        };
        let registry = Arc::new(DeviceRegistry::from_specs(&[spec], config).unwrap());
        let offload = rows(&registry, Edging::None);

        let map = offload.map_ref(0, 0).unwrap();
        prepare(&map);

        // the neighbor has not even set up its halo
        let err = map.halo_pull(0, PullDirection::FromRight).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MapError>(),
            Some(MapError::NotReady { seqid: 1, .. })
        ));

        // the neighbor is ready but never pushes
        prepare(&offload.map_ref(0, 1).unwrap());
        let err = map.halo_pull(0, PullDirection::FromRight).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HaloError>(),
            Some(&HaloError::Timeout {
                neighbor: 1,
                side: Side::Right,
                waited: Duration::from_millis(50)
            })
        );

        // pulls along other dimensions are ignored
        map.halo_pull(1, PullDirection::FromLeft).unwrap();
    }

    #[test]
    fn test_windows() {
        let spec = HaloSpec {
            left: 1,
            right: 2,
            edging: Edging::None,
        };

        // 4 core rows of 10 bytes
        let set = HaloBufferSet::new(&spec, 10, 40);
        assert_eq!(set.left_in, Window::new(0, 10));
        assert_eq!(set.left_out, Window::new(10, 20));
        assert_eq!(set.right_in, Window::new(50, 20));
        assert_eq!(set.right_out, Window::new(40, 10));
        assert_eq!(set.buffer_size(40), 70);
    }

    #[test]
    fn test_relay_handoff() {
        let relay = Relay::new(4);
        let timeout = Duration::from_secs(10);

        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                for i in 0..10u8 {
                    relay.push(&[i; 4], timeout, 1, Side::Left).unwrap();
                }
            });

            for i in 0..10u8 {
                let data = relay.pull(timeout, 0, Side::Right).unwrap();
                assert_eq!(data, vec![i; 4]);

                let (pushed, pulled) = relay.counters();
                assert!(pulled <= pushed);
            }
        })
        .unwrap();

        assert_eq!(relay.counters(), (10, 10));
    }

    #[test]
    fn test_relay_timeout() {
        let relay = Relay::new(2);
        let short = Duration::from_millis(20);

        assert_eq!(
            relay.pull(short, 3, Side::Left),
            Err(HaloError::Timeout {
                neighbor: 3,
                side: Side::Left,
                waited: short
            })
        );

        relay.push(&[1, 2], short, 3, Side::Right).unwrap();

        // single slot: a second push must wait for the first to be pulled
        assert!(matches!(
            relay.push(&[3, 4], short, 3, Side::Right),
            Err(HaloError::Timeout { .. })
        ));

        assert_eq!(
            relay.push(&[1], short, 3, Side::Right).unwrap_err(),
            HaloError::Timeout {
                neighbor: 3,
                side: Side::Right,
                waited: short
            }
        );

        assert_eq!(relay.pull(short, 3, Side::Left).unwrap(), vec![1, 2]);
        assert_eq!(
            relay.push(&[1], short, 3, Side::Right),
            Err(HaloError::SizeMismatch {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_relay_cancel() {
        let relay = Relay::new(1);

        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                let result = relay.pull(Duration::from_secs(30), 1, Side::Left);
                assert_eq!(
                    result,
                    Err(HaloError::Cancelled {
                        neighbor: 1,
                        side: Side::Left
                    })
                );
            });

            std::thread::sleep(Duration::from_millis(20));
            relay.cancel();
        })
        .unwrap();

        assert!(relay.push(&[0], Duration::from_secs(1), 1, Side::Left).is_err());
    }
}
