//! Offloads: a set of mapped arrays and distributed loops executed on all positions of a
//! topology.
//!
//! An [`OffloadInfo`] is created once by an [`OffloadInfoBuilder`] and shared by the shepherds
//! of all positions. Each shepherd drives its own position through an [`OffloadContext`], which
//! also takes part in the per-device [`OffloadStack`] so that nested offloads can find the maps
//! of enclosing ones.
mod cache;
mod context;
mod stack;

pub use cache::{CacheEntry, MapCache};
pub use context::{OffloadContext, OffloadStage};
pub use stack::OffloadStack;

use std::fmt::{self, Debug, Display};

use crate::datamap::{DataMapInfo, MapRef};
use crate::device::{DeviceRegistry, HostBuffer};
use crate::distribution::{
    Alignee, DistError, DistPolicy, DistPosition, DistResult, DistSpec, DistTarget,
    FeedbackBalance, PerfModel, ThroughputBalance,
};
use crate::prelude::*;
use crate::topology::GridTopology;
use crate::types::{DeviceId, SeqId, Span};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OffloadError {
    #[error("map cache is full ({0} entries)")]
    CacheFull(usize),

    #[error("offload stack of device {device} exceeds its depth of {depth}")]
    StackOverflow { device: DeviceId, depth: usize },

    #[error("offload stack of device {0} is empty")]
    StackUnderflow(DeviceId),

    #[error("position {seqid} does not exist in a topology of {nnodes} positions")]
    InvalidPosition { seqid: SeqId, nnodes: usize },

    #[error("device {0} is not an active device")]
    UnknownDevice(DeviceId),

    #[error("map index {index} is out of range, the offload has {len} maps")]
    InvalidMapIndex { index: usize, len: usize },

    #[error("offload cannot go from stage {from:?} to stage {to:?}")]
    InvalidStage { from: OffloadStage, to: OffloadStage },

    #[error("loop level {level} is out of range, the offload has {levels} loop levels")]
    InvalidLoopLevel { level: usize, levels: usize },

    #[error("invalid alignee: {0}")]
    InvalidAlignee(String),
}

/// Distribution nodes that can be the target of an alignment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
enum Node {
    Map(usize, usize),
    Loop(usize),
}

impl Node {
    fn of(alignee: &Alignee) -> Node {
        match alignee.target {
            DistTarget::DataMap(index) => Node::Map(index, alignee.dim),
            DistTarget::LoopIteration => Node::Loop(alignee.dim),
        }
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Map(index, dim) => write!(f, "map {} dim {}", index, dim),
            Node::Loop(level) => write!(f, "loop level {}", level),
        }
    }
}

pub struct OffloadInfoBuilder {
    name: String,
    registry: Arc<DeviceRegistry>,
    topology: GridTopology,
    maps: Vec<DataMapInfo>,
    loops: Vec<DistSpec>,
    nested: bool,
}

impl OffloadInfoBuilder {
    pub fn new(
        name: impl Into<String>,
        registry: &Arc<DeviceRegistry>,
        topology: GridTopology,
    ) -> Self {
        Self {
            name: name.into(),
            registry: Arc::clone(registry),
            topology,
            maps: vec![],
            loops: vec![],
            nested: true,
        }
    }

    /// Whether offloads may run nested inside this one. Only such offloads are pushed on the
    /// offload stack of their devices. Defaults to `true`.
    pub fn nested(&mut self, nested: bool) -> &mut Self {
        self.nested = nested;
        self
    }

    /// Add an array and return its index, which [`Alignee::data_map`] refers to.
    pub fn map(&mut self, info: DataMapInfo) -> usize {
        self.maps.push(info);
        self.maps.len() - 1
    }

    /// Add a loop level and return its index.
    pub fn loop_dist(&mut self, spec: DistSpec) -> usize {
        self.loops.push(spec);
        self.loops.len() - 1
    }

    /// Align loop level `level` with `alignee`, keeping the range and grid axis of the level.
    pub fn align_loop(&mut self, level: usize, alignee: Alignee) -> Result<(), OffloadError> {
        let levels = self.loops.len();
        let spec = self
            .loops
            .get_mut(level)
            .ok_or(OffloadError::InvalidLoopLevel { level, levels })?;

        *spec = DistSpec::aligned(spec.range(), alignee).axis(spec.target_axis());
        Ok(())
    }

    fn spec(&self, node: Node) -> Option<&DistSpec> {
        match node {
            Node::Map(index, dim) => self.maps.get(index).and_then(|m| m.dists().get(dim)),
            Node::Loop(level) => self.loops.get(level),
        }
    }

    fn nodes(&self) -> Vec<Node> {
        let maps = enumerate(&self.maps)
            .flat_map(|(index, m)| (0..m.ndims()).map(move |dim| Node::Map(index, dim)));
        let loops = (0..self.loops.len()).map(Node::Loop);

        maps.chain(loops).collect()
    }

    /// Node that `node` is aligned to, if any.
    fn target(&self, node: Node) -> Option<Node> {
        self.spec(node)
            .filter(|s| s.policy().needs_alignee())
            .and_then(|s| s.get_alignee())
            .map(Node::of)
    }

    fn check(&self) -> Result {
        for &device in self.topology.idmap() {
            if !self.registry.is_active(device) {
                return Err(OffloadError::UnknownDevice(device).into());
            }
        }

        let ndims = self.topology.ndims();

        for node in self.nodes() {
            let spec = match self.spec(node) {
                Some(spec) => spec,
                None => continue,
            };

            if spec.target_axis() >= ndims {
                return Err(DistError::InvalidAxis {
                    axis: spec.target_axis(),
                    ndims,
                })
                .with_context(|| format!("{} of offload {}", node, self.name));
            }

            if spec.policy().needs_alignee() {
                let alignee = spec
                    .get_alignee()
                    .ok_or(DistError::MissingAlignee(spec.policy()))?;

                if self.spec(Node::of(alignee)).is_none() {
                    return Err(OffloadError::InvalidAlignee(format!(
                        "{} is aligned to {}, which does not exist",
                        node, alignee
                    ))
                    .into());
                }
            }

            // Every node has at most one outgoing edge, so any walk longer than the number
            // of nodes must revisit one.
            let mut seen = vec![node];
            let mut current = node;
            while let Some(next) = self.target(current) {
                if seen.contains(&next) {
                    let path = seen.iter().chain(Some(&next)).join(" -> ");
                    return Err(DistError::AlignmentCycle(path).into());
                }

                seen.push(next);
                current = next;
            }
        }

        Ok(())
    }

    fn perf_strategy(&self, axis: usize, model: PerfModel) -> ThroughputBalance {
        let perfs = (0..self.topology.extent(axis))
            .map(|index| {
                let mut coords: DimVec<usize> = (0..self.topology.ndims()).map(|_| 0).collect();
                coords[axis] = index;
                let device = self.topology.device(self.topology.seqid_at(&coords));

                self.registry
                    .device(device)
                    .map(|d| d.info().perf)
                    .unwrap_or_default()
            })
            .collect_vec();

        ThroughputBalance::from_perf(&perfs, model)
    }

    fn attach_strategy(&self, spec: &mut DistSpec) {
        if spec.get_strategy().is_some() {
            return;
        }

        let axis = spec.target_axis();
        match spec.policy() {
            DistPolicy::Model1Auto => {
                spec.set_strategy(Arc::new(self.perf_strategy(axis, PerfModel::Compute)))
            }
            DistPolicy::Model2Auto => {
                let model = PerfModel::ComputeTransfer;
                spec.set_strategy(Arc::new(self.perf_strategy(axis, model)))
            }
            DistPolicy::Feedback | DistPolicy::ProfileAuto => {
                spec.set_strategy(Arc::new(FeedbackBalance::new()))
            }
            _ => {}
        }
    }

    /// Validate the offload and prepare it for execution. Fails if a device of the topology
    /// is not registered, a distribution targets a grid axis that does not exist, or an
    /// alignment refers to a missing or cyclic target.
    pub fn build(mut self) -> Result<Arc<OffloadInfo>> {
        self.check()?;

        // Distributions that (transitively) follow a volatile one must be re-evaluated every
        // time they are applied.
        for node in self.nodes() {
            let mut volatile = false;
            let mut current = node;
            while let Some(next) = self.target(current) {
                volatile |= self.spec(next).map_or(false, |s| s.policy().is_volatile());
                current = next;
            }

            if let Some(spec) = self.spec(node) {
                spec.set_redist_needed(volatile);
            }
        }

        let mut maps = take(&mut self.maps);
        let mut loops = take(&mut self.loops);

        for spec in maps
            .iter_mut()
            .flat_map(|m| m.dists_mut())
            .chain(&mut loops)
        {
            self.attach_strategy(spec);
        }

        for info in &mut maps {
            info.attach(self.topology.idmap());
        }

        let nnodes = self.topology.nnodes();
        let loop_results = (0..nnodes)
            .map(|_| Mutex::new(vec![None; loops.len()]))
            .collect();

        let info = OffloadInfo {
            name: self.name,
            registry: self.registry,
            topology: self.topology,
            maps,
            loops,
            loop_results,
            nested: self.nested,
        };

        debug!("built offload {}", info);
        Ok(Arc::new(info))
    }
}

/// Everything the shepherds of an offload share.
pub struct OffloadInfo {
    name: String,
    registry: Arc<DeviceRegistry>,
    topology: GridTopology,
    maps: Vec<DataMapInfo>,
    loops: Vec<DistSpec>,
    loop_results: Vec<Mutex<Vec<Option<DistResult>>>>,
    nested: bool,
}

impl OffloadInfo {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether offloads may run nested inside this one.
    #[inline]
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    #[inline]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    #[inline]
    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    #[inline]
    pub fn maps(&self) -> &[DataMapInfo] {
        &self.maps
    }

    #[inline]
    pub fn loops(&self) -> &[DistSpec] {
        &self.loops
    }

    pub fn map_info(&self, index: usize) -> Result<&DataMapInfo, OffloadError> {
        self.maps.get(index).ok_or(OffloadError::InvalidMapIndex {
            index,
            len: self.maps.len(),
        })
    }

    /// Index of the map whose source is `buffer`.
    pub fn find_map(&self, buffer: &HostBuffer) -> Option<usize> {
        self.maps.iter().position(|m| m.is_source(buffer))
    }

    fn check_position(&self, seqid: SeqId) -> Result<(), OffloadError> {
        let nnodes = self.topology.nnodes();
        if seqid < nnodes {
            Ok(())
        } else {
            Err(OffloadError::InvalidPosition { seqid, nnodes })
        }
    }

    fn check_level(&self, level: usize) -> Result<(), OffloadError> {
        let levels = self.loops.len();
        if level < levels {
            Ok(())
        } else {
            Err(OffloadError::InvalidLoopLevel { level, levels })
        }
    }

    pub fn map_ref(self: &Arc<Self>, index: usize, seqid: SeqId) -> Result<MapRef, OffloadError> {
        self.map_info(index)?;
        self.check_position(seqid)?;
        Ok(MapRef::new(Arc::clone(self), index, seqid))
    }

    /// Position of `seqid` along grid axis `axis`.
    pub fn position(&self, seqid: SeqId, axis: usize) -> DistPosition {
        DistPosition {
            seqid,
            index: self.topology.coord(seqid, axis),
            count: self.topology.extent(axis),
        }
    }

    /// Current span of `alignee` on position `seqid`.
    ///
    /// A map that has already been distributed on this position contributes its stored
    /// result, otherwise its distribution is evaluated without storing it. Loop levels are
    /// distributed on demand and the result is stored.
    pub(crate) fn resolve_alignee(
        &self,
        alignee: &Alignee,
        seqid: SeqId,
        depth: usize,
    ) -> Result<Span> {
        if depth > self.maps.len() * crate::types::MAX_DIMS + self.loops.len() {
            return Err(DistError::AlignmentCycle(alignee.to_string()).into());
        }

        let dim = alignee.dim;

        match alignee.target {
            DistTarget::DataMap(index) => {
                let info = self.map_info(index)?;
                let spec = info.dists().get(dim).ok_or_else(|| {
                    let msg = format!("{} has no dimension {}", info.symbol(), dim);
                    OffloadError::InvalidAlignee(msg)
                })?;

                let map = info.map(seqid)?;
                if map.reached(crate::datamap::AccessLevel::Dist) {
                    if let Some(result) = map.dist_results().get(dim) {
                        return Ok(result.span());
                    }
                }

                let pos = self.position(seqid, spec.target_axis());
                let result = spec.apply(pos, &default(), |next| {
                    self.resolve_alignee(next, seqid, depth + 1)
                })?;

                Ok(result.span())
            }
            DistTarget::LoopIteration => {
                self.check_level(dim)?;
                self.check_position(seqid)?;

                if let Some(result) = self.loop_results[seqid].lock()[dim] {
                    return Ok(result.span());
                }

                self.apply_loop(dim, seqid, depth + 1).map(|r| r.span())
            }
        }
    }

    fn apply_loop(&self, level: usize, seqid: SeqId, depth: usize) -> Result<DistResult> {
        let spec = &self.loops[level];
        let prev = self.loop_results[seqid].lock()[level].unwrap_or_default();
        let pos = self.position(seqid, spec.target_axis());

        // The lock is not held while resolving, the alignee may be another loop level.
        let result = spec.apply(pos, &prev, |alignee| {
            self.resolve_alignee(alignee, seqid, depth)
        })?;

        self.loop_results[seqid].lock()[level] = Some(result);
        Ok(result)
    }

    /// Apply the distribution of loop level `level` on position `seqid` and return the
    /// iterations assigned to it. Iterative policies return the next chunk on every call.
    pub fn distribute_loop(&self, level: usize, seqid: SeqId) -> Result<Span> {
        self.check_level(level)?;
        self.check_position(seqid)?;

        let result = self
            .apply_loop(level, seqid, 0)
            .with_context(|| format!("failed to distribute loop level {}", level))?;

        trace!(
            "offload {}: loop level {} on position {}: {}",
            self.name,
            level,
            seqid,
            result.span()
        );

        Ok(result.span())
    }

    /// The last result of loop level `level` on position `seqid`.
    pub fn loop_result(&self, level: usize, seqid: SeqId) -> Option<DistResult> {
        self.loop_results
            .get(seqid)
            .and_then(|r| r.lock().get(level).copied().flatten())
    }
}

impl Display for OffloadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} on {}", self.name, self.topology)?;

        for (index, map) in enumerate(&self.maps) {
            writeln!(f, "  map {}: {}", index, map)?;
        }

        for (level, spec) in enumerate(&self.loops) {
            writeln!(f, "  loop {}: {}", level, spec)?;
        }

        Ok(())
    }
}

impl Debug for OffloadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadInfo")
            .field("name", &self.name)
            .field("topology", &self.topology)
            .field("maps", &self.maps)
            .field("loops", &self.loops)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::datamap::{MapDirection, MapType};
    use crate::device::HostArray;
    use crate::distribution::ChunkSize;
    use crate::types::{Config, DeviceKind, DevicePerf, DeviceSpec};

    /// Registry of `count` devices of the given kind.
    pub(crate) fn registry(
        kind: DeviceKind,
        count: usize,
        peer_access: bool,
    ) -> Arc<DeviceRegistry> {
        let spec = DeviceSpec::new("dev", kind)
            .count(count)
            .peer_access(peer_access);

        Arc::new(DeviceRegistry::from_specs(&[spec], Config::default()).unwrap())
    }

    /// Offload of `maps` over all devices of `registry`, with as many grid axes as the
    /// distributions target.
    pub(crate) fn offload(
        registry: &Arc<DeviceRegistry>,
        maps: Vec<DataMapInfo>,
    ) -> Arc<OffloadInfo> {
        let ndims = maps
            .iter()
            .flat_map(|m| m.dists())
            .map(|d| d.target_axis() + 1)
            .max()
            .unwrap_or(1);

        let devices = registry.active_devices().iter().map(|d| d.id()).collect_vec();
        let topology = GridTopology::new(&devices, ndims).unwrap();

        let mut builder = OffloadInfoBuilder::new("test", registry, topology);
        for map in maps {
            builder.map(map);
        }

        builder.build().unwrap()
    }

    fn array(symbol: &str, n: u64) -> DataMapInfo {
        DataMapInfo::new(
            symbol,
            HostArray::zeroed(n as usize * 8),
            &[n],
            8,
            MapDirection::ToFrom,
            MapType::Auto,
        )
        .unwrap()
    }

    #[test]
    fn test_build_errors() {
        let registry = registry(DeviceKind::HostCpu, 2, true);
        let topology = || GridTopology::simple(2, 1).unwrap();

        // unknown device
        let three = GridTopology::simple(3, 1).unwrap();
        let builder = OffloadInfoBuilder::new("x", &registry, three);
        let err = builder.build().unwrap_err();
        assert_eq!(
            err.downcast_ref::<OffloadError>(),
            Some(&OffloadError::UnknownDevice(DeviceId::new(2)))
        );

        // registered, but beyond the active-device cap
        let mut config = Config::default();
        config.devices.num_active_devices = Some(1);
        let spec = DeviceSpec::new("dev", DeviceKind::HostCpu).count(2);
        let capped = Arc::new(DeviceRegistry::from_specs(&[spec], config).unwrap());
        assert!(capped.device(DeviceId::new(1)).is_ok());

        let builder = OffloadInfoBuilder::new("x", &capped, topology());
        let err = builder.build().unwrap_err();
        assert_eq!(
            err.downcast_ref::<OffloadError>(),
            Some(&OffloadError::UnknownDevice(DeviceId::new(1)))
        );

        // axis beyond the grid
        let mut builder = OffloadInfoBuilder::new("x", &registry, topology());
        builder.loop_dist(DistSpec::block(0..10).axis(1));
        let err = builder.build().unwrap_err();
        assert_eq!(
            err.downcast_ref::<DistError>(),
            Some(&DistError::InvalidAxis { axis: 1, ndims: 1 })
        );

        // missing alignee target
        let mut builder = OffloadInfoBuilder::new("x", &registry, topology());
        builder.loop_dist(DistSpec::aligned(0..10, Alignee::data_map(0, 0)));
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OffloadError>(),
            Some(OffloadError::InvalidAlignee(_))
        ));

        // a -> loop 0 -> a
        let mut builder = OffloadInfoBuilder::new("x", &registry, topology());
        let a = builder.map(
            array("a", 10)
                .align(0, Alignee::loop_level(0))
                .unwrap(),
        );
        builder.loop_dist(DistSpec::aligned(0..10, Alignee::data_map(a, 0)));
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DistError>(),
            Some(DistError::AlignmentCycle(_))
        ));

        let mut builder = OffloadInfoBuilder::new("x", &registry, topology());
        assert_eq!(
            builder.align_loop(0, Alignee::loop_level(0)),
            Err(OffloadError::InvalidLoopLevel {
                level: 0,
                levels: 0
            })
        );
    }

    #[test]
    fn test_align_to_map() {
        let registry = registry(DeviceKind::HostCpu, 4, true);
        let mut builder =
            OffloadInfoBuilder::new("align", &registry, GridTopology::simple(4, 1).unwrap());

        let a = builder.map(
            array("a", 100)
                .dist_init(0, DistSpec::block(0..100))
                .unwrap(),
        );
        let b = builder.map(
            array("b", 100)
                .align(0, Alignee::data_map(a, 0).shifted(1))
                .unwrap(),
        );
        let level = builder.loop_dist(DistSpec::block(0..100));
        builder
            .align_loop(level, Alignee::data_map(b, 0))
            .unwrap();

        let offload = builder.build().unwrap();
        assert!(!offload.maps()[b].dist(0).needs_redistribution());

        // b resolves through a even though neither has been distributed yet
        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(26, 25));
        assert_eq!(offload.loop_result(level, 1).unwrap().counter, 1);

        let mb = offload.map_ref(b, 3).unwrap();
        mb.init().unwrap();
        assert_eq!(mb.distribute().unwrap(), 24);
        assert_eq!(mb.map().dist_results()[0].span(), Span::new(76, 24));
    }

    #[test]
    fn test_redistribution_flags() {
        let registry = registry(DeviceKind::HostCpu, 2, true);
        let mut builder =
            OffloadInfoBuilder::new("redist", &registry, GridTopology::simple(2, 1).unwrap());

        let level = builder.loop_dist(DistSpec::cyclic(0..20, ChunkSize::Absolute(2)));
        let a = builder.map(
            array("a", 20)
                .align(0, Alignee::loop_level(level))
                .unwrap(),
        );
        let b = builder.map(
            array("b", 20)
                .align(0, Alignee::data_map(a, 0))
                .unwrap(),
        );

        let offload = builder.build().unwrap();
        assert!(offload.maps()[a].dist(0).needs_redistribution());
        assert!(offload.maps()[b].dist(0).needs_redistribution());

        // the map follows the chunks of the loop
        let ma = offload.map_ref(a, 1).unwrap();
        ma.init().unwrap();

        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(2, 2));
        ma.distribute().unwrap();
        assert_eq!(ma.map().dist_results()[0].span(), Span::new(2, 2));

        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(6, 2));
        ma.distribute().unwrap();
        assert_eq!(ma.map().dist_results()[0].span(), Span::new(6, 2));
        assert_eq!(ma.map().dist_results()[0].counter, 2);
    }

    #[test]
    fn test_default_strategies() {
        let registry = Arc::new(
            DeviceRegistry::from_specs(
                &[
                    DeviceSpec::new("slow", DeviceKind::HostCpu).perf(DevicePerf {
                        flopss: 1.0,
                        ..default()
                    }),
                    DeviceSpec::new("fast", DeviceKind::ThreadSimulated).perf(DevicePerf {
                        flopss: 3.0,
                        ..default()
                    }),
                ],
                Config::default(),
            )
            .unwrap(),
        );

        let mut builder =
            OffloadInfoBuilder::new("auto", &registry, GridTopology::simple(2, 1).unwrap());
        let level = builder.loop_dist(DistSpec::new(DistPolicy::Model1Auto, 0..100));
        let feedback = builder.loop_dist(DistSpec::new(DistPolicy::Feedback, 0..100));
        let offload = builder.build().unwrap();

        assert!(offload.loops()[feedback].get_strategy().is_some());
        assert_eq!(offload.distribute_loop(level, 0).unwrap(), Span::new(0, 25));
        assert_eq!(offload.distribute_loop(level, 1).unwrap(), Span::new(25, 75));

        // no measurements yet: even split
        assert_eq!(offload.distribute_loop(feedback, 1).unwrap(), Span::new(50, 50));
    }

    #[test]
    fn test_invalid_positions() {
        let registry = registry(DeviceKind::HostCpu, 1, true);
        let offload = offload(&registry, vec![array("a", 4)]);

        assert_eq!(
            offload.map_ref(0, 1).unwrap_err(),
            OffloadError::InvalidPosition {
                seqid: 1,
                nnodes: 1
            }
        );
        assert_eq!(
            offload.map_ref(1, 0).unwrap_err(),
            OffloadError::InvalidMapIndex { index: 1, len: 1 }
        );

        let err = offload.distribute_loop(0, 0).unwrap_err();
        assert!(err.downcast_ref::<OffloadError>().is_some());
    }
}
