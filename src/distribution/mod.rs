//! Distribution of one-dimensional ranges over the positions of a grid axis.
//!
//! A [`DistSpec`] describes how one dimension of an array (or one level of a loop nest) is
//! partitioned. Every time a position *applies* the spec it receives a [`DistResult`]
//! holding the span it is responsible for. Static policies return the same span on every
//! application, the iterative policies (cyclic, dynamic, guided) hand out the next piece of
//! work on every application until the range is exhausted.
mod balance;
mod dynamic;
mod split;

pub use balance::{BalanceStrategy, FeedbackBalance, PerfModel, ThroughputBalance};
pub use dynamic::RaceCounter;

use smallvec::SmallVec;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::prelude::*;
use crate::types::{SeqId, Span};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistError {
    #[error("{0} distribution requires an alignee")]
    MissingAlignee(DistPolicy),

    #[error("fixed distribution has {got} spans but the axis has {expected} positions")]
    FixedMismatch { expected: usize, got: usize },

    #[error("static ratio distribution has {got} ratios but the axis has {expected} positions")]
    RatioMismatch { expected: usize, got: usize },

    #[error("{0} distribution cannot be planned without executing it")]
    NotPlannable(DistPolicy),

    #[error("alignment of {0} forms a cycle")]
    AlignmentCycle(String),

    #[error("axis {axis} is out of range for a {ndims}-dimensional topology")]
    InvalidAxis { axis: usize, ndims: usize },
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DistPolicy {
    /// Every position receives the entire range.
    Full,
    /// Contiguous even split, the remainder goes to the first positions.
    Block,
    /// Round-robin chunks.
    Cyclic,
    /// Follow the distribution of another array or loop.
    Align,
    /// Like `Align`, but only the first application follows the alignee.
    Bind,
    /// Caller-provided spans.
    Fix,
    StaticRatio,
    StaticChunk,
    Dynamic,
    Guided,
    Feedback,
    Model1Auto,
    Model2Auto,
    ProfileAuto,
}

impl DistPolicy {
    /// Whether successive applications return different spans.
    pub fn is_iterative(&self) -> bool {
        matches!(
            self,
            DistPolicy::Cyclic | DistPolicy::Dynamic | DistPolicy::Guided
        )
    }

    /// Whether the split is decided by a [`BalanceStrategy`].
    pub fn is_balanced(&self) -> bool {
        matches!(
            self,
            DistPolicy::Feedback
                | DistPolicy::Model1Auto
                | DistPolicy::Model2Auto
                | DistPolicy::ProfileAuto
        )
    }

    pub fn needs_alignee(&self) -> bool {
        matches!(self, DistPolicy::Align | DistPolicy::Bind)
    }

    /// Whether the result changes over time, so that distributions aligned to it must be
    /// re-evaluated whenever they are applied.
    pub fn is_volatile(&self) -> bool {
        self.is_iterative() || self.is_balanced()
    }

    pub fn name(&self) -> &'static str {
        use DistPolicy::*;
        match self {
            Full => "FULL",
            Block => "BLOCK",
            Cyclic => "CYCLIC",
            Align => "ALIGN",
            Bind => "BIND",
            Fix => "FIX",
            StaticRatio => "STATIC_RATIO",
            StaticChunk => "STATIC_CHUNK",
            Dynamic => "DYNAMIC",
            Guided => "GUIDED",
            Feedback => "FEEDBACK",
            Model1Auto => "MODEL_1_AUTO",
            Model2Auto => "MODEL_2_AUTO",
            ProfileAuto => "PROFILE_AUTO",
        }
    }
}

impl Display for DistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size of the chunks handed out by the chunked policies.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ChunkSize {
    /// Policy-dependent default.
    Default,
    Absolute(u64),
    /// Percentage of the range length.
    Percent(u64),
}

impl ChunkSize {
    /// Decode the classic integer encoding: negative values are percentages, zero selects the
    /// default.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => ChunkSize::Default,
            r if r < 0 => ChunkSize::Percent(r.unsigned_abs()),
            r => ChunkSize::Absolute(r as u64),
        }
    }

    /// Chunk size in elements for a range of `length` elements over `count` positions. Never
    /// returns zero.
    pub fn resolve(&self, policy: DistPolicy, length: u64, count: usize) -> u64 {
        use shepherd_core::util::div_ceil;
        let count = max(count, 1) as u64;

        let chunk = match *self {
            ChunkSize::Absolute(n) => n,
            ChunkSize::Percent(p) => div_ceil(length.saturating_mul(p), 100),
            ChunkSize::Default => match policy {
                DistPolicy::Guided => 1,
                DistPolicy::Cyclic | DistPolicy::Dynamic => div_ceil(length, 4 * count),
                _ => div_ceil(length, count),
            },
        };

        max(chunk, 1)
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Default
    }
}

/// What an aligned distribution follows.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum DistTarget {
    /// The loop distribution of the offload.
    LoopIteration,
    /// The distribution of another array mapped by the same offload (by index).
    DataMap(usize),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Alignee {
    pub target: DistTarget,
    pub dim: usize,
    pub shift: i64,
}

impl Alignee {
    pub fn data_map(index: usize, dim: usize) -> Self {
        Self {
            target: DistTarget::DataMap(index),
            dim,
            shift: 0,
        }
    }

    pub fn loop_level(dim: usize) -> Self {
        Self {
            target: DistTarget::LoopIteration,
            dim,
            shift: 0,
        }
    }

    pub fn shifted(mut self, shift: i64) -> Self {
        self.shift = shift;
        self
    }
}

impl Display for Alignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            DistTarget::LoopIteration => write!(f, "loop[{}]", self.dim)?,
            DistTarget::DataMap(index) => write!(f, "map#{}[{}]", index, self.dim)?,
        }

        if self.shift != 0 {
            write!(f, "{:+}", self.shift)?;
        }

        Ok(())
    }
}

/// Outcome of applying a distribution on one position.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct DistResult {
    pub offset: u64,
    pub length: u64,
    /// Number of times the distribution has been applied.
    pub counter: u64,
    /// Total number of elements assigned over all applications.
    pub acc_length: u64,
}

impl DistResult {
    #[inline]
    pub fn span(&self) -> Span {
        Span::new(self.offset, self.length)
    }

    fn advance(&self, span: Span) -> Self {
        Self {
            offset: span.offset,
            length: span.length,
            counter: self.counter + 1,
            acc_length: self.acc_length + span.length,
        }
    }
}

/// A position on the grid axis that a distribution targets.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DistPosition {
    pub seqid: SeqId,
    /// Coordinate of the position along the axis.
    pub index: usize,
    /// Number of positions along the axis.
    pub count: usize,
}

/// Distribution of one dimension of an array or loop.
#[derive(Debug)]
pub struct DistSpec {
    policy: DistPolicy,
    range: Span,
    axis: usize,
    chunk: ChunkSize,
    alignee: Option<Alignee>,
    fixed: Vec<Span>,
    ratios: Vec<f64>,
    strategy: Option<Arc<dyn BalanceStrategy>>,
    redist_needed: AtomicBool,
    counter: RaceCounter,
}

impl DistSpec {
    pub fn new(policy: DistPolicy, range: impl Into<Span>) -> Self {
        Self {
            policy,
            range: range.into(),
            axis: 0,
            chunk: ChunkSize::Default,
            alignee: None,
            fixed: vec![],
            ratios: vec![],
            strategy: None,
            redist_needed: AtomicBool::new(false),
            counter: RaceCounter::new(),
        }
    }

    pub fn full(range: impl Into<Span>) -> Self {
        Self::new(DistPolicy::Full, range)
    }

    pub fn block(range: impl Into<Span>) -> Self {
        Self::new(DistPolicy::Block, range)
    }

    pub fn cyclic(range: impl Into<Span>, chunk: ChunkSize) -> Self {
        Self::new(DistPolicy::Cyclic, range).chunk(chunk)
    }

    /// Follow `alignee`. The range bounds the aligned spans.
    pub fn aligned(range: impl Into<Span>, alignee: Alignee) -> Self {
        Self::new(DistPolicy::Align, range).alignee(alignee)
    }

    pub fn bound(range: impl Into<Span>, alignee: Alignee) -> Self {
        Self::new(DistPolicy::Bind, range).alignee(alignee)
    }

    pub fn fixed(range: impl Into<Span>, spans: Vec<Span>) -> Self {
        let mut this = Self::new(DistPolicy::Fix, range);
        this.fixed = spans;
        this
    }

    pub fn ratio(range: impl Into<Span>, ratios: Vec<f64>) -> Self {
        let mut this = Self::new(DistPolicy::StaticRatio, range);
        this.ratios = ratios;
        this
    }

    pub fn axis(mut self, axis: usize) -> Self {
        self.axis = axis;
        self
    }

    pub fn chunk(mut self, chunk: ChunkSize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn alignee(mut self, alignee: Alignee) -> Self {
        self.alignee = Some(alignee);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn BalanceStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[inline]
    pub fn policy(&self) -> DistPolicy {
        self.policy
    }

    #[inline]
    pub fn range(&self) -> Span {
        self.range
    }

    #[inline]
    pub fn target_axis(&self) -> usize {
        self.axis
    }

    #[inline]
    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk
    }

    #[inline]
    pub fn get_alignee(&self) -> Option<&Alignee> {
        self.alignee.as_ref()
    }

    #[inline]
    pub fn get_strategy(&self) -> Option<&Arc<dyn BalanceStrategy>> {
        self.strategy.as_ref()
    }

    pub(crate) fn set_strategy(&mut self, strategy: Arc<dyn BalanceStrategy>) {
        self.strategy = Some(strategy);
    }

    pub fn needs_redistribution(&self) -> bool {
        self.policy.is_volatile() || self.redist_needed.load(Ordering::Acquire)
    }

    pub(crate) fn set_redist_needed(&self, needed: bool) {
        self.redist_needed.store(needed, Ordering::Release);
    }

    #[inline]
    pub fn race_counter(&self) -> &RaceCounter {
        &self.counter
    }

    /// Restart the iterative policies from the beginning of the range.
    pub fn reset(&self) {
        self.counter.reset();
    }

    /// Apply the distribution on position `pos`. `prev` is the result of the previous
    /// application on this position (or the default for the first one) and `resolve` returns
    /// the current span of an alignee for the same position.
    pub fn apply<F>(
        &self,
        pos: DistPosition,
        prev: &DistResult,
        resolve: F,
    ) -> Result<DistResult>
    where
        F: FnOnce(&Alignee) -> Result<Span>,
    {
        let range = self.range;
        let length = range.length;
        let count = max(pos.count, 1);

        let relative = |s: Span| Span::new(s.offset + range.offset, s.length);

        let span = match self.policy {
            DistPolicy::Full => range,
            DistPolicy::Block => relative(split::block(length, pos.index, count)),
            DistPolicy::Cyclic => {
                let chunk = self.chunk.resolve(self.policy, length, count);
                relative(split::cyclic(
                    length,
                    pos.index,
                    count,
                    chunk,
                    prev.counter,
                ))
            }
            DistPolicy::Align | DistPolicy::Bind => {
                if self.policy == DistPolicy::Bind && prev.counter > 0 {
                    prev.span()
                } else {
                    let alignee = self
                        .alignee
                        .as_ref()
                        .ok_or(DistError::MissingAlignee(self.policy))?;

                    let span = resolve(alignee)?;
                    span.shift(alignee.shift)
                }
            }
            DistPolicy::Fix => {
                if self.fixed.len() != count {
                    return Err(DistError::FixedMismatch {
                        expected: count,
                        got: self.fixed.len(),
                    }
                    .into());
                }

                self.fixed[pos.index]
            }
            DistPolicy::StaticRatio => {
                if self.ratios.len() != count {
                    return Err(DistError::RatioMismatch {
                        expected: count,
                        got: self.ratios.len(),
                    }
                    .into());
                }

                relative(split::weighted(length, pos.index, &self.ratios))
            }
            DistPolicy::StaticChunk => {
                let chunk = self.chunk.resolve(self.policy, length, count);
                relative(split::static_chunk(length, pos.index, count, chunk))
            }
            DistPolicy::Dynamic => {
                let chunk = self.chunk.resolve(self.policy, length, count);
                relative(self.counter.claim_fixed(length, chunk))
            }
            DistPolicy::Guided => {
                let chunk = self.chunk.resolve(self.policy, length, count);
                relative(self.counter.claim_guided(length, count, chunk))
            }
            DistPolicy::Feedback
            | DistPolicy::Model1Auto
            | DistPolicy::Model2Auto
            | DistPolicy::ProfileAuto => {
                let weights = match &self.strategy {
                    Some(strategy) => strategy.weights(count),
                    None => vec![1.0; count],
                };

                relative(split::weighted(length, pos.index, &weights))
            }
        };

        Ok(prev.advance(range.clip(span)))
    }

    /// Compute the spans of every position along an axis of `count` positions, without any
    /// side effects. For the cyclic policy, all chunks of each position are returned.
    pub fn plan(&self, count: usize) -> Result<Vec<SmallVec<[Span; 4]>>> {
        if self.policy.needs_alignee()
            || matches!(self.policy, DistPolicy::Dynamic | DistPolicy::Guided)
        {
            return Err(DistError::NotPlannable(self.policy).into());
        }

        let policy = self.policy;
        let no_alignee = |_: &Alignee| -> Result<Span> {
            Err(DistError::NotPlannable(policy).into())
        };
        let rounds = if self.policy == DistPolicy::Cyclic {
            let chunk = self.chunk.resolve(self.policy, self.range.length, count);
            split::cyclic_rounds(self.range.length, max(count, 1), chunk)
        } else {
            1
        };

        let mut plan = vec![];
        for index in 0..count {
            let pos = DistPosition {
                seqid: index,
                index,
                count,
            };

            let mut spans = SmallVec::new();
            let mut result = DistResult::default();

            for _ in 0..rounds {
                result = self.apply(pos, &result, no_alignee)?;
                if !result.span().is_empty() || rounds == 1 {
                    spans.push(result.span());
                }
            }

            plan.push(spans);
        }

        Ok(plan)
    }
}

impl Display for DistSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} on axis {}", self.policy, self.range, self.axis)?;

        if let Some(alignee) = &self.alignee {
            write!(f, " aligned with {}", alignee)?;
        }

        match self.chunk {
            ChunkSize::Default => Ok(()),
            ChunkSize::Absolute(n) => write!(f, " chunk {}", n),
            ChunkSize::Percent(p) => write!(f, " chunk {}%", p),
        }
    }
}
