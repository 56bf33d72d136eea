//! Strategies that decide the relative share of work for the balancing policies.
use std::fmt::Debug;
use std::time::Duration;

use crate::prelude::*;
use crate::types::DevicePerf;

/// Returns the relative amount of work that each of `count` grid positions should receive.
///
/// Weights do not have to be normalized. Invalid weights (negative, NaN, or all zero) cause the
/// distribution to fall back to an even split.
pub trait BalanceStrategy: Send + Sync + Debug {
    fn weights(&self, count: usize) -> Vec<f64>;
}

fn even(count: usize) -> Vec<f64> {
    vec![1.0; count]
}

/// How per-device performance figures are turned into a throughput factor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PerfModel {
    /// Floating-point throughput only.
    Compute,

    /// Compute and host-device transfer combined, as if every element requires one unit of
    /// compute and one unit of transfer.
    ComputeTransfer,
}

impl PerfModel {
    pub fn factor(&self, perf: &DevicePerf) -> f64 {
        match self {
            PerfModel::Compute => perf.flopss,
            PerfModel::ComputeTransfer => {
                if perf.flopss <= 0.0 || perf.bandwidth <= 0.0 {
                    0.0
                } else {
                    1.0 / (1.0 / perf.flopss + 1.0 / perf.bandwidth)
                }
            }
        }
    }
}

/// Static split proportional to a fixed throughput factor per position.
#[derive(Clone, Debug)]
pub struct ThroughputBalance {
    factors: Vec<f64>,
}

impl ThroughputBalance {
    pub fn new(factors: Vec<f64>) -> Self {
        Self { factors }
    }

    pub fn from_perf<'a, I>(perfs: I, model: PerfModel) -> Self
    where
        I: IntoIterator<Item = &'a DevicePerf>,
    {
        Self::new(perfs.into_iter().map(|p| model.factor(p)).collect())
    }

    pub fn factors(&self) -> &[f64] {
        &self.factors
    }
}

impl BalanceStrategy for ThroughputBalance {
    fn weights(&self, count: usize) -> Vec<f64> {
        if self.factors.len() == count {
            self.factors.clone()
        } else {
            warn!(
                "throughput balance has {} factors but {} positions, splitting evenly",
                self.factors.len(),
                count
            );
            even(count)
        }
    }
}

/// Split proportional to the throughput measured during previous executions.
///
/// Until every position has reported at least one measurement the split is even.
#[derive(Debug, Default)]
pub struct FeedbackBalance {
    samples: Mutex<Vec<Option<f64>>>,
}

impl FeedbackBalance {
    pub fn new() -> Self {
        default()
    }

    /// Record that position `index` processed `elements` in `elapsed` time.
    pub fn record(&self, index: usize, elements: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        let mut samples = self.samples.lock();
        if samples.len() <= index {
            samples.resize(index + 1, None);
        }

        let throughput = elements as f64 / secs;
        samples[index] = Some(match samples[index] {
            // exponential moving average
            Some(old) => 0.5 * old + 0.5 * throughput,
            None => throughput,
        });
    }

    pub fn throughput(&self, index: usize) -> Option<f64> {
        self.samples.lock().get(index).copied().flatten()
    }
}

impl BalanceStrategy for FeedbackBalance {
    fn weights(&self, count: usize) -> Vec<f64> {
        let samples = self.samples.lock();
        if samples.len() != count {
            return even(count);
        }

        match samples.iter().copied().collect::<Option<Vec<f64>>>() {
            Some(weights) => weights,
            None => even(count),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_throughput() {
        let perfs = [
            DevicePerf {
                flopss: 100.0,
                bandwidth: 100.0,
                latency: 0.0,
            },
            DevicePerf {
                flopss: 300.0,
                bandwidth: 100.0,
                latency: 0.0,
            },
        ];

        let compute = ThroughputBalance::from_perf(&perfs, PerfModel::Compute);
        assert_eq!(compute.weights(2), vec![100.0, 300.0]);
        assert_eq!(compute.weights(3), vec![1.0, 1.0, 1.0]);

        let combined = ThroughputBalance::from_perf(&perfs, PerfModel::ComputeTransfer);
        let w = combined.weights(2);
        assert!((w[0] - 50.0).abs() < 1e-9);
        assert!((w[1] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_feedback() {
        let balance = FeedbackBalance::new();
        assert_eq!(balance.weights(2), vec![1.0, 1.0]);

        balance.record(1, 300, Duration::from_secs(1));
        assert_eq!(balance.weights(2), vec![1.0, 1.0]);
        assert_eq!(balance.throughput(0), None);

        balance.record(0, 100, Duration::from_secs(1));
        assert_eq!(balance.weights(2), vec![100.0, 300.0]);

        balance.record(0, 300, Duration::from_secs(1));
        assert_eq!(balance.throughput(0), Some(200.0));

        balance.record(0, 1, Duration::from_secs(0));
        assert_eq!(balance.throughput(0), Some(200.0));
    }
}
