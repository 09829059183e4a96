/// Folds two messages addressed to the same vertex into one, so a worker
/// buffers and ships a single message per receiver.
pub trait Combine<M>: Send + Sync {
    fn combine(&self, a: M, b: M) -> M;
}

pub struct SumCombiner;

impl Combine<f64> for SumCombiner {
    fn combine(&self, a: f64, b: f64) -> f64 {
        a + b
    }
}

pub struct MinCombiner;

impl Combine<f64> for MinCombiner {
    fn combine(&self, a: f64, b: f64) -> f64 {
        f64::min(a, b)
    }
}

impl Combine<u64> for MinCombiner {
    fn combine(&self, a: u64, b: u64) -> u64 {
        a.min(b)
    }
}
