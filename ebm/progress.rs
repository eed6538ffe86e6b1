use std::fmt;

/// Phases reported during a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Sampling,
    Writing,
}

impl RunPhase {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Sampling => "Metropolis-Hastings sampling",
            Self::Writing => "result writing",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while the chain runs.
pub trait ChainProgressObserver {
    fn on_start(&mut self, phase: RunPhase, total: usize) {
        let _ = (phase, total);
    }
    fn on_iteration(&mut self, completed: usize, acceptance_ratio: f64, ln_likelihood: f64) {
        let _ = (completed, acceptance_ratio, ln_likelihood);
    }
    fn on_finish(&mut self, phase: RunPhase) {
        let _ = phase;
    }
}

#[derive(Default)]
pub struct NoopChainProgress;

impl ChainProgressObserver for NoopChainProgress {}
