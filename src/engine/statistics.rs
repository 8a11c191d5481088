use crate::engine::Step;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepOutcome {
    Succeeded(Duration),
    Failed(String),
}

/// What happened during this session. Only ever displayed, never consulted.
#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    pub steps: Vec<(Step, StepOutcome)>,
    pub cloned: bool,
    pub node_version: Option<String>,
    pub pnpm_version: Option<String>,
    pub build_duration: Option<Duration>,
    pub last_build: Option<SystemTime>,
    pub package_size_mb: Option<f64>,
}

impl RunStatistics {
    pub fn record(&mut self, step: Step, outcome: StepOutcome) {
        self.steps.push((step, outcome));
    }

    #[cfg(test)]
    pub fn last_outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .rev()
            .find(|(s, _)| *s == step)
            .map(|(_, o)| o)
    }

    pub fn total_duration(&self) -> Duration {
        self.steps
            .iter()
            .filter_map(|(_, o)| match o {
                StepOutcome::Succeeded(d) => Some(*d),
                StepOutcome::Failed(_) => None,
            })
            .sum()
    }

    pub fn clear(&mut self) {
        *self = RunStatistics::default();
    }
}
