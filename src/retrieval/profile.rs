use std::{
    fmt,
    time::{Duration, Instant},
};

/// Wall time spent in each stage of a request
#[derive(Debug)]
pub struct Profiler {
    started: Instant,
    last: Instant,
    stages: Vec<(&'static str, Duration)>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            stages: Vec::new(),
        }
    }

    /// Ends the current stage
    pub fn mark(&mut self, stage: &'static str) {
        let now = Instant::now();
        self.stages.push((stage, now - self.last));
        self.last = now;
    }

    pub fn total(&self) -> Duration {
        self.last - self.started
    }

    pub fn stages(&self) -> &[(&'static str, Duration)] {
        &self.stages
    }

    pub fn is_slow(&self, threshold: Duration) -> bool {
        self.total() > threshold
    }
}

impl fmt::Display for Profiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "total={:?}", self.total())?;
        for (stage, took) in &self.stages {
            write!(f, " {stage}={took:?}")?;
        }
        Ok(())
    }
}
