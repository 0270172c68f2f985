/// Running aggregate of one bin.
///
/// Mean and variance use Welford's update, two bins combine with Chan's parallel
/// formula so partial aggregates from separate workers can be folded in any grouping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    first: f64,
    last: f64,
    mean: f64,
    m2: f64,
}

impl BinStats {
    pub fn new(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
            first: value,
            last: value,
            mean: value,
            m2: 0.0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Folds `later` into `self`; `later` must cover samples after `self`'s
    pub fn merge(&mut self, later: &BinStats) {
        let (na, nb) = (self.count as f64, later.count as f64);
        let n = na + nb;
        let delta = later.mean - self.mean;

        self.mean += delta * nb / n;
        self.m2 += later.m2 + delta * delta * na * nb / n;
        self.count += later.count;
        self.sum += later.sum;
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.last = later.last;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation (n - 1), 0 for a single value
    pub fn std_dev(&self) -> f64 {
        match self.count {
            0 | 1 => 0.0,
            n => (self.m2 / (n - 1) as f64).sqrt(),
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn first(&self) -> f64 {
        self.first
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    /// `[mean, std dev, min, max, count]`
    pub fn summary(&self) -> Vec<f64> {
        vec![
            self.mean(),
            self.std_dev(),
            self.min,
            self.max,
            self.count as f64,
        ]
    }
}
