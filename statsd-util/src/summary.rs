use sketches_ddsketch::{Config, DDSketch};

/// A quantile sketch with relative-error guarantees.
///
/// Based on [DDSketch][ddsketch], `Summary` provides quantiles over an arbitrary distribution of
/// floating-point numbers, including for negative numbers, using a space-efficient sketch that
/// provides relative-error guarantees, regardless of the absolute range between the smallest and
/// larger values.
///
/// Numbers whose magnitude is at or below the configured `min_value` are counted as zeroes.
///
/// Memory usage for `Summary` should be nearly identical to `DDSketch` when only using positive
/// numbers, but as `Summary` supports negative numbers as well, memory usage could be as high as 2x
/// that of `DDSketch`.
///
/// [ddsketch]: https://arxiv.org/abs/1908.10693
#[derive(Clone)]
pub struct Summary {
    negative: DDSketch,
    positive: DDSketch,
    min_value: f64,
    zeroes: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl Summary {
    /// Creates a new [`Summary`].
    ///
    /// `alpha` represents the desired relative error for this summary. If `alpha` was 0.001, that
    /// would represent a desired relative error of 0.1%.
    ///
    /// `max_buckets` controls how many subbuckets are created, which directly influences memory
    /// usage. Each bucket "costs" eight bytes, and buckets are only allocated as needed.
    ///
    /// `min_value` controls the smallest value that will be recognized distinctly from zero.
    pub fn new(alpha: f64, max_buckets: u32, min_value: f64) -> Summary {
        let config = Config::new(alpha, max_buckets, min_value.abs());

        Summary {
            negative: DDSketch::new(config.clone()),
            positive: DDSketch::new(config),
            min_value: min_value.abs(),
            zeroes: 0,
            min: None,
            max: None,
        }
    }

    /// Adds a sample to the summary.
    pub fn add(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }

        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));

        let vabs = value.abs();
        if vabs <= self.min_value {
            self.zeroes += 1;
        } else if value > 0.0 {
            self.positive.add(vabs);
        } else {
            self.negative.add(vabs);
        }
    }

    /// Gets the estimated value at the given quantile.
    ///
    /// If the sketch is empty, or if the quantile is less than 0.0 or greater than 1.0, then the
    /// result will be `None`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) || self.is_empty() {
            return None;
        }

        // The extremes are tracked exactly.
        if q == 0.0 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }

        let ncount = self.negative.count();
        let zcount = self.zeroes;
        let pcount = self.positive.count();
        let total = ncount + zcount + pcount;
        let rank = ((q * total as f64).ceil() as usize).max(1);

        if rank <= ncount {
            // The negative sketch holds magnitudes, so the smallest values have the largest magnitudes.
            let nq = 1.0 - (rank as f64 / ncount as f64);
            self.negative.quantile(nq).ok().flatten().map(|v| -v)
        } else if rank <= ncount + zcount {
            Some(0.0)
        } else {
            let pq = (rank - ncount - zcount) as f64 / pcount as f64;
            self.positive.quantile(pq).ok().flatten()
        }
    }

    /// Gets the number of samples in this summary.
    pub fn count(&self) -> usize {
        self.negative.count() + self.positive.count() + self.zeroes
    }

    /// Returns `true` if the summary has no samples.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::Summary;

    fn summary() -> Summary {
        Summary::new(0.01, 1_024, 1.0e-9)
    }

    #[test]
    fn empty() {
        let summary = summary();
        assert!(summary.is_empty());
        assert_eq!(summary.quantile(0.5), None);
        assert_eq!(summary.quantile(0.0), None);
    }

    #[test]
    fn out_of_range_quantiles() {
        let mut summary = summary();
        summary.add(1.0);
        assert_eq!(summary.quantile(-0.1), None);
        assert_eq!(summary.quantile(1.1), None);
    }

    #[test]
    fn positive_values() {
        let mut summary = summary();
        for i in 1..=100 {
            summary.add(f64::from(i));
        }

        assert_eq!(summary.count(), 100);
        assert_eq!(summary.quantile(0.0), Some(1.0));
        assert_eq!(summary.quantile(1.0), Some(100.0));

        let median = summary.quantile(0.5).expect("summary is not empty");
        assert_relative_eq!(median, 50.0, epsilon = 1.5);

        let p90 = summary.quantile(0.9).expect("summary is not empty");
        assert_relative_eq!(p90, 90.0, epsilon = 1.5);
    }

    #[test]
    fn zeroes_are_counted() {
        let mut summary = summary();
        summary.add(0.0);
        summary.add(0.0);
        summary.add(0.0);
        summary.add(10.0);

        assert_eq!(summary.count(), 4);
        assert_eq!(summary.quantile(0.5), Some(0.0));
        assert_eq!(summary.quantile(1.0), Some(10.0));
    }

    #[test]
    fn negative_values() {
        let mut summary = summary();
        for i in 1..=10 {
            summary.add(-f64::from(i));
        }

        assert_eq!(summary.quantile(0.0), Some(-10.0));
        assert_eq!(summary.quantile(1.0), Some(-1.0));

        let low = summary.quantile(0.1).expect("summary is not empty");
        assert!(low < -8.0, "low quantile should sit near the minimum, got {}", low);
    }

    #[test]
    fn nan_is_ignored() {
        let mut summary = summary();
        summary.add(f64::NAN);
        assert!(summary.is_empty());
    }
}
