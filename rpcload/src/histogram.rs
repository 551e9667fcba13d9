use core::time::Duration;

/// Latency histogram with logarithmic buckets, in microseconds.
#[derive(Debug, Clone)]
pub struct LogHistogram {
    bounds: Vec<f64>,
    buckets: Vec<u64>,
    factor: f64,
}

impl Default for LogHistogram {
    fn default() -> Self {
        let mut bounds = Vec::new();
        let max = 60000000.0; // 60s
        let factor = 1.5;
        let mut curr = 1.0;
        while curr < max {
            bounds.push(curr);
            curr *= factor;
        }
        let buckets = vec![0; bounds.len()];

        Self { bounds, buckets, factor }
    }
}

impl LogHistogram {
    /// Returns the number of samples recorded.
    #[inline]
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Returns non-empty buckets as `(upper bound, count)` pairs.
    pub fn buckets(&self) -> impl Iterator<Item = (Duration, u64)> + '_ {
        self.bounds
            .iter()
            .zip(&self.buckets)
            .filter(|(_, &count)| count > 0)
            .map(|(&bound, &count)| (Duration::from_micros((bound * self.factor) as u64), count))
    }

    #[inline]
    pub fn record(&mut self, duration: Duration) {
        let us = duration.as_micros() as u64;
        let idx = (us as f64).log(self.factor) as usize;
        let idx = idx.min(self.buckets.len() - 1);
        self.buckets[idx] += 1;
    }

    /// Calculates the quantile.
    ///
    /// Suppose we have the following histogram, in linear coordinates:
    /// +---+------+--------+----------------+-----------+
    /// | i | b[i] | sum[i] | Duration range | Histogram |
    /// +---+------+--------+----------------+-----------+
    /// | 0 | 2    | 2      | [0; f^0)       | **        |
    /// | 1 | 1    | 3      | [f^0; f^1)     | *         |
    /// | 2 | 9    | 12     | [f^1; f^2)     | ********* |
    /// | . | .... | ...... | ..........     |           |
    /// | N | 4    | 1000   | [f^(N-1); Inf  | ****      |
    /// +---+------+--------+----------------+-----------+
    ///
    /// For the given quantile "q" find the first index "i", where
    /// sum[i] + b[i] >= q * sum[N], then interpolate linearly in logarithmic
    /// coordinates by base "f" between sum[i] and sum[i+1]:
    ///
    /// x = (q * sum[N] - (sum[i] - b[i] * i)) / b[i]
    ///
    /// The result is "f^x".
    pub fn quantile(&self, q: f64) -> Duration {
        assert!((0.0..=1.0).contains(&q));

        let size: u64 = self.count();
        if size == 0 {
            return Duration::ZERO;
        }

        let mut sum = 0;
        for (idx, &b) in self.buckets.iter().enumerate() {
            if ((sum + b) as f64) >= q * (size as f64) {
                let idx = idx as f64;
                let b = b as f64;
                let sum = sum as f64;
                let size = size as f64;
                let c_inv = |q: f64| self.factor.powf((q * size - sum) / b + idx);

                return Duration::from_micros(c_inv(q) as u64);
            }
            sum += b;
        }

        Duration::MAX
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty() {
        let h = LogHistogram::default();
        assert_eq!(0, h.count());
        assert_eq!(Duration::ZERO, h.quantile(0.5));
        assert_eq!(0, h.buckets().count());
    }

    #[test]
    fn test_zero_quantile() {
        let mut h = LogHistogram::default();
        h.record(Duration::from_millis(1));
        assert_eq!(Duration::ZERO, h.quantile(0.0));
    }

    #[test]
    fn test_low_bound_quantile() {
        let cases: &[[u64; 45]] = &[
            [
                213, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 151, 0, 0, 0, 0, 0, 36, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
            [
                319, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 57, 0, 0, 0, 24, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
                0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            ],
        ];
        for c in cases {
            let h = LogHistogram {
                buckets: c.to_vec(),
                ..Default::default()
            };
            assert_eq!(Duration::from_micros(1), h.quantile(0.10));
            assert_eq!(Duration::from_micros(1), h.quantile(0.50));
        }
    }

    #[test]
    fn test_quantiles_are_monotonic() {
        let mut h = LogHistogram::default();
        for ms in 1..=100 {
            h.record(Duration::from_millis(ms));
        }

        assert_eq!(100, h.count());
        let p50 = h.quantile(0.5);
        let p90 = h.quantile(0.9);
        let p99 = h.quantile(0.99);
        assert!(p50 <= p90 && p90 <= p99);
        assert!(p50 >= Duration::from_millis(20) && p50 <= Duration::from_millis(80));
    }

    #[test]
    fn test_buckets_skip_empty() {
        let mut h = LogHistogram::default();
        h.record(Duration::from_millis(10));
        h.record(Duration::from_millis(10));
        h.record(Duration::from_secs(1));

        let buckets: Vec<_> = h.buckets().collect();
        assert_eq!(2, buckets.len());
        assert_eq!(2, buckets[0].1);
        assert!(buckets[0].0 < buckets[1].0);
    }
}
