use rand::Rng;
use statrs::function::factorial::ln_factorial;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// Probabilities below this floor contribute nothing to the multinomial sum.
const PROB_FLOOR: f64 = 1e-15;

/// Streaming mean and standard deviation over a sequence of observations.
#[derive(Clone, Debug, Default)]
pub struct Samples {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Samples {
    pub fn add(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn len(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample standard deviation; zero with fewer than two observations.
    pub fn std_dev(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            (self.m2 / (self.n - 1) as f64).sqrt()
        }
    }
}

/// Ordered integer histogram with the `bin:count,...` wire encoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Histogram {
    bins: BTreeMap<u32, u64>,
}

impl Histogram {
    pub fn add(&mut self, bin: u32) {
        self.add_count(bin, 1);
    }

    pub fn add_count(&mut self, bin: u32, count: u64) {
        *self.bins.entry(bin).or_insert(0) += count;
    }

    pub fn get(&self, bin: u32) -> u64 {
        self.bins.get(&bin).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.bins.values().sum()
    }

    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &u64)> {
        self.bins.iter()
    }

    /// Draw one recorded value, weighted by its count.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<u32> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let mut remaining = rng.random_range(0..total);
        for (&bin, &count) in &self.bins {
            if remaining < count {
                return Some(bin);
            }
            remaining -= count;
        }
        None
    }
}

impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bin, count) in &self.bins {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{bin}:{count}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Histogram {
    type Err = StatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hist = Histogram::default();
        for entry in s.split(',').filter(|e| !e.trim().is_empty()) {
            let (bin, count) = entry
                .split_once(':')
                .ok_or_else(|| StatsError::MalformedBin(entry.to_string()))?;
            let bin = bin
                .trim()
                .parse()
                .map_err(|_| StatsError::MalformedBin(entry.to_string()))?;
            let count = count
                .trim()
                .parse()
                .map_err(|_| StatsError::MalformedBin(entry.to_string()))?;
            hist.add_count(bin, count);
        }
        Ok(hist)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    /// The renormalised histogram does not sum to the observed total.
    BinSumMismatch { sum: u64, expected: u64 },
    MalformedBin(String),
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsError::BinSumMismatch { sum, expected } => {
                write!(f, "Sum_x != N ({sum} != {expected})")
            }
            StatsError::MalformedBin(entry) => {
                write!(f, "malformed histogram entry {entry:?}, expected bin:count")
            }
        }
    }
}

impl Error for StatsError {}

/// Rescale histogram counts so they sum to `target`, rounding per bin.
///
/// Per-bin rounding can leave the total off by a few counts; callers that
/// require an exact total must check it afterwards.
pub fn normalise_bins(hist: &Histogram, target: u64) -> Histogram {
    let sum = hist.total();
    let mut out = Histogram::default();
    if sum == 0 {
        return out;
    }
    let scale = target as f64 / sum as f64;
    for (&bin, &count) in hist.iter() {
        let scaled = (count as f64 * scale).round() as u64;
        if scaled > 0 {
            out.add_count(bin, scaled);
        }
    }
    out
}

/// Multinomial log-likelihood of `simulated` under the `observed` frequencies.
///
/// The simulated histogram is first rescaled to the observed total. Returns
/// negative infinity when the simulated distribution is empty or spreads over
/// more bins than were observed; a rescaling that misses the observed total is
/// an invariant failure and is reported as an error.
pub fn multinomial_log_likelihood(
    observed: &Histogram,
    simulated: &Histogram,
) -> Result<f64, StatsError> {
    if simulated.is_empty() || simulated.num_bins() > observed.num_bins() {
        return Ok(f64::NEG_INFINITY);
    }
    let n = observed.total();
    let bins = normalise_bins(simulated, n);
    let sum = bins.total();
    if sum != n {
        return Err(StatsError::BinSumMismatch { sum, expected: n });
    }
    let mut log_l = ln_factorial(n);
    for (&bin, &count) in bins.iter() {
        log_l -= ln_factorial(count);
        let prob = observed.get(bin) as f64 / n as f64;
        if prob >= PROB_FLOOR {
            log_l += count as f64 * prob.ln();
        }
    }
    Ok(log_l)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    #[test]
    fn samples_match_naive_mean_and_sd() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut samples = Samples::default();
        for v in values {
            samples.add(v);
        }
        assert_eq!(samples.len(), 8);
        assert!((samples.mean() - 5.0).abs() < 1e-12);
        let naive_var =
            values.iter().map(|v| (v - 5.0) * (v - 5.0)).sum::<f64>() / (values.len() - 1) as f64;
        assert!((samples.std_dev() - naive_var.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_samples_are_zero() {
        let samples = Samples::default();
        assert!(samples.is_empty());
        assert_eq!(samples.mean(), 0.0);
        assert_eq!(samples.std_dev(), 0.0);
    }

    #[test]
    fn histogram_round_trips_through_string() {
        let mut hist = Histogram::default();
        hist.add_count(0, 12);
        hist.add_count(3, 1);
        hist.add_count(7, 4);
        let encoded = hist.to_string();
        assert_eq!(encoded, "0:12,3:1,7:4");
        let decoded: Histogram = encoded.parse().unwrap();
        assert_eq!(decoded, hist);
    }

    #[test]
    fn empty_histogram_encodes_as_empty_string() {
        let hist = Histogram::default();
        assert_eq!(hist.to_string(), "");
        let decoded: Histogram = "".parse().unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn malformed_histogram_entry_is_rejected() {
        assert!("1:2,bogus".parse::<Histogram>().is_err());
    }

    #[test]
    fn weighted_sampling_respects_counts() {
        let mut hist = Histogram::default();
        hist.add_count(5, 1);
        hist.add_count(9, 999);
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let mut nines = 0;
        for _ in 0..200 {
            if hist.sample(&mut rng) == Some(9) {
                nines += 1;
            }
        }
        assert!(nines > 190);
        assert_eq!(Histogram::default().sample(&mut rng), None);
    }

    #[test]
    fn normalise_bins_scales_towards_target() {
        let mut hist = Histogram::default();
        hist.add_count(0, 2);
        hist.add_count(1, 2);
        let scaled = normalise_bins(&hist, 8);
        assert_eq!(scaled.get(0), 4);
        assert_eq!(scaled.get(1), 4);
        assert_eq!(scaled.total(), 8);
    }

    #[test]
    fn bin_sum_mismatch_is_surfaced() {
        // Three equal bins cannot be rounded onto a total of 10.
        let mut observed = Histogram::default();
        for bin in 0..3 {
            observed.add_count(bin, 3);
        }
        observed.add_count(3, 1);
        let mut simulated = Histogram::default();
        for bin in 0..3 {
            simulated.add_count(bin, 1);
        }
        let err = multinomial_log_likelihood(&observed, &simulated).unwrap_err();
        assert_eq!(
            err,
            StatsError::BinSumMismatch {
                sum: 9,
                expected: 10
            }
        );
        assert!(err.to_string().contains("Sum_x != N"));
    }

    #[test]
    fn multinomial_matches_hand_computation() {
        let mut observed = Histogram::default();
        observed.add_count(0, 2);
        observed.add_count(2, 2);
        let simulated = observed.clone();
        let log_l = multinomial_log_likelihood(&observed, &simulated).unwrap();
        // ln 4! - 2 ln 2! + 4 ln 0.5
        let expected = 24f64.ln() - 2.0 * 2f64.ln() + 4.0 * 0.5f64.ln();
        assert!((log_l - expected).abs() < 1e-12);
    }

    #[test]
    fn wider_simulated_support_scores_negative_infinity() {
        let mut observed = Histogram::default();
        observed.add_count(0, 5);
        let mut simulated = Histogram::default();
        simulated.add_count(0, 3);
        simulated.add_count(1, 2);
        let log_l = multinomial_log_likelihood(&observed, &simulated).unwrap();
        assert_eq!(log_l, f64::NEG_INFINITY);
        let log_l = multinomial_log_likelihood(&observed, &Histogram::default()).unwrap();
        assert_eq!(log_l, f64::NEG_INFINITY);
    }
}
