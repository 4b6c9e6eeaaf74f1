use super::Scenario;
use crate::animal::CowId;
use crate::config::year_of_day;
use crate::stats::{multinomial_log_likelihood, Histogram};
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

/// Draws of the sampled-cow pool before scoring gives up on an empty pool.
const MAX_SAMPLING_ATTEMPTS: u32 = 10;

/// Number of SNPs separating two genotypes: the symmetric set difference.
pub fn snp_distance(a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> u32 {
    a.symmetric_difference(b).count() as u32
}

/// Everything one scenario reports back to the fitting controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResults {
    #[serde(with = "extended_f64")]
    pub loglikelihood: f64,
    pub num_cow_cow_transmissions: u64,
    pub num_cow_badger_transmissions: u64,
    pub num_badger_cow_transmissions: u64,
    pub num_reactors: u64,
    pub num_breakdowns: u64,
    pub num_detected_animals_at_slaughter: u64,
    pub num_undetected_animals_at_slaughter: u64,
    pub num_infected_animals_moved: u64,
    pub reactors_at_breakdown_distribution: String,
    pub snp_distance_distribution: String,
}

impl ScenarioResults {
    /// Conventional file name for one scenario's results.
    pub fn file_name(id: usize) -> String {
        format!("scenario_{id}.results")
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        let text = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(io::Error::other)
    }
}

impl Scenario {
    /// Score the finished run against the observed SNP distance distribution
    /// and assemble the result record.
    pub(crate) fn score(&mut self) -> ScenarioResults {
        let (loglikelihood, snp_histogram) = self.snp_likelihood();
        let tallies = &self.tallies;
        ScenarioResults {
            loglikelihood,
            num_cow_cow_transmissions: tallies.cow_cow_transmissions,
            num_cow_badger_transmissions: tallies.cow_badger_transmissions,
            num_badger_cow_transmissions: tallies.badger_cow_transmissions,
            num_reactors: tallies.reactors,
            num_breakdowns: tallies.breakdowns,
            num_detected_animals_at_slaughter: tallies.detected_at_slaughter,
            num_undetected_animals_at_slaughter: tallies.undetected_at_slaughter,
            num_infected_animals_moved: tallies.infected_moved,
            reactors_at_breakdown_distribution: tallies.reactors_at_breakdown.to_string(),
            snp_distance_distribution: snp_histogram.to_string(),
        }
    }

    fn snp_likelihood(&mut self) -> (f64, Histogram) {
        let sampled = self.sample_cows();
        let mut histogram = Histogram::default();
        for (idx, &a) in sampled.iter().enumerate() {
            for &b in &sampled[idx + 1..] {
                histogram.add(snp_distance(
                    &self.cows[a.0 as usize].snps,
                    &self.cows[b.0 as usize].snps,
                ));
            }
        }
        match multinomial_log_likelihood(&self.settings.observed, &histogram) {
            Ok(log_l) => (log_l, histogram),
            Err(e) => {
                // Invariant failure inside the likelihood; the scenario still
                // reports, with no likelihood contribution.
                error!("likelihood aborted: {e}");
                (f64::NEG_INFINITY, histogram)
            }
        }
    }

    /// Subsample the genotyped cows per year at the configured rates.
    fn sample_cows(&mut self) -> Vec<CowId> {
        let mut buckets: BTreeMap<i32, Vec<CowId>> = BTreeMap::new();
        for cow_id in self.tree.cows().collect::<Vec<_>>() {
            let cow = &self.cows[cow_id.0 as usize];
            if !cow.sampled() {
                continue;
            }
            if let Some(year) = year_of_day(cow.date_sample_taken) {
                buckets.entry(year).or_default().push(cow_id);
            }
        }

        for _ in 0..MAX_SAMPLING_ATTEMPTS {
            let mut pool = Vec::new();
            for (year, bucket) in &buckets {
                let rate = self
                    .settings
                    .sampling_rates
                    .get(year)
                    .copied()
                    .unwrap_or(0.0);
                let keep = ((bucket.len() as f64 * rate).floor() as usize).min(bucket.len());
                if keep == 0 {
                    continue;
                }
                let chosen = rand::seq::index::sample(&mut self.rng, bucket.len(), keep);
                pool.extend(chosen.into_iter().map(|idx| bucket[idx]));
            }
            if !pool.is_empty() {
                return pool;
            }
        }
        Vec::new()
    }
}


/// Serialize `f64` allowing the non-finite values JSON cannot express.
pub(crate) mod extended_f64 {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("nan")
        } else if *value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        struct ExtendedF64;

        impl Visitor<'_> for ExtendedF64 {
            type Value = f64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a float or one of \"inf\", \"-inf\", \"nan\"")
            }

            fn visit_f64<E>(self, v: f64) -> Result<f64, E> {
                Ok(v)
            }

            fn visit_i64<E>(self, v: i64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_u64<E>(self, v: u64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
                match v {
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    "nan" => Ok(f64::NAN),
                    _ => Err(E::custom(format!("unexpected float string {v:?}"))),
                }
            }
        }

        deserializer.deserialize_any(ExtendedF64)
    }
}
