pub mod proposal;

use crate::config::{ConfigError, ControllerConfig, Parameters};
use crate::scenario::score::{extended_f64, ScenarioResults};
use crate::stats::Samples;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Chain seed when the controller config does not pin one.
const DEFAULT_CHAIN_SEED: u64 = 42;

/// Metric names in the order they appear in the output CSV.
const METRIC_NAMES: [&str; 9] = [
    "logLikelihood",
    "numCowCowTransmissions",
    "numCowBadgerTransmissions",
    "numBadgerCowTransmissions",
    "numReactors",
    "numBreakdowns",
    "numDetectedAnimalsAtSlaughter",
    "numUndetectedAnimalsAtSlaughter",
    "numInfectedAnimalsMoved",
];

#[derive(Debug)]
pub enum FitError {
    Config(ConfigError),
    Io { path: PathBuf, source: io::Error },
    State { path: PathBuf, source: serde_json::Error },
    MalformedState(&'static str),
    /// The adapted covariance is not positive definite.
    ProposalCovariance,
    /// Rejection sampling never landed inside the prior box.
    ProposalExhausted,
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitError::Config(e) => write!(f, "{e}"),
            FitError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            FitError::State { path, source } => {
                write!(f, "unreadable state {}: {}", path.display(), source)
            }
            FitError::MalformedState(what) => write!(f, "malformed state: {what}"),
            FitError::ProposalCovariance => {
                write!(f, "proposal covariance is not positive definite")
            }
            FitError::ProposalExhausted => {
                write!(f, "proposal rejection sampling exhausted its attempts")
            }
        }
    }
}

impl Error for FitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FitError::Config(e) => Some(e),
            FitError::Io { source, .. } => Some(source),
            FitError::State { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for FitError {
    fn from(e: ConfigError) -> Self {
        FitError::Config(e)
    }
}

/// Persisted fitting chain state, written back after every controller pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub proposed_step: String,
    pub current_step: String,
    #[serde(with = "extended_f64")]
    pub log_likelihood: f64,
    pub num_steps: u64,
    pub num_accepted_steps: u64,
    pub last_step_accepted: bool,
    pub rng_seed: u64,
    /// Running means, comma-separated decimals.
    pub means: String,
    /// Running covariances, row-major comma-separated decimals.
    pub covariances: String,
}

impl ControllerState {
    pub fn load(path: &Path) -> Result<Option<Self>, FitError> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path).map_err(|source| FitError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| FitError::State {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn write(&self, path: &Path) -> Result<(), FitError> {
        let text = serde_json::to_string_pretty(self).map_err(|source| FitError::State {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| FitError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn means_vector(&self, n: usize) -> Result<DVector<f64>, FitError> {
        let values = decode_decimals(&self.means, "means")?;
        if values.len() != n {
            return Err(FitError::MalformedState("means dimension"));
        }
        Ok(DVector::from_vec(values))
    }

    pub fn covariance_matrix(&self, n: usize) -> Result<DMatrix<f64>, FitError> {
        let values = decode_decimals(&self.covariances, "covariances")?;
        if values.len() != n * n {
            return Err(FitError::MalformedState("covariance dimension"));
        }
        Ok(DMatrix::from_row_slice(n, n, &values))
    }

    pub fn set_means(&mut self, means: &DVector<f64>) {
        self.means = encode_decimals(means.as_slice());
    }

    pub fn set_covariances(&mut self, cov: &DMatrix<f64>) {
        let rows: Vec<f64> = (0..cov.nrows())
            .flat_map(|i| (0..cov.ncols()).map(move |j| cov[(i, j)]))
            .collect();
        self.covariances = encode_decimals(&rows);
    }
}

fn encode_decimals(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn decode_decimals(text: &str, what: &'static str) -> Result<Vec<f64>, FitError> {
    text.split(',')
        .map(|v| v.trim().parse().map_err(|_| FitError::MalformedState(what)))
        .collect()
}

/// Per-metric accumulation over one ensemble of scenario result files.
#[derive(Debug, Default)]
pub struct AggregatedResults {
    pub log_likelihood: Samples,
    pub cow_cow_transmissions: Samples,
    pub cow_badger_transmissions: Samples,
    pub badger_cow_transmissions: Samples,
    pub reactors: Samples,
    pub breakdowns: Samples,
    pub detected_at_slaughter: Samples,
    pub undetected_at_slaughter: Samples,
    pub infected_moved: Samples,
    pub reactors_at_breakdown: BTreeMap<u32, Samples>,
    pub snp_distance: BTreeMap<u32, Samples>,
}

impl AggregatedResults {
    /// Read `scenario_<id>.results` for every expected id; a missing or
    /// unreadable file contributes nothing.
    pub fn read_dir(dir: &Path, num_scenarios: usize) -> Self {
        let mut aggregated = Self::default();
        for id in 0..num_scenarios {
            let path = dir.join(ScenarioResults::file_name(id));
            match ScenarioResults::load(&path) {
                Ok(results) => aggregated.push(&results),
                Err(e) => warn!("scenario {id} contributed no results: {e}"),
            }
        }
        aggregated
    }

    pub fn push(&mut self, results: &ScenarioResults) {
        if results.loglikelihood.is_finite() {
            self.log_likelihood.add(results.loglikelihood);
        }
        self.cow_cow_transmissions
            .add(results.num_cow_cow_transmissions as f64);
        self.cow_badger_transmissions
            .add(results.num_cow_badger_transmissions as f64);
        self.badger_cow_transmissions
            .add(results.num_badger_cow_transmissions as f64);
        self.reactors.add(results.num_reactors as f64);
        self.breakdowns.add(results.num_breakdowns as f64);
        self.detected_at_slaughter
            .add(results.num_detected_animals_at_slaughter as f64);
        self.undetected_at_slaughter
            .add(results.num_undetected_animals_at_slaughter as f64);
        self.infected_moved
            .add(results.num_infected_animals_moved as f64);
        Self::push_distribution(
            &mut self.reactors_at_breakdown,
            &results.reactors_at_breakdown_distribution,
        );
        Self::push_distribution(&mut self.snp_distance, &results.snp_distance_distribution);
    }

    fn push_distribution(target: &mut BTreeMap<u32, Samples>, encoded: &str) {
        match encoded.parse::<crate::stats::Histogram>() {
            Ok(hist) => {
                for (&bin, &count) in hist.iter() {
                    target.entry(bin).or_default().add(count as f64);
                }
            }
            Err(e) => warn!("skipping malformed distribution: {e}"),
        }
    }

    fn metrics(&self) -> [&Samples; 9] {
        [
            &self.log_likelihood,
            &self.cow_cow_transmissions,
            &self.cow_badger_transmissions,
            &self.badger_cow_transmissions,
            &self.reactors,
            &self.breakdowns,
            &self.detected_at_slaughter,
            &self.undetected_at_slaughter,
            &self.infected_moved,
        ]
    }
}

/// Outcome of one controller pass, for caller-side reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// First invocation: priors sampled, no acceptance decision yet.
    Initialised,
    Advanced { accepted: bool },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricSummary {
    #[serde(with = "extended_f64")]
    mean: f64,
    stddev: f64,
}

impl From<&Samples> for MetricSummary {
    fn from(samples: &Samples) -> Self {
        Self {
            mean: if samples.is_empty() {
                f64::NEG_INFINITY
            } else {
                samples.mean()
            },
            stddev: samples.std_dev(),
        }
    }
}

/// One accepted ensemble, appended to the results file as a JSON line.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedSummary<'a> {
    step: u64,
    parameters: &'a [f64],
    metrics: BTreeMap<&'static str, MetricSummary>,
    reactors_at_breakdown: BTreeMap<u32, MetricSummary>,
    snp_distance: BTreeMap<u32, MetricSummary>,
}

/// Adaptive Metropolis driver over file-mediated scenario ensembles.
pub struct Controller<'a> {
    config: &'a ControllerConfig,
}

impl<'a> Controller<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Run one controller pass: initialise the chain, or consume the waiting
    /// ensemble and propose the next parameter vector.
    pub fn step(&self) -> Result<StepOutcome, FitError> {
        match ControllerState::load(&self.config.state_file)? {
            None => self.initialise(),
            Some(state) if state.num_steps == 0 => self.initialise(),
            Some(state) => self.advance(state),
        }
    }

    /// Sample the starting point uniformly from the prior box and set up the
    /// output files. Later steps reseed themselves from the persisted state,
    /// so the configured seed makes the whole chain reproducible.
    fn initialise(&self) -> Result<StepOutcome, FitError> {
        let config = self.config;
        let mut rng =
            ChaCha12Rng::seed_from_u64(config.rng_seed.unwrap_or(DEFAULT_CHAIN_SEED));
        let theta: Vec<f64> = config
            .ranges
            .iter()
            .map(|r| rng.random_range(r.lower..=r.upper))
            .collect();
        let n = theta.len();

        let means = DVector::from_vec(theta.clone());
        let mut cov = DMatrix::zeros(n, n);
        for i in 0..n {
            cov[(i, i)] = config.percentage_deviation * theta[i] / 100.0;
        }

        let encoded = proposal::encode_step(&theta);
        let mut state = ControllerState {
            proposed_step: encoded.clone(),
            current_step: encoded,
            log_likelihood: f64::NEG_INFINITY,
            num_steps: 1,
            num_accepted_steps: 0,
            last_step_accepted: false,
            rng_seed: rng.random(),
            means: String::new(),
            covariances: String::new(),
        };
        state.set_means(&means);
        state.set_covariances(&cov);

        self.write_parameters(&theta, state.rng_seed)?;
        self.write_output_header()?;
        state.write(&config.state_file)?;
        info!("fitting chain initialised at {}", state.proposed_step);
        Ok(StepOutcome::Initialised)
    }

    /// Consume the ensemble produced for the proposed step, decide acceptance
    /// and propose the next point.
    fn advance(&self, mut state: ControllerState) -> Result<StepOutcome, FitError> {
        let config = self.config;
        let n = config.dimension();
        let mut rng = ChaCha12Rng::seed_from_u64(state.rng_seed);
        let step = state.num_steps;

        let results = AggregatedResults::read_dir(&config.results_dir, config.num_scenarios);
        let theta = proposal::decode_step(&state.proposed_step)?;
        if theta.len() != n {
            return Err(FitError::MalformedState("proposed step dimension"));
        }

        let accepted = if step == 1 {
            true
        } else if results.log_likelihood.is_empty() {
            false
        } else if state.log_likelihood == f64::NEG_INFINITY {
            true
        } else {
            let u: f64 = rng.random();
            u.ln()
                < (results.log_likelihood.mean() - state.log_likelihood) / config.smoothing_ratio
        };

        if accepted {
            state.current_step = state.proposed_step.clone();
            state.log_likelihood = if results.log_likelihood.is_empty() {
                f64::NEG_INFINITY
            } else {
                results.log_likelihood.mean()
            };
            state.num_accepted_steps += 1;
            self.append_summary(step, &theta, &results)?;
        }
        state.last_step_accepted = accepted;
        self.append_output_row(&theta, accepted, &results)?;

        let mut means = state.means_vector(n)?;
        let mut cov = state.covariance_matrix(n)?;
        proposal::update_moments(&mut means, &mut cov, &theta, step);

        let lower: Vec<f64> = config.ranges.iter().map(|r| r.lower).collect();
        let upper: Vec<f64> = config.ranges.iter().map(|r| r.upper).collect();
        let next = proposal::truncated_mvn(&means, &cov, &lower, &upper, &mut rng)?;

        state.set_means(&means);
        state.set_covariances(&cov);
        state.proposed_step = proposal::encode_step(next.as_slice());
        state.num_steps += 1;
        state.rng_seed = rng.random();

        self.write_parameters(next.as_slice(), state.rng_seed)?;
        state.write(&config.state_file)?;
        info!(
            "step {step}: {} (chain at {})",
            if accepted { "accepted" } else { "rejected" },
            state.current_step
        );
        Ok(StepOutcome::Advanced { accepted })
    }

    fn write_parameters(&self, theta: &[f64], rng_seed: u64) -> Result<(), FitError> {
        let mut params = Parameters::from_vector(theta);
        params.rng_seed = Some(rng_seed);
        params
            .write(&self.config.parameters_file)
            .map_err(|source| FitError::Io {
                path: self.config.parameters_file.clone(),
                source,
            })
    }

    fn write_output_header(&self) -> Result<(), FitError> {
        let mut columns: Vec<String> = self
            .config
            .ranges
            .iter()
            .map(|r| r.name.to_string())
            .collect();
        columns.push("accepted".to_string());
        for name in METRIC_NAMES {
            columns.push(format!("{name}Mean"));
            columns.push(format!("{name}Stddev"));
        }
        fs::write(&self.config.output_file, columns.join(",") + "\n").map_err(|source| {
            FitError::Io {
                path: self.config.output_file.clone(),
                source,
            }
        })
    }

    /// One CSV row per controller pass: the evaluated parameters, the accept
    /// flag and every metric's mean/stddev pair.
    fn append_output_row(
        &self,
        theta: &[f64],
        accepted: bool,
        results: &AggregatedResults,
    ) -> Result<(), FitError> {
        let mut fields: Vec<String> = theta.iter().map(|v| v.to_string()).collect();
        fields.push(if accepted { "1" } else { "0" }.to_string());
        for samples in results.metrics() {
            let summary = MetricSummary::from(samples);
            fields.push(summary.mean.to_string());
            fields.push(summary.stddev.to_string());
        }
        self.append_line(&self.config.output_file, &(fields.join(",") + "\n"))
    }

    fn append_summary(
        &self,
        step: u64,
        theta: &[f64],
        results: &AggregatedResults,
    ) -> Result<(), FitError> {
        let metrics: BTreeMap<&'static str, MetricSummary> = METRIC_NAMES
            .iter()
            .zip(results.metrics())
            .map(|(&name, samples)| (name, MetricSummary::from(samples)))
            .collect();
        let summarise = |map: &BTreeMap<u32, Samples>| -> BTreeMap<u32, MetricSummary> {
            map.iter()
                .map(|(&bin, samples)| (bin, MetricSummary::from(samples)))
                .collect()
        };
        let summary = AcceptedSummary {
            step,
            parameters: theta,
            metrics,
            reactors_at_breakdown: summarise(&results.reactors_at_breakdown),
            snp_distance: summarise(&results.snp_distance),
        };
        let line = serde_json::to_string(&summary).map_err(|source| FitError::State {
            path: self.config.results_file.clone(),
            source,
        })?;
        self.append_line(&self.config.results_file, &(line + "\n"))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), FitError> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| FitError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        file.write_all(line.as_bytes()).map_err(|source| FitError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
