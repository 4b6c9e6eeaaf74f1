use chrono::{Datelike, NaiveDate};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Fitted parameter names, in the order they appear in every vector encoding.
/// The eighth entry is only present when badgers are modelled explicitly.
pub const PARAM_NAMES: [&str; 8] = [
    "beta",
    "sigma",
    "gamma",
    "alpha",
    "alphaPrime",
    "testSensitivity",
    "mutationRate",
    "infectedBadgerLifetime",
];

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Malformed { path: PathBuf, line: usize },
    MissingKey { path: PathBuf, key: String },
    UnknownKey { path: PathBuf, key: String },
    InvalidValue { path: PathBuf, key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read {}: {}", path.display(), source)
            }
            ConfigError::Malformed { path, line } => {
                write!(f, "{}:{}: expected key = value", path.display(), line)
            }
            ConfigError::MissingKey { path, key } => {
                write!(f, "{}: missing key {}", path.display(), key)
            }
            ConfigError::UnknownKey { path, key } => {
                write!(f, "{}: unknown key {}", path.display(), key)
            }
            ConfigError::InvalidValue { path, key, value } => {
                write!(f, "{}: invalid value {:?} for {}", path.display(), value, key)
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Six-significant-digit exponential rendering used everywhere a fitted
/// parameter value is written out.
pub fn format_param(value: f64) -> String {
    format!("{value:.5e}")
}

/// Parse a date string with a chrono format, yielding days since CE.
pub fn parse_date(value: &str, format: &str) -> Option<i32> {
    NaiveDate::parse_from_str(value, format)
        .ok()
        .map(|d| d.num_days_from_ce())
}

/// Calendar year containing a days-since-CE day number.
pub fn year_of_day(day: i32) -> Option<i32> {
    NaiveDate::from_num_days_from_ce_opt(day).map(|d| d.year())
}

/// A `key = value` file with `#` comments and blank lines ignored.
///
/// Keys are consumed as they are read; whatever is left when `finish` runs is
/// an unknown key and rejects the whole file.
pub struct KvFile {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl KvFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path.to_path_buf(), &text)
    }

    pub(crate) fn parse(path: PathBuf, text: &str) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(ConfigError::Malformed {
                path: path.clone(),
                line: idx + 1,
            })?;
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn take(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn require(&mut self, key: &str) -> Result<String, ConfigError> {
        self.take(key).ok_or_else(|| ConfigError::MissingKey {
            path: self.path.clone(),
            key: key.to_string(),
        })
    }

    pub fn require_parsed<T: FromStr>(&mut self, key: &str) -> Result<T, ConfigError> {
        let value = self.require(key)?;
        value.parse().map_err(|_| ConfigError::InvalidValue {
            path: self.path.clone(),
            key: key.to_string(),
            value,
        })
    }

    pub fn take_parsed<T: FromStr>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.take(key) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
                path: self.path.clone(),
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Reject any keys that were never consumed.
    pub fn finish(self) -> Result<(), ConfigError> {
        match self.entries.into_keys().next() {
            None => Ok(()),
            Some(key) => Err(ConfigError::UnknownKey {
                path: self.path,
                key,
            }),
        }
    }
}

/// How a badger's SNP contribution is assembled when it infects a cow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiversityModel {
    Maximum,
    Minimum,
    Intermediate,
}

impl FromStr for DiversityModel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MAXIMUM" => Ok(DiversityModel::Maximum),
            "MINIMUM" => Ok(DiversityModel::Minimum),
            "INTERMEDIATE" => Ok(DiversityModel::Intermediate),
            _ => Err(()),
        }
    }
}

/// The fitted parameter vector as exchanged through the parameters file.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    pub beta: f64,
    pub sigma: f64,
    pub gamma: f64,
    pub alpha: f64,
    pub alpha_prime: f64,
    pub test_sensitivity: f64,
    pub mutation_rate: f64,
    pub infected_badger_lifetime: Option<f64>,
    /// Ensemble seed drawn by the controller for the next batch of scenarios.
    pub rng_seed: Option<u64>,
}

impl Parameters {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_kv(KvFile::load(path)?)
    }

    pub(crate) fn from_kv(mut kv: KvFile) -> Result<Self, ConfigError> {
        let params = Self {
            beta: kv.require_parsed("beta")?,
            sigma: kv.require_parsed("sigma")?,
            gamma: kv.require_parsed("gamma")?,
            alpha: kv.require_parsed("alpha")?,
            alpha_prime: kv.require_parsed("alphaPrime")?,
            test_sensitivity: kv.require_parsed("testSensitivity")?,
            mutation_rate: kv.require_parsed("mutationRate")?,
            infected_badger_lifetime: kv.take_parsed("infectedBadgerLifetime")?,
            rng_seed: kv.take_parsed("rngSeed")?,
        };
        kv.finish()?;
        Ok(params)
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        let mut text = String::new();
        let named = [
            ("beta", self.beta),
            ("sigma", self.sigma),
            ("gamma", self.gamma),
            ("alpha", self.alpha),
            ("alphaPrime", self.alpha_prime),
            ("testSensitivity", self.test_sensitivity),
            ("mutationRate", self.mutation_rate),
        ];
        for (name, value) in named {
            text.push_str(&format!("{name} = {}\n", format_param(value)));
        }
        if let Some(lifetime) = self.infected_badger_lifetime {
            text.push_str(&format!("infectedBadgerLifetime = {}\n", format_param(lifetime)));
        }
        if let Some(seed) = self.rng_seed {
            text.push_str(&format!("rngSeed = {seed}\n"));
        }
        fs::write(path, text)
    }

    /// The vector form used by the fitting controller, dimension 7 or 8.
    pub fn to_vector(&self) -> Vec<f64> {
        let mut values = vec![
            self.beta,
            self.sigma,
            self.gamma,
            self.alpha,
            self.alpha_prime,
            self.test_sensitivity,
            self.mutation_rate,
        ];
        if let Some(lifetime) = self.infected_badger_lifetime {
            values.push(lifetime);
        }
        values
    }

    pub fn from_vector(values: &[f64]) -> Self {
        Self {
            beta: values[0],
            sigma: values[1],
            gamma: values[2],
            alpha: values[3],
            alpha_prime: values[4],
            test_sensitivity: values[5],
            mutation_rate: values[6],
            infected_badger_lifetime: values.get(7).copied(),
            rng_seed: None,
        }
    }
}

/// Immutable per-scenario settings read at startup.
#[derive(Clone, Debug)]
pub struct ScenarioConfig {
    pub farm_ids_file: PathBuf,
    pub sett_ids_file: PathBuf,
    pub initial_infection_states: String,
    pub diversity_model: DiversityModel,
    pub slaughterhouse_moves_file: PathBuf,
    pub observed_snp_distance_file: PathBuf,
    pub movement_frequencies_file: PathBuf,
    pub sampling_rate_file: PathBuf,
    pub test_interval_years: i32,
    pub num_initial_restricted_herds: usize,
    pub max_outbreak_size: usize,
    pub step_size: i32,
    pub num_movements: u64,
    pub num_slaughters: u64,
    pub start_date: i32,
    pub end_date: i32,
    pub reservoirs_included: bool,
    pub date_format: String,
    pub badger_lifetime: Option<f64>,
}

impl ScenarioConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_kv(KvFile::load(path)?)
    }

    pub(crate) fn from_kv(mut kv: KvFile) -> Result<Self, ConfigError> {
        let date_format: String = kv.require("dateFormat")?;
        let mut date_field = |kv: &mut KvFile, key: &str| -> Result<i32, ConfigError> {
            let value = kv.require(key)?;
            parse_date(&value, &date_format).ok_or_else(|| ConfigError::InvalidValue {
                path: kv.path().to_path_buf(),
                key: key.to_string(),
                value,
            })
        };
        let start_date = date_field(&mut kv, "startDate")?;
        let end_date = date_field(&mut kv, "endDate")?;

        let diversity_value = kv.require("diversityModel")?;
        let diversity_model =
            diversity_value
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    path: kv.path().to_path_buf(),
                    key: "diversityModel".to_string(),
                    value: diversity_value,
                })?;

        let config = Self {
            farm_ids_file: PathBuf::from(kv.require("farmIds")?),
            sett_ids_file: PathBuf::from(kv.require("settIds")?),
            initial_infection_states: kv.require("initialInfectionStates")?,
            diversity_model,
            slaughterhouse_moves_file: PathBuf::from(kv.require("slaughterhouseMovesFile")?),
            observed_snp_distance_file: PathBuf::from(
                kv.require("observedSnpPairwiseDistanceFile")?,
            ),
            movement_frequencies_file: PathBuf::from(kv.require("movementFrequenciesFile")?),
            sampling_rate_file: PathBuf::from(kv.require("samplingRateFile")?),
            test_interval_years: kv.require_parsed("testIntervalInYears")?,
            num_initial_restricted_herds: kv.require_parsed("numInitialRestrictedHerds")?,
            max_outbreak_size: kv.require_parsed("maxOutbreakSize")?,
            step_size: kv.require_parsed("stepSize")?,
            num_movements: kv.require_parsed("numMovements")?,
            num_slaughters: kv.require_parsed("numSlaughters")?,
            start_date,
            end_date,
            reservoirs_included: kv.require_parsed("reservoirsIncluded")?,
            date_format,
            badger_lifetime: kv.take_parsed("badgerLifetime")?,
        };
        kv.finish()?;
        Ok(config)
    }

    pub fn test_interval_days(&self) -> i32 {
        365 * self.test_interval_years
    }
}

/// A fitted parameter's prior box.
#[derive(Clone, Copy, Debug)]
pub struct ParamRange {
    pub name: &'static str,
    pub lower: f64,
    pub upper: f64,
}

/// Settings of the fitting controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub num_scenarios: usize,
    pub smoothing_ratio: f64,
    pub percentage_deviation: f64,
    pub parameters_file: PathBuf,
    pub output_file: PathBuf,
    pub state_file: PathBuf,
    pub results_dir: PathBuf,
    pub results_file: PathBuf,
    pub include_badgers: bool,
    /// Seed for the chain's very first draw; later steps reseed themselves.
    pub rng_seed: Option<u64>,
    pub ranges: Vec<ParamRange>,
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_kv(KvFile::load(path)?)
    }

    pub(crate) fn from_kv(mut kv: KvFile) -> Result<Self, ConfigError> {
        let include_badgers: bool = kv.require_parsed("includeBadgers")?;
        let mut ranges = Vec::new();
        for name in &PARAM_NAMES[..7] {
            ranges.push(Self::range(&mut kv, name, &format!("{name}Range"))?);
        }
        if include_badgers {
            // Historical key: the lifetime prior never carried a Range suffix.
            ranges.push(Self::range(&mut kv, PARAM_NAMES[7], PARAM_NAMES[7])?);
        }

        let config = Self {
            num_scenarios: kv.require_parsed("numScenarios")?,
            smoothing_ratio: kv.require_parsed("smoothingRatio")?,
            percentage_deviation: kv.require_parsed("percentageDeviation")?,
            parameters_file: PathBuf::from(kv.require("parametersFile")?),
            output_file: PathBuf::from(kv.require("outputFile")?),
            state_file: PathBuf::from(kv.require("stateFile")?),
            results_dir: PathBuf::from(kv.require("resultsDir")?),
            results_file: PathBuf::from(kv.require("resultsFile")?),
            include_badgers,
            rng_seed: kv.take_parsed("rngSeed")?,
            ranges,
        };
        kv.finish()?;
        Ok(config)
    }

    fn range(kv: &mut KvFile, name: &'static str, key: &str) -> Result<ParamRange, ConfigError> {
        let value = kv.require(key)?;
        let invalid = || ConfigError::InvalidValue {
            path: kv.path().to_path_buf(),
            key: key.to_string(),
            value: value.clone(),
        };
        let (lower, upper) = value.split_once(':').ok_or_else(|| invalid())?;
        let lower: f64 = lower.trim().parse().map_err(|_| invalid())?;
        let upper: f64 = upper.trim().parse().map_err(|_| invalid())?;
        if !(lower <= upper) {
            return Err(invalid());
        }
        Ok(ParamRange { name, lower, upper })
    }

    /// Dimension of the fitted parameter space, 7 or 8.
    pub fn dimension(&self) -> usize {
        self.ranges.len()
    }
}
