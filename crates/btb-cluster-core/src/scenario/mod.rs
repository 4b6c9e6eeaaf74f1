pub mod events;
pub mod kernel;
pub mod observer;
pub mod score;

pub use score::ScenarioResults;

use crate::animal::{Badger, BadgerId, Cow, CowId, InfectionStatus};
use crate::config::{ConfigError, DiversityModel, Parameters, ScenarioConfig};
use crate::herd::{Farm, FarmId, Sett, SettId, HERD_SIZE_MEAN, HERD_SIZE_SD, RETEST_INTERVAL_DAYS};
use crate::inputs::{self, DataError};
use crate::stats::Histogram;
use crate::tree::{InfectionTree, Node};
use log::debug;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Normal, Poisson};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;

/// Full passes over the seed list before giving up on producing an infection.
const MAX_SEED_ATTEMPTS: u32 = 1000;

#[derive(Debug)]
pub enum ScenarioError {
    Config(ConfigError),
    Data(DataError),
    /// A data file referenced a farm that was never declared.
    UnknownFarm {
        context: &'static str,
        name: String,
    },
    MalformedSeed {
        entry: String,
    },
    /// The initial-infection probabilities never produced an infection.
    SeedingExhausted,
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Config(e) => write!(f, "{e}"),
            ScenarioError::Data(e) => write!(f, "{e}"),
            ScenarioError::UnknownFarm { context, name } => {
                write!(f, "{context} references unknown farm {name:?}")
            }
            ScenarioError::MalformedSeed { entry } => {
                write!(f, "malformed initial infection state {entry:?}")
            }
            ScenarioError::SeedingExhausted => write!(
                f,
                "no infection seeded after {MAX_SEED_ATTEMPTS} passes over the initial states"
            ),
        }
    }
}

impl Error for ScenarioError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ScenarioError::Config(e) => Some(e),
            ScenarioError::Data(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for ScenarioError {
    fn from(e: ConfigError) -> Self {
        ScenarioError::Config(e)
    }
}

impl From<DataError> for ScenarioError {
    fn from(e: DataError) -> Self {
        ScenarioError::Data(e)
    }
}

/// Immutable knobs of one scenario, merged from the config and parameter files.
#[derive(Clone, Debug)]
pub struct ScenarioSettings {
    pub beta: f64,
    pub sigma: f64,
    pub gamma: f64,
    pub alpha: f64,
    pub alpha_prime: f64,
    pub test_sensitivity: f64,
    pub mutation_rate: f64,
    pub infected_badger_lifetime: Option<f64>,
    pub start_date: i32,
    pub end_date: i32,
    pub step_size: i32,
    pub num_movements: u64,
    pub num_slaughters: u64,
    pub test_interval_days: i32,
    pub num_initial_restricted_herds: usize,
    pub max_outbreak_size: usize,
    pub diversity_model: DiversityModel,
    pub reservoirs_included: bool,
    pub observed: Histogram,
    pub sampling_rates: HashMap<i32, f64>,
}

/// Event counters accumulated over one scenario run.
#[derive(Clone, Debug, Default)]
pub struct Tallies {
    pub cow_cow_transmissions: u64,
    pub cow_badger_transmissions: u64,
    pub badger_cow_transmissions: u64,
    pub reactors: u64,
    pub breakdowns: u64,
    pub detected_at_slaughter: u64,
    pub undetected_at_slaughter: u64,
    pub infected_moved: u64,
    pub reactors_at_breakdown: Histogram,
}

/// One stochastic outbreak simulation over the farm cluster.
pub struct Scenario {
    pub(crate) settings: ScenarioSettings,
    pub(crate) farms: Vec<Farm>,
    pub(crate) setts: Vec<Sett>,
    pub(crate) cows: Vec<Cow>,
    pub(crate) badgers: Vec<Badger>,
    /// Cows currently infected on some farm.
    pub(crate) infected: BTreeSet<CowId>,
    pub(crate) tree: InfectionTree,
    pub(crate) movement_pairs: Vec<(FarmId, FarmId)>,
    pub(crate) tallies: Tallies,
    pub(crate) rng: ChaCha12Rng,
    snp_counter: u64,
    next_cow: u32,
    next_badger: u32,
}

struct SeedEntry {
    cow_tag: String,
    farm: FarmId,
    probs: [f64; 4],
}

impl Scenario {
    pub fn new(
        config: &ScenarioConfig,
        params: &Parameters,
        seed: u64,
    ) -> Result<Self, ScenarioError> {
        let settings = ScenarioSettings {
            beta: params.beta,
            sigma: params.sigma,
            gamma: params.gamma,
            alpha: params.alpha,
            alpha_prime: params.alpha_prime,
            test_sensitivity: params.test_sensitivity,
            mutation_rate: params.mutation_rate,
            infected_badger_lifetime: params.infected_badger_lifetime.or(config.badger_lifetime),
            start_date: config.start_date,
            end_date: config.end_date,
            step_size: config.step_size,
            num_movements: config.num_movements,
            num_slaughters: config.num_slaughters,
            test_interval_days: config.test_interval_days(),
            num_initial_restricted_herds: config.num_initial_restricted_herds,
            max_outbreak_size: config.max_outbreak_size,
            diversity_model: config.diversity_model,
            reservoirs_included: config.reservoirs_included,
            observed: inputs::read_observed_distribution(&config.observed_snp_distance_file)?,
            sampling_rates: inputs::read_sampling_rates(&config.sampling_rate_file)?,
        };

        let mut rng = ChaCha12Rng::seed_from_u64(seed);

        let farm_names = inputs::read_farm_ids(&config.farm_ids_file)?;
        let mut farms: Vec<Farm> = farm_names
            .iter()
            .map(|name| Farm::new(name.clone(), draw_herd_size(&mut rng)))
            .collect();
        let farm_index: HashMap<&str, FarmId> = farm_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), FarmId(idx as u32)))
            .collect();
        let lookup = |context: &'static str, name: &str| -> Result<FarmId, ScenarioError> {
            farm_index
                .get(name)
                .copied()
                .ok_or_else(|| ScenarioError::UnknownFarm {
                    context,
                    name: name.to_string(),
                })
        };

        let mut setts = Vec::new();
        for record in inputs::read_setts(&config.sett_ids_file)? {
            let sett_id = SettId(setts.len() as u32);
            let mut sett = Sett::new(record.name);
            for farm_name in &record.farms {
                let farm_id = lookup("sett file", farm_name)?;
                sett.farms.push(farm_id);
                farms[farm_id.0 as usize].setts.push(sett_id);
            }
            setts.push(sett);
        }
        // Farms absent from the sett file get a private reservoir each.
        let mut reservoir_seq = 0;
        for (idx, farm) in farms.iter_mut().enumerate() {
            if farm.setts.is_empty() {
                let sett_id = SettId(setts.len() as u32);
                let mut sett = Sett::new(format!("RESERVOIR_X{reservoir_seq}"));
                reservoir_seq += 1;
                sett.farms.push(FarmId(idx as u32));
                farm.setts.push(sett_id);
                setts.push(sett);
            }
        }

        for (date, movers) in
            inputs::read_slaughter_moves(&config.slaughterhouse_moves_file, &config.date_format)?
        {
            for farm_name in &movers {
                let farm_id = lookup("slaughterhouse schedule", farm_name)?;
                farms[farm_id.0 as usize].slaughter_dates.push(date);
            }
        }

        let mut movement_pairs = Vec::new();
        for record in inputs::read_movement_frequencies(&config.movement_frequencies_file)? {
            let departure = lookup("movement record", &record.departure)?;
            let destination = lookup("movement record", &record.destination)?;
            movement_pairs.push((departure, destination));
            for count in record.counts {
                farms[departure.0 as usize].off_moves.add(count);
            }
        }

        let mut scenario = Self {
            settings,
            farms,
            setts,
            cows: Vec::new(),
            badgers: Vec::new(),
            infected: BTreeSet::new(),
            tree: InfectionTree::new(),
            movement_pairs,
            tallies: Tallies::default(),
            rng,
            snp_counter: 0,
            next_cow: 0,
            next_badger: 0,
        };
        let seeds = scenario.parse_seed_entries(&config.initial_infection_states, &farm_index)?;
        scenario.seed_infections(&seeds)?;
        scenario.seed_test_state();
        Ok(scenario)
    }

    /// Drive the tau-leap loop from the start date until the end date, the
    /// kernel drying up, or the outbreak outgrowing the configured cap.
    pub fn run(&mut self) -> ScenarioResults {
        let mut date = self.settings.start_date;
        while date <= self.settings.end_date {
            self.observe(date);
            let kernel = self.build_kernel(date);
            if kernel.is_empty() {
                debug!("day {date}: transition kernel empty, stopping");
                break;
            }
            if self.infected.len() > self.settings.max_outbreak_size {
                debug!(
                    "day {date}: outbreak size {} over cap {}, stopping",
                    self.infected.len(),
                    self.settings.max_outbreak_size
                );
                break;
            }
            self.realise(&kernel, date);
            date += self.settings.step_size;
        }
        self.score()
    }

    /// Monotone SNP issue: the next `count` indices, all greater than any
    /// issued before.
    fn issue_snps(&mut self, count: u64) -> BTreeSet<u64> {
        (0..count)
            .map(|_| {
                self.snp_counter += 1;
                self.snp_counter
            })
            .collect()
    }

    /// SNPs accumulated between `last` and `day`. A `day` before `last` marks
    /// initial seeding and yields at least one SNP; an interval of zero days
    /// yields none and leaves the counter untouched.
    pub(crate) fn generate_snps(&mut self, day: i32, last: i32) -> BTreeSet<u64> {
        let count = if day < last {
            self.poisson(1.0).max(1)
        } else if day == last {
            0
        } else {
            self.poisson(self.settings.mutation_rate * (day - last) as f64)
        };
        self.issue_snps(count)
    }

    pub(crate) fn poisson(&mut self, lambda: f64) -> u64 {
        if lambda <= 0.0 || !lambda.is_finite() {
            return 0;
        }
        match Poisson::new(lambda) {
            Ok(dist) => dist.sample(&mut self.rng) as u64,
            Err(_) => 0,
        }
    }

    /// Bring a cow's SNP set forward to `date`.
    pub(crate) fn regenerate_cow_snps(&mut self, cow: CowId, date: i32) {
        let last = self.cows[cow.0 as usize].last_snp_generation;
        let fresh = self.generate_snps(date, last);
        let cow = &mut self.cows[cow.0 as usize];
        cow.snps.extend(fresh);
        cow.last_snp_generation = date;
    }

    /// Bring a badger's SNP set forward to `date`.
    pub(crate) fn regenerate_badger_snps(&mut self, badger: BadgerId, date: i32) {
        let last = self.badgers[badger.0 as usize].last_snp_generation;
        let fresh = self.generate_snps(date, last);
        let badger = &mut self.badgers[badger.0 as usize];
        badger.snps.extend(fresh);
        badger.last_snp_generation = date;
    }

    pub(crate) fn new_cow(&mut self, status: InfectionStatus) -> CowId {
        let id = CowId(self.cows.len() as u32);
        self.cows
            .push(Cow::new(format!("Cow_{}", self.next_cow), status));
        self.next_cow += 1;
        id
    }

    pub(crate) fn new_badger(&mut self, date_infected: i32) -> BadgerId {
        let id = BadgerId(self.badgers.len() as u32);
        self.badgers
            .push(Badger::new(format!("Badger_{}", self.next_badger), date_infected));
        self.next_badger += 1;
        id
    }

    /// Put a cow on a farm's infected list and the global infected set.
    pub(crate) fn attach_infected(&mut self, farm: FarmId, cow: CowId) {
        self.farms[farm.0 as usize].infected.push(cow);
        self.infected.insert(cow);
    }

    /// Take a cow off its farm and out of the global infected set; the
    /// infection tree keeps the node.
    pub(crate) fn detach_infected(&mut self, farm: FarmId, cow: CowId) {
        self.farms[farm.0 as usize].remove_infected(cow);
        self.infected.remove(&cow);
    }

    fn parse_seed_entries(
        &self,
        states: &str,
        farm_index: &HashMap<&str, FarmId>,
    ) -> Result<Vec<SeedEntry>, ScenarioError> {
        let mut entries = Vec::new();
        for raw in states.split(';').filter(|e| !e.trim().is_empty()) {
            let malformed = || ScenarioError::MalformedSeed {
                entry: raw.to_string(),
            };
            let mut parts = raw.trim().splitn(3, ':');
            let cow_tag = parts.next().ok_or_else(|| malformed())?.trim();
            let farm_name = parts.next().ok_or_else(|| malformed())?.trim();
            let probs_text = parts.next().ok_or_else(|| malformed())?;
            let probs: Vec<f64> = probs_text
                .split(',')
                .map(|p| p.trim().parse().map_err(|_| malformed()))
                .collect::<Result<_, _>>()?;
            let probs: [f64; 4] = probs.try_into().map_err(|_| malformed())?;
            let farm = farm_index
                .get(farm_name)
                .copied()
                .ok_or_else(|| ScenarioError::UnknownFarm {
                    context: "initial infection state",
                    name: farm_name.to_string(),
                })?;
            entries.push(SeedEntry {
                cow_tag: cow_tag.to_string(),
                farm,
                probs,
            });
        }
        Ok(entries)
    }

    /// Seed the initial infections, repeating the whole pass until at least
    /// one infection lands.
    fn seed_infections(&mut self, seeds: &[SeedEntry]) -> Result<(), ScenarioError> {
        let start = self.settings.start_date;
        for _ in 0..MAX_SEED_ATTEMPTS {
            for entry in seeds {
                let status = self.draw_status(&entry.probs);
                if status == InfectionStatus::Susceptible {
                    continue;
                }
                let snps = self.generate_snps(-1, start);
                let cow_id = self.new_cow(status);
                {
                    let cow = &mut self.cows[cow_id.0 as usize];
                    cow.tag = entry.cow_tag.clone();
                    cow.snps = snps;
                    cow.last_snp_generation = start;
                }
                self.attach_infected(entry.farm, cow_id);
                self.tallies.reactors += 1;
                self.tree.insert(Node::Cow(cow_id), Node::Root);

                if self.settings.reservoirs_included {
                    self.seed_badger(entry.farm, start);
                }
            }
            if !self.infected.is_empty() {
                return Ok(());
            }
        }
        Err(ScenarioError::SeedingExhausted)
    }

    fn seed_badger(&mut self, farm: FarmId, start: i32) {
        let setts = &self.farms[farm.0 as usize].setts;
        let sett = setts[self.rng.random_range(0..setts.len())];
        let max_age = self
            .settings
            .infected_badger_lifetime
            .map(|l| l.floor() as i32)
            .unwrap_or(0);
        let date_infected = start - self.rng.random_range(0..=max_age.max(0));
        let snps = self.generate_snps(-1, start);
        let badger_id = self.new_badger(date_infected);
        {
            let badger = &mut self.badgers[badger_id.0 as usize];
            badger.snps = snps;
            badger.last_snp_generation = start;
        }
        self.setts[sett.0 as usize].badgers.push(badger_id);
        self.tree.insert(Node::Badger(badger_id), Node::Root);
    }

    fn draw_status(&mut self, probs: &[f64; 4]) -> InfectionStatus {
        let statuses = [
            InfectionStatus::Susceptible,
            InfectionStatus::Exposed,
            InfectionStatus::TestSensitive,
            InfectionStatus::Infectious,
        ];
        let u: f64 = self.rng.random::<f64>() * probs.iter().sum::<f64>();
        let mut cumulative = 0.0;
        for (status, &p) in statuses.iter().zip(probs) {
            cumulative += p;
            if u < cumulative {
                return *status;
            }
        }
        InfectionStatus::Infectious
    }

    /// Give every farm a plausible point in the testing cycle at start.
    fn seed_test_state(&mut self) {
        let start = self.settings.start_date;
        let interval = self.settings.test_interval_days;
        let count = self
            .farms
            .len()
            .min(self.settings.num_initial_restricted_herds);
        let chosen = rand::seq::index::sample(&mut self.rng, self.farms.len(), count);
        let chosen: BTreeSet<usize> = chosen.into_iter().collect();
        for idx in 0..self.farms.len() {
            if chosen.contains(&idx) {
                let previous = start - self.rng.random_range(0..=RETEST_INTERVAL_DAYS);
                let currently_failed = self.rng.random_bool(0.5);
                let farm = &mut self.farms[idx];
                farm.last_positive_test_date = previous;
                farm.num_clear_tests = if currently_failed { 0 } else { 1 };
                farm.next_wht_date = previous + RETEST_INTERVAL_DAYS;
                farm.restricted = true;
            } else {
                let last_clear = start - self.rng.random_range(0..=interval);
                let farm = &mut self.farms[idx];
                farm.last_clear_test_date = last_clear;
                farm.next_wht_date = last_clear + interval;
            }
        }
    }
}

/// Herd size from a Gaussian truncated to positive values.
fn draw_herd_size<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    let dist = Normal::new(HERD_SIZE_MEAN, HERD_SIZE_SD).expect("valid herd size distribution");
    loop {
        let value = dist.sample(rng);
        if value >= 1.0 {
            return value.round() as u32;
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Inert settings: no transitions, no movements, perfect test.
    pub(crate) fn settings() -> ScenarioSettings {
        ScenarioSettings {
            beta: 0.0,
            sigma: 0.0,
            gamma: 0.0,
            alpha: 0.0,
            alpha_prime: 0.0,
            test_sensitivity: 1.0,
            mutation_rate: 0.0,
            infected_badger_lifetime: None,
            start_date: 1000,
            end_date: 1010,
            step_size: 1,
            num_movements: 0,
            num_slaughters: 0,
            test_interval_days: 365,
            num_initial_restricted_herds: 0,
            max_outbreak_size: 1000,
            diversity_model: DiversityModel::Intermediate,
            reservoirs_included: false,
            observed: Histogram::default(),
            sampling_rates: HashMap::new(),
        }
    }

    /// A scenario over `num_farms` farms of herd size 100, each with its own
    /// synthesised sett, and no input-file plumbing.
    pub(crate) fn scenario(settings: ScenarioSettings, num_farms: usize, seed: u64) -> Scenario {
        let mut farms = Vec::new();
        let mut setts = Vec::new();
        for idx in 0..num_farms {
            let mut farm = Farm::new(format!("F{idx}"), 100);
            let sett_id = SettId(idx as u32);
            farm.setts.push(sett_id);
            let mut sett = Sett::new(format!("RESERVOIR_X{idx}"));
            sett.farms.push(FarmId(idx as u32));
            farms.push(farm);
            setts.push(sett);
        }
        Scenario {
            settings,
            farms,
            setts,
            cows: Vec::new(),
            badgers: Vec::new(),
            infected: BTreeSet::new(),
            tree: InfectionTree::new(),
            movement_pairs: Vec::new(),
            tallies: Tallies::default(),
            rng: ChaCha12Rng::seed_from_u64(seed),
            snp_counter: 0,
            next_cow: 0,
            next_badger: 0,
        }
    }

    /// Attach a fresh infected cow to a farm, rooted in the tree.
    pub(crate) fn infect(scenario: &mut Scenario, farm: usize, status: InfectionStatus) -> CowId {
        let cow = scenario.new_cow(status);
        scenario.cows[cow.0 as usize].last_snp_generation = scenario.settings.start_date;
        scenario.attach_infected(FarmId(farm as u32), cow);
        scenario.tree.insert(Node::Cow(cow), Node::Root);
        cow
    }

    /// Put a fresh infected badger in a sett, rooted in the tree.
    pub(crate) fn infect_badger(
        scenario: &mut Scenario,
        sett: usize,
        date_infected: i32,
    ) -> BadgerId {
        let badger = scenario.new_badger(date_infected);
        scenario.badgers[badger.0 as usize].last_snp_generation = date_infected;
        scenario.setts[sett].badgers.push(badger);
        scenario.tree.insert(Node::Badger(badger), Node::Root);
        badger
    }
}
