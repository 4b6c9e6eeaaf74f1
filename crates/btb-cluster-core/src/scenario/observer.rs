use super::Scenario;
use crate::animal::CowId;
use crate::herd::FarmId;
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Hypergeometric};

/// Pair-picking attempts per step before the movement loop gives up.
const MAX_MOVE_ATTEMPTS: u32 = 10_000;

impl Scenario {
    /// Run the deterministic part of a step: scheduled herd tests first, then
    /// the periodic movement and slaughter phases.
    pub(crate) fn observe(&mut self, date: i32) {
        self.run_herd_tests(date);
        self.run_movements(date);
        self.run_slaughter(date);
    }

    /// Fire every whole-herd test scheduled inside `[date, date + step)`, in
    /// schedule order.
    fn run_herd_tests(&mut self, date: i32) {
        let step = self.settings.step_size;
        let mut due: Vec<(i32, usize)> = self
            .farms
            .iter()
            .enumerate()
            .filter(|(_, farm)| farm.next_wht_date >= date && farm.next_wht_date < date + step)
            .map(|(idx, farm)| (farm.next_wht_date, idx))
            .collect();
        due.sort_unstable();
        for (test_date, farm_idx) in due {
            self.whole_herd_test(FarmId(farm_idx as u32), test_date);
        }
    }

    /// Skin-test every infected cow on the farm. Reactors are sampled and
    /// culled; a clean herd progresses its clearance bookkeeping.
    pub(crate) fn whole_herd_test(&mut self, farm: FarmId, date: i32) {
        let cows = self.farms[farm.0 as usize].infected.clone();
        let reactors: Vec<CowId> = cows
            .into_iter()
            .filter(|&cow| self.test_cow(cow))
            .collect();

        if reactors.is_empty() {
            let interval = self.settings.test_interval_days;
            self.farms[farm.0 as usize].add_clear_test(date, interval);
            return;
        }

        for &cow in &reactors {
            self.regenerate_cow_snps(cow, date);
            self.cows[cow.0 as usize].date_sample_taken = date;
            self.detach_infected(farm, cow);
        }
        self.tallies.reactors += reactors.len() as u64;
        self.tallies.breakdowns += 1;
        self.tallies
            .reactors_at_breakdown
            .add(reactors.len() as u32);
        self.farms[farm.0 as usize].fail_test(date);
        debug!(
            "day {date}: breakdown on {} with {} reactors",
            self.farms[farm.0 as usize].name,
            reactors.len()
        );
    }

    /// One uniform draw per animal; only test-sensitive or infectious cows
    /// can react.
    fn test_cow(&mut self, cow: CowId) -> bool {
        let u: f64 = self.rng.random();
        self.cows[cow.0 as usize].status.detectable() && u < self.settings.test_sensitivity
    }

    fn duration_days(&self) -> f64 {
        (self.settings.end_date - self.settings.start_date).max(1) as f64
    }

    /// Move animals between farms until this step's share of the yearly
    /// movement volume is reached.
    fn run_movements(&mut self, date: i32) {
        if self.movement_pairs.is_empty() {
            return;
        }
        let target =
            self.settings.num_movements as f64 * self.settings.step_size as f64 / self.duration_days();
        let mut moved = 0u64;
        let mut attempts = 0u32;

        while (moved as f64) < target {
            attempts += 1;
            if attempts > MAX_MOVE_ATTEMPTS {
                warn!("day {date}: movement phase gave up after {MAX_MOVE_ATTEMPTS} attempts");
                break;
            }

            let (departure, destination) =
                self.movement_pairs[self.rng.random_range(0..self.movement_pairs.len())];
            if self.farms[departure.0 as usize].restricted
                || self.farms[destination.0 as usize].restricted
            {
                continue;
            }
            let Some(num_to_move) = self.farms[departure.0 as usize]
                .off_moves
                .sample(&mut self.rng)
            else {
                continue;
            };
            if num_to_move == 0 {
                continue;
            }

            let infected_on_farm = self.farms[departure.0 as usize].infected.len() as u32;
            let needed = num_to_move.max(infected_on_farm);
            if self.farms[departure.0 as usize].herd_size < needed {
                self.farms[departure.0 as usize].herd_size = needed;
            }
            let herd_size = self.farms[departure.0 as usize].herd_size;
            let num_infected_to_move = self.hypergeometric(
                herd_size as u64,
                infected_on_farm as u64,
                num_to_move as u64,
            );
            let selected = self.select_infected(departure, num_infected_to_move as usize);
            let mut any_detected = false;
            let mut detected_cows = Vec::new();
            for &cow in &selected {
                if self.test_cow(cow) {
                    any_detected = true;
                    detected_cows.push(cow);
                }
            }

            if any_detected {
                // The whole group is culled and nothing moves.
                for &cow in &detected_cows {
                    self.regenerate_cow_snps(cow, date);
                    self.cows[cow.0 as usize].date_sample_taken = date;
                }
                for &cow in &selected {
                    self.detach_infected(departure, cow);
                }
                self.tallies.reactors += detected_cows.len() as u64;
                self.farms[departure.0 as usize].fail_test(date);
                continue;
            }

            for &cow in &selected {
                self.farms[departure.0 as usize].remove_infected(cow);
                self.farms[destination.0 as usize].infected.push(cow);
            }
            let destination_farm = &mut self.farms[destination.0 as usize];
            if (destination_farm.infected.len() as u32) > destination_farm.herd_size {
                destination_farm.herd_size = destination_farm.infected.len() as u32;
            }
            self.tallies.infected_moved += selected.len() as u64;
            moved += num_to_move as u64;
        }
    }

    /// Send animals to slaughter from every farm with a dispatch scheduled in
    /// the window just passed.
    fn run_slaughter(&mut self, date: i32) {
        let step = self.settings.step_size;
        let target =
            self.settings.num_slaughters as f64 * step as f64 / self.duration_days();
        let mut moving: Vec<usize> = (0..self.farms.len())
            .filter(|&idx| self.farms[idx].dispatches_in(date - step, date))
            .collect();
        if moving.is_empty() {
            return;
        }
        moving.shuffle(&mut self.rng);
        let per_farm_max = ((target / moving.len() as f64).ceil() as u32).max(1);

        let mut total_moved = 0u64;
        for farm_idx in moving {
            if total_moved as f64 > target {
                break;
            }
            let farm_id = FarmId(farm_idx as u32);
            let herd_size = self.farms[farm_idx].herd_size;
            let num_to_move = self
                .rng
                .random_range(1..=per_farm_max)
                .min(herd_size.max(1));
            let infected_on_farm = self.farms[farm_idx].infected.len() as u64;
            let num_for_removal =
                self.hypergeometric(herd_size as u64, infected_on_farm, num_to_move as u64);
            let selected = self.select_infected(farm_id, num_for_removal as usize);

            for cow in selected {
                if self.test_cow(cow) {
                    self.regenerate_cow_snps(cow, date);
                    self.cows[cow.0 as usize].date_sample_taken = date;
                    self.tallies.detected_at_slaughter += 1;
                    self.farms[farm_idx].fail_test(date);
                } else {
                    self.tallies.undetected_at_slaughter += 1;
                }
                self.detach_infected(farm_id, cow);
            }
            total_moved += num_to_move as u64;
        }
    }

    /// Draw `count` distinct cows from a farm's infected list.
    fn select_infected(&mut self, farm: FarmId, count: usize) -> Vec<CowId> {
        let infected = &self.farms[farm.0 as usize].infected;
        let count = count.min(infected.len());
        if count == 0 {
            return Vec::new();
        }
        let infected = infected.clone();
        rand::seq::index::sample(&mut self.rng, infected.len(), count)
            .into_iter()
            .map(|idx| infected[idx])
            .collect()
    }

    pub(crate) fn hypergeometric(&mut self, total: u64, successes: u64, draws: u64) -> u64 {
        if successes == 0 || draws == 0 {
            return 0;
        }
        match Hypergeometric::new(total, successes, draws) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::animal::InfectionStatus;

    #[test]
    fn reactors_are_sampled_culled_and_start_a_breakdown() {
        let mut scenario = testutil::scenario(testutil::settings(), 1, 1);
        let reactor = testutil::infect(&mut scenario, 0, InfectionStatus::TestSensitive);
        let hidden = testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);

        scenario.whole_herd_test(FarmId(0), 1003);

        assert_eq!(scenario.farms[0].infected, vec![hidden]);
        assert!(!scenario.infected.contains(&reactor));
        let culled = &scenario.cows[reactor.0 as usize];
        assert_eq!(culled.date_sample_taken, 1003);
        assert!(scenario.tree.contains(crate::tree::Node::Cow(reactor)));
        assert_eq!(scenario.tallies.reactors, 1);
        assert_eq!(scenario.tallies.breakdowns, 1);
        assert_eq!(scenario.tallies.reactors_at_breakdown.get(1), 1);
        let farm = &scenario.farms[0];
        assert!(farm.restricted);
        assert_eq!(farm.last_positive_test_date, 1003);
        assert_eq!(farm.next_wht_date, 1003 + 60);
    }

    #[test]
    fn exposed_only_herds_test_clear() {
        let mut scenario = testutil::scenario(testutil::settings(), 1, 2);
        testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);

        scenario.whole_herd_test(FarmId(0), 1003);

        let farm = &scenario.farms[0];
        assert!(!farm.restricted);
        assert_eq!(farm.num_clear_tests, -1);
        assert_eq!(farm.last_clear_test_date, 1003);
        assert_eq!(farm.next_wht_date, 1003 + 365);
        assert_eq!(scenario.tallies.breakdowns, 0);
        assert_eq!(scenario.infected.len(), 1);
    }

    #[test]
    fn scheduled_tests_fire_inside_the_step_window() {
        let mut settings = testutil::settings();
        settings.step_size = 7;
        let mut scenario = testutil::scenario(settings, 2, 3);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        testutil::infect(&mut scenario, 1, InfectionStatus::Infectious);
        scenario.farms[0].next_wht_date = 1004; // inside [1000, 1007)
        scenario.farms[1].next_wht_date = 1007; // outside

        scenario.observe(1000);

        assert_eq!(scenario.tallies.breakdowns, 1);
        assert_eq!(scenario.farms[0].last_positive_test_date, 1004);
        assert!(!scenario.farms[1].restricted);
    }

    #[test]
    fn undetectable_infected_animals_move_silently() {
        let mut settings = testutil::settings();
        // one step's worth of movements equals one movement event
        settings.num_movements = 10;
        settings.end_date = settings.start_date + 10;
        let mut scenario = testutil::scenario(settings, 2, 4);
        scenario.movement_pairs = vec![(FarmId(0), FarmId(1))];
        scenario.farms[0].herd_size = 3;
        scenario.farms[0].off_moves.add_count(3, 1);
        for _ in 0..3 {
            testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);
        }

        scenario.observe(1000);

        assert!(scenario.farms[0].infected.is_empty());
        assert_eq!(scenario.farms[1].infected.len(), 3);
        assert_eq!(scenario.tallies.infected_moved, 3);
        assert!(!scenario.farms[0].restricted);
    }

    #[test]
    fn detected_movers_cull_the_group_and_restrict_the_herd() {
        let mut settings = testutil::settings();
        settings.num_movements = 10;
        settings.end_date = settings.start_date + 10;
        let mut scenario = testutil::scenario(settings, 2, 5);
        scenario.movement_pairs = vec![(FarmId(0), FarmId(1))];
        scenario.farms[0].herd_size = 2;
        scenario.farms[0].off_moves.add_count(2, 1);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);

        scenario.observe(1000);

        // the pre-movement test catches the group: nothing arrives
        assert!(scenario.farms[1].infected.is_empty());
        assert!(scenario.farms[0].infected.is_empty());
        assert_eq!(scenario.tallies.infected_moved, 0);
        assert_eq!(scenario.tallies.reactors, 2);
        assert!(scenario.farms[0].restricted);
        assert_eq!(scenario.farms[0].last_positive_test_date, 1000);
    }

    #[test]
    fn restricted_endpoints_block_movements() {
        let mut settings = testutil::settings();
        settings.num_movements = 10;
        settings.end_date = settings.start_date + 10;
        let mut scenario = testutil::scenario(settings, 2, 6);
        scenario.movement_pairs = vec![(FarmId(0), FarmId(1))];
        scenario.farms[0].off_moves.add_count(2, 1);
        scenario.farms[1].restricted = true;
        testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);

        scenario.observe(1000);

        assert_eq!(scenario.farms[0].infected.len(), 1);
        assert!(scenario.farms[1].infected.is_empty());
    }

    #[test]
    fn slaughter_removals_test_every_infected_animal_sent() {
        let mut settings = testutil::settings();
        settings.num_slaughters = 10;
        settings.end_date = settings.start_date + 10;
        settings.step_size = 2;
        let mut scenario = testutil::scenario(settings, 1, 7);
        scenario.farms[0].herd_size = 2;
        scenario.farms[0].slaughter_dates.push(1001);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);

        // window [1000, 1002) holds the dispatch
        scenario.observe(1002);

        let removed = 2 - scenario.farms[0].infected.len() as u64;
        assert!(removed > 0);
        assert_eq!(
            scenario.tallies.detected_at_slaughter + scenario.tallies.undetected_at_slaughter,
            removed
        );
        // perfect test sensitivity: every removal is detected
        assert_eq!(scenario.tallies.detected_at_slaughter, removed);
        assert!(scenario.farms[0].restricted);
    }

    #[test]
    fn undetectable_slaughter_removals_only_count() {
        let mut settings = testutil::settings();
        settings.num_slaughters = 10;
        settings.end_date = settings.start_date + 10;
        settings.step_size = 2;
        let mut scenario = testutil::scenario(settings, 1, 8);
        scenario.farms[0].herd_size = 2;
        scenario.farms[0].slaughter_dates.push(1001);
        testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);
        testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);

        scenario.observe(1002);

        assert_eq!(scenario.tallies.detected_at_slaughter, 0);
        assert!(!scenario.farms[0].restricted);
    }
}
