use crate::animal::{BadgerId, CowId, NO_DATE};
use crate::stats::Histogram;

/// Days until the follow-up test after a failed or not-yet-cleared test.
pub const RETEST_INTERVAL_DAYS: i32 = 60;

/// Consecutive clear tests required to lift a movement restriction.
pub const CLEAR_TESTS_TO_LIFT: i32 = 2;

/// Herd sizes are drawn from a Gaussian truncated to positive values.
pub const HERD_SIZE_MEAN: f64 = 120.0;
pub const HERD_SIZE_SD: f64 = 40.0;

/// Handle into the scenario's farm arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FarmId(pub u32);

/// Handle into the scenario's sett arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SettId(pub u32);

/// A cattle herd together with its test history and movement records.
#[derive(Clone, Debug)]
pub struct Farm {
    pub name: String,
    pub herd_size: u32,
    /// Connected badger setts, in input order.
    pub setts: Vec<SettId>,
    /// Currently infected cows present on the farm.
    pub infected: Vec<CowId>,
    /// Scheduled dates of dispatches to slaughter.
    pub slaughter_dates: Vec<i32>,
    /// Animals-per-event counts of historical off movements.
    pub off_moves: Histogram,
    pub restricted: bool,
    pub last_clear_test_date: i32,
    pub last_positive_test_date: i32,
    /// Clear tests since the last failure; -1 when no failure is pending.
    pub num_clear_tests: i32,
    pub next_wht_date: i32,
}

impl Farm {
    pub fn new(name: String, herd_size: u32) -> Self {
        Self {
            name,
            herd_size,
            setts: Vec::new(),
            infected: Vec::new(),
            slaughter_dates: Vec::new(),
            off_moves: Histogram::default(),
            restricted: false,
            last_clear_test_date: NO_DATE,
            last_positive_test_date: NO_DATE,
            num_clear_tests: -1,
            next_wht_date: NO_DATE,
        }
    }

    /// Record a failed test: the herd is restricted and retested in 60 days.
    pub fn fail_test(&mut self, date: i32) {
        self.last_positive_test_date = date;
        self.num_clear_tests = 0;
        self.next_wht_date = date + RETEST_INTERVAL_DAYS;
        self.restricted = true;
    }

    /// Record a clear whole-herd test. Two consecutive clears after a failure
    /// lift the restriction and return the herd to the routine schedule.
    pub fn add_clear_test(&mut self, date: i32, routine_interval_days: i32) {
        self.last_clear_test_date = date;
        if self.num_clear_tests != -1 {
            self.num_clear_tests += 1;
            if self.num_clear_tests < CLEAR_TESTS_TO_LIFT {
                self.next_wht_date = date + RETEST_INTERVAL_DAYS;
                self.restricted = true;
                return;
            }
            self.num_clear_tests = -1;
        }
        self.next_wht_date = date + routine_interval_days;
        self.restricted = false;
    }

    /// Drop a cow from the infected list; false when it was not present.
    pub fn remove_infected(&mut self, cow: CowId) -> bool {
        match self.infected.iter().position(|&c| c == cow) {
            Some(idx) => {
                self.infected.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Number of uninfected animals available to expose.
    pub fn susceptible_count(&self) -> u32 {
        (self.herd_size as usize).saturating_sub(self.infected.len()) as u32
    }

    /// Whether any scheduled slaughter dispatch falls in `[from, to)`.
    pub fn dispatches_in(&self, from: i32, to: i32) -> bool {
        self.slaughter_dates.iter().any(|&d| d >= from && d < to)
    }
}

/// A badger social group linked to one or more farms.
#[derive(Clone, Debug)]
pub struct Sett {
    pub name: String,
    pub farms: Vec<FarmId>,
    /// Infected badgers currently alive in the sett.
    pub badgers: Vec<BadgerId>,
}

impl Sett {
    pub fn new(name: String) -> Self {
        Self {
            name,
            farms: Vec::new(),
            badgers: Vec::new(),
        }
    }

    pub fn remove_badger(&mut self, badger: BadgerId) -> bool {
        match self.badgers.iter().position(|&b| b == badger) {
            Some(idx) => {
                self.badgers.remove(idx);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted_farm(num_clear_tests: i32) -> Farm {
        let mut farm = Farm::new("F1".into(), 100);
        farm.last_positive_test_date = 100;
        farm.num_clear_tests = num_clear_tests;
        farm.restricted = true;
        farm.next_wht_date = 160;
        farm
    }

    #[test]
    fn restriction_lifecycle_takes_two_clear_tests() {
        let mut farm = restricted_farm(0);
        farm.add_clear_test(160, 365);
        assert_eq!(farm.num_clear_tests, 1);
        assert_eq!(farm.next_wht_date, 220);
        assert!(farm.restricted);

        farm.add_clear_test(220, 365);
        assert_eq!(farm.num_clear_tests, -1);
        assert_eq!(farm.next_wht_date, 220 + 365);
        assert!(!farm.restricted);
    }

    #[test]
    fn routine_clear_test_keeps_routine_schedule() {
        let mut farm = Farm::new("F2".into(), 80);
        farm.add_clear_test(500, 730);
        assert_eq!(farm.num_clear_tests, -1);
        assert_eq!(farm.next_wht_date, 500 + 730);
        assert!(!farm.restricted);
    }

    #[test]
    fn failed_test_restricts_and_retests_in_sixty_days() {
        let mut farm = Farm::new("F3".into(), 80);
        farm.fail_test(42);
        assert!(farm.restricted);
        assert_eq!(farm.last_positive_test_date, 42);
        assert_eq!(farm.num_clear_tests, 0);
        assert_eq!(farm.next_wht_date, 102);
    }

    #[test]
    fn remove_infected_reports_presence() {
        use crate::animal::CowId;
        let mut farm = Farm::new("F4".into(), 10);
        farm.infected.push(CowId(3));
        assert!(farm.remove_infected(CowId(3)));
        assert!(!farm.remove_infected(CowId(3)));
        assert!(farm.infected.is_empty());
    }
}
