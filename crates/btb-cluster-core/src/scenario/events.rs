use super::kernel::SimulationEvent;
use super::Scenario;
use crate::animal::{BadgerId, CowId, InfectionStatus};
use crate::config::DiversityModel;
use crate::herd::FarmId;
use crate::tree::Node;
use log::debug;
use std::collections::BTreeSet;

impl Scenario {
    /// Realise one step: draw Poisson occurrence counts for every kernel
    /// entry and apply them in kernel order.
    pub(crate) fn realise(&mut self, kernel: &[(SimulationEvent, f64)], date: i32) {
        let step = self.settings.step_size as f64;
        for &(event, rate) in kernel {
            let occurrences = self.poisson(rate * step);
            for _ in 0..occurrences {
                self.apply(event, date);
            }
        }
    }

    fn apply(&mut self, event: SimulationEvent, date: i32) {
        match event {
            SimulationEvent::CowTransition { cow, farm, to } => {
                if !self.cow_present(cow, farm) {
                    debug!("cow {} left farm before its transition, skipping", cow.0);
                    return;
                }
                self.regenerate_cow_snps(cow, date);
                self.cows[cow.0 as usize].status = to;
            }
            SimulationEvent::CowInfectsCow { source, farm } => {
                if !self.cow_present(source, farm) {
                    debug!("cow {} left farm before infecting, skipping", source.0);
                    return;
                }
                if !self.herd_has_room(farm) {
                    return;
                }
                self.regenerate_cow_snps(source, date);
                let snps = self.cows[source.0 as usize].snps.clone();
                let child = self.new_cow(InfectionStatus::Exposed);
                {
                    let cow = &mut self.cows[child.0 as usize];
                    cow.snps = snps;
                    cow.last_snp_generation = date;
                }
                self.attach_infected(farm, child);
                self.tree.insert(Node::Cow(child), Node::Cow(source));
                self.tallies.cow_cow_transmissions += 1;
            }
            SimulationEvent::CowInfectsBadger { source, farm, sett } => {
                if !self.cow_present(source, farm) {
                    debug!("cow {} left farm before seeding a badger, skipping", source.0);
                    return;
                }
                self.regenerate_cow_snps(source, date);
                let snps = self.cows[source.0 as usize].snps.clone();
                let badger = self.new_badger(date);
                {
                    let b = &mut self.badgers[badger.0 as usize];
                    b.snps = snps;
                    b.last_snp_generation = date;
                }
                self.setts[sett.0 as usize].badgers.push(badger);
                self.tree.insert(Node::Badger(badger), Node::Cow(source));
                self.tallies.cow_badger_transmissions += 1;
            }
            SimulationEvent::BadgerInfectsCow { source, sett, farm } => {
                if !self.setts[sett.0 as usize].badgers.contains(&source) {
                    debug!("badger {} decayed before infecting, skipping", source.0);
                    return;
                }
                if !self.herd_has_room(farm) {
                    return;
                }
                let snps = self.badger_contribution(source, farm, date);
                let child = self.new_cow(InfectionStatus::Exposed);
                {
                    let cow = &mut self.cows[child.0 as usize];
                    cow.snps = snps;
                    cow.last_snp_generation = date;
                }
                self.attach_infected(farm, child);
                self.tree.insert(Node::Cow(child), Node::Badger(source));
                self.tallies.badger_cow_transmissions += 1;
            }
            SimulationEvent::BadgerDecay { badger, sett } => {
                if self.setts[sett.0 as usize].remove_badger(badger) {
                    self.tree.remove(Node::Badger(badger));
                }
            }
        }
    }

    fn cow_present(&self, cow: CowId, farm: FarmId) -> bool {
        self.farms[farm.0 as usize].infected.contains(&cow)
    }

    fn herd_has_room(&self, farm: FarmId) -> bool {
        let farm = &self.farms[farm.0 as usize];
        if (farm.infected.len() as u32) < farm.herd_size {
            true
        } else {
            debug!("herd {} fully infected, discarding exposure", farm.name);
            false
        }
    }

    /// SNP set a badger passes to a cow it infects, per the diversity model.
    pub(crate) fn badger_contribution(
        &mut self,
        source: BadgerId,
        farm: FarmId,
        date: i32,
    ) -> BTreeSet<u64> {
        match self.settings.diversity_model {
            DiversityModel::Maximum => {
                let mut donors = Vec::new();
                for &sett in &self.farms[farm.0 as usize].setts {
                    donors.extend(self.setts[sett.0 as usize].badgers.iter().copied());
                }
                let mut union = BTreeSet::new();
                for badger in donors {
                    self.regenerate_badger_snps(badger, date);
                    union.extend(self.badgers[badger.0 as usize].snps.iter().copied());
                }
                union
            }
            DiversityModel::Minimum => self.badgers[source.0 as usize].snps.clone(),
            DiversityModel::Intermediate => {
                self.regenerate_badger_snps(source, date);
                self.badgers[source.0 as usize].snps.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::herd::SettId;

    #[test]
    fn cow_infection_copies_parent_snps_into_an_exposed_child() {
        let mut scenario = testutil::scenario(testutil::settings(), 1, 1);
        let source = testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        scenario.cows[source.0 as usize].snps = [1, 2, 3].into();

        scenario.apply(
            SimulationEvent::CowInfectsCow {
                source,
                farm: FarmId(0),
            },
            1004,
        );

        assert_eq!(scenario.cows.len(), 2);
        let child = scenario.farms[0].infected[1];
        let child_cow = &scenario.cows[child.0 as usize];
        assert_eq!(child_cow.status, InfectionStatus::Exposed);
        // zero mutation rate: the child carries exactly the parent set
        assert_eq!(child_cow.snps, BTreeSet::from([1, 2, 3]));
        assert_eq!(child_cow.last_snp_generation, 1004);
        assert_eq!(scenario.tree.parent_of(Node::Cow(child)), Some(Node::Cow(source)));
        assert_eq!(scenario.tallies.cow_cow_transmissions, 1);
    }

    #[test]
    fn events_for_departed_cows_are_discarded() {
        let mut scenario = testutil::scenario(testutil::settings(), 1, 2);
        let source = testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        scenario.detach_infected(FarmId(0), source);

        scenario.apply(
            SimulationEvent::CowInfectsCow {
                source,
                farm: FarmId(0),
            },
            1002,
        );
        scenario.apply(
            SimulationEvent::CowTransition {
                cow: source,
                farm: FarmId(0),
                to: InfectionStatus::Infectious,
            },
            1002,
        );

        assert_eq!(scenario.cows.len(), 1);
        assert_eq!(scenario.tallies.cow_cow_transmissions, 0);
    }

    #[test]
    fn a_full_herd_accepts_no_further_exposures() {
        let mut scenario = testutil::scenario(testutil::settings(), 1, 3);
        scenario.farms[0].herd_size = 1;
        let source = testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);

        scenario.apply(
            SimulationEvent::CowInfectsCow {
                source,
                farm: FarmId(0),
            },
            1001,
        );
        assert_eq!(scenario.cows.len(), 1);
    }

    #[test]
    fn self_transition_advances_status_and_snp_clock() {
        let mut settings = testutil::settings();
        settings.mutation_rate = 3.0;
        let mut scenario = testutil::scenario(settings, 1, 4);
        let cow = testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);

        scenario.apply(
            SimulationEvent::CowTransition {
                cow,
                farm: FarmId(0),
                to: InfectionStatus::TestSensitive,
            },
            1006,
        );
        let cow = &scenario.cows[cow.0 as usize];
        assert_eq!(cow.status, InfectionStatus::TestSensitive);
        assert_eq!(cow.last_snp_generation, 1006);
        // six days at rate three accumulates some mutations
        assert!(!cow.snps.is_empty());
    }

    #[test]
    fn badger_decay_removes_from_sett_and_reparents_descendants() {
        let mut settings = testutil::settings();
        settings.reservoirs_included = true;
        let mut scenario = testutil::scenario(settings, 1, 5);
        let badger = testutil::infect_badger(&mut scenario, 0, 950);
        scenario.apply(
            SimulationEvent::BadgerInfectsCow {
                source: badger,
                sett: SettId(0),
                farm: FarmId(0),
            },
            1003,
        );
        let child = scenario.farms[0].infected[0];

        scenario.apply(
            SimulationEvent::BadgerDecay {
                badger,
                sett: SettId(0),
            },
            1004,
        );

        assert!(scenario.setts[0].badgers.is_empty());
        assert!(!scenario.tree.contains(Node::Badger(badger)));
        assert_eq!(scenario.tree.parent_of(Node::Cow(child)), Some(Node::Root));
        assert_eq!(scenario.tallies.badger_cow_transmissions, 1);

        // a second decay of the same badger is a no-op
        scenario.apply(
            SimulationEvent::BadgerDecay {
                badger,
                sett: SettId(0),
            },
            1005,
        );
        assert!(scenario.setts[0].badgers.is_empty());
    }

    #[test]
    fn maximum_diversity_pools_every_badger_on_the_farm() {
        let mut settings = testutil::settings();
        settings.reservoirs_included = true;
        settings.diversity_model = DiversityModel::Maximum;
        let mut scenario = testutil::scenario(settings, 1, 6);
        let a = testutil::infect_badger(&mut scenario, 0, 950);
        let b = testutil::infect_badger(&mut scenario, 0, 960);
        scenario.badgers[a.0 as usize].snps = [1, 2].into();
        scenario.badgers[b.0 as usize].snps = [7].into();

        let pooled = scenario.badger_contribution(a, FarmId(0), 1000);
        assert_eq!(pooled, BTreeSet::from([1, 2, 7]));
    }

    #[test]
    fn minimum_diversity_uses_the_source_badger_verbatim() {
        let mut settings = testutil::settings();
        settings.reservoirs_included = true;
        settings.diversity_model = DiversityModel::Minimum;
        settings.mutation_rate = 100.0;
        let mut scenario = testutil::scenario(settings, 1, 7);
        let badger = testutil::infect_badger(&mut scenario, 0, 900);
        scenario.badgers[badger.0 as usize].snps = [4].into();

        // no regeneration happens despite the enormous mutation rate
        let snps = scenario.badger_contribution(badger, FarmId(0), 1000);
        assert_eq!(snps, BTreeSet::from([4]));
        assert_eq!(scenario.badgers[badger.0 as usize].last_snp_generation, 900);
    }
}
