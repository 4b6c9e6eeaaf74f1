use super::Scenario;
use crate::animal::{BadgerId, CowId, InfectionStatus};
use crate::herd::{FarmId, SettId};
use statrs::distribution::{ContinuousCDF, Exp};

/// A candidate transition together with everything needed to apply it later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimulationEvent {
    /// A cow progresses to the next stage of its own infection.
    CowTransition {
        cow: CowId,
        farm: FarmId,
        to: InfectionStatus,
    },
    /// An infectious cow exposes a new cow in its own herd.
    CowInfectsCow { source: CowId, farm: FarmId },
    /// An infectious cow seeds a badger in a connected sett.
    CowInfectsBadger {
        source: CowId,
        farm: FarmId,
        sett: SettId,
    },
    /// An infected badger exposes a new cow on a connected farm.
    BadgerInfectsCow {
        source: BadgerId,
        sett: SettId,
        farm: FarmId,
    },
    /// An infected badger drops out of the reservoir.
    BadgerDecay { badger: BadgerId, sett: SettId },
}

impl Scenario {
    /// Rebuild the transition kernel: every candidate event paired with its
    /// rate at `date`.
    pub(crate) fn build_kernel(&self, date: i32) -> Vec<(SimulationEvent, f64)> {
        let mut kernel = Vec::new();
        let s = &self.settings;

        for (farm_idx, farm) in self.farms.iter().enumerate() {
            let farm_id = FarmId(farm_idx as u32);
            let susceptible = farm.susceptible_count() as f64;

            for &cow_id in &farm.infected {
                match self.cows[cow_id.0 as usize].status {
                    InfectionStatus::Susceptible => {}
                    InfectionStatus::Exposed => kernel.push((
                        SimulationEvent::CowTransition {
                            cow: cow_id,
                            farm: farm_id,
                            to: InfectionStatus::TestSensitive,
                        },
                        s.sigma,
                    )),
                    InfectionStatus::TestSensitive => kernel.push((
                        SimulationEvent::CowTransition {
                            cow: cow_id,
                            farm: farm_id,
                            to: InfectionStatus::Infectious,
                        },
                        s.gamma,
                    )),
                    InfectionStatus::Infectious => {
                        kernel.push((
                            SimulationEvent::CowInfectsCow {
                                source: cow_id,
                                farm: farm_id,
                            },
                            s.beta * susceptible,
                        ));
                        if s.reservoirs_included {
                            for &sett in &farm.setts {
                                kernel.push((
                                    SimulationEvent::CowInfectsBadger {
                                        source: cow_id,
                                        farm: farm_id,
                                        sett,
                                    },
                                    s.alpha_prime,
                                ));
                            }
                        }
                    }
                }
            }

            if s.reservoirs_included {
                for &sett_id in &farm.setts {
                    for &badger in &self.setts[sett_id.0 as usize].badgers {
                        kernel.push((
                            SimulationEvent::BadgerInfectsCow {
                                source: badger,
                                sett: sett_id,
                                farm: farm_id,
                            },
                            s.alpha * susceptible,
                        ));
                    }
                }
            }
        }

        // Explicit badger demography. The decay weight is the exponential CDF
        // of the time already spent infected. Strictly a probability, not a
        // rate, but it enters the kernel as a rate deliberately.
        if s.reservoirs_included {
            if let Some(lifetime) = s.infected_badger_lifetime.filter(|&l| l > 0.0) {
                if let Ok(decay) = Exp::new(1.0 / lifetime) {
                    for (sett_idx, sett) in self.setts.iter().enumerate() {
                        for &badger in &sett.badgers {
                            let days = self.badgers[badger.0 as usize].days_infected(date);
                            kernel.push((
                                SimulationEvent::BadgerDecay {
                                    badger,
                                    sett: SettId(sett_idx as u32),
                                },
                                decay.cdf(days as f64),
                            ));
                        }
                    }
                }
            }
        }

        kernel
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;

    #[test]
    fn cow_stage_transitions_enter_the_kernel_at_their_rates() {
        let mut settings = testutil::settings();
        settings.sigma = 0.25;
        settings.gamma = 0.5;
        settings.beta = 0.01;
        let mut scenario = testutil::scenario(settings, 1, 1);
        let exposed = testutil::infect(&mut scenario, 0, InfectionStatus::Exposed);
        let sensitive = testutil::infect(&mut scenario, 0, InfectionStatus::TestSensitive);
        let infectious = testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);

        let kernel = scenario.build_kernel(1000);
        assert_eq!(kernel.len(), 3);
        assert!(kernel.contains(&(
            SimulationEvent::CowTransition {
                cow: exposed,
                farm: FarmId(0),
                to: InfectionStatus::TestSensitive,
            },
            0.25,
        )));
        assert!(kernel.contains(&(
            SimulationEvent::CowTransition {
                cow: sensitive,
                farm: FarmId(0),
                to: InfectionStatus::Infectious,
            },
            0.5,
        )));
        // three of the hundred animals are already infected
        assert!(kernel.contains(&(
            SimulationEvent::CowInfectsCow {
                source: infectious,
                farm: FarmId(0),
            },
            0.01 * 97.0,
        )));
    }

    #[test]
    fn reservoir_events_appear_only_when_modelled() {
        let mut settings = testutil::settings();
        settings.beta = 0.01;
        settings.alpha = 0.002;
        settings.alpha_prime = 0.003;
        settings.reservoirs_included = true;
        let mut scenario = testutil::scenario(settings, 1, 2);
        let cow = testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        let badger = testutil::infect_badger(&mut scenario, 0, 900);

        let kernel = scenario.build_kernel(1000);
        assert!(kernel.contains(&(
            SimulationEvent::CowInfectsBadger {
                source: cow,
                farm: FarmId(0),
                sett: SettId(0),
            },
            0.003,
        )));
        assert!(kernel.contains(&(
            SimulationEvent::BadgerInfectsCow {
                source: badger,
                sett: SettId(0),
                farm: FarmId(0),
            },
            0.002 * 99.0,
        )));
        // no explicit lifetime, so no decay entries
        assert!(kernel
            .iter()
            .all(|(e, _)| !matches!(e, SimulationEvent::BadgerDecay { .. })));

        let mut scenario = testutil::scenario(testutil::settings(), 1, 3);
        testutil::infect(&mut scenario, 0, InfectionStatus::Infectious);
        testutil::infect_badger(&mut scenario, 0, 900);
        let kernel = scenario.build_kernel(1000);
        // reservoirs off: only the cow-to-cow exposure entry
        assert_eq!(kernel.len(), 1);
    }

    #[test]
    fn badger_decay_weight_is_the_exponential_cdf_of_age() {
        let mut settings = testutil::settings();
        settings.reservoirs_included = true;
        settings.infected_badger_lifetime = Some(100.0);
        let mut scenario = testutil::scenario(settings, 1, 4);
        let badger = testutil::infect_badger(&mut scenario, 0, 900);

        let kernel = scenario.build_kernel(1000);
        let weight = kernel
            .iter()
            .find_map(|(event, rate)| match event {
                SimulationEvent::BadgerDecay { badger: b, .. } if *b == badger => Some(*rate),
                _ => None,
            })
            .expect("decay entry present");
        // one lifetime spent infected
        assert!((weight - (1.0 - (-1.0f64).exp())).abs() < 1e-12);
    }
}
