//! Deterministic disturbance injection for tests and chaos runs.
//!
//! One-shot injections are queued and consumed by the next tick; random
//! mass perturbations use a seeded LCG so a run is reproducible from its
//! parameters.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::InjectionParams;
use crate::floater::Floater;

const MAX_PENDING_INJECTIONS: usize = 8;

// Largest random mass disturbance, either sign
const PERTURBATION_SCALE_KG: f64 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Injection {
    /// Extra force on the chain for one tick, N.
    ChainForce { newtons: f64 },
    /// Add `delta_kg` to one floater's effective mass right away.
    FloaterMass { floater: usize, delta_kg: f64 },
    /// NaN in the chain force for one tick.
    NonFiniteForce,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionStats {
    pub total_injected: u32,
    pub chain_forces: u32,
    pub mass_corruptions: u32,
    pub non_finite_forces: u32,
    pub random_perturbations: u32,
}

#[derive(Debug, Clone)]
pub struct Injector {
    random_enabled: bool,
    rate_percent: f64,
    pending: Vec<Injection, MAX_PENDING_INJECTIONS>,
    stats: InjectionStats,

    // Linear Congruential Generator for deterministic runs
    rng_state: u64,
}

impl Injector {
    pub fn new(params: &InjectionParams) -> Self {
        Self {
            random_enabled: params.enabled,
            rate_percent: params.perturbation_rate_percent,
            pending: Vec::new(),
            stats: InjectionStats::default(),
            rng_state: params.seed,
        }
    }

    /// Queue or apply an injection.
    ///
    /// Mass corruption lands immediately; force injections wait for the next
    /// tick. Returns `false` if the floater id is unknown or the queue is full.
    pub fn inject(&mut self, injection: Injection, floaters: &mut [Floater]) -> bool {
        let accepted = match injection {
            Injection::FloaterMass { floater, delta_kg } => {
                match floaters.iter_mut().find(|f| f.id == floater) {
                    Some(target) => {
                        target.effective_mass += delta_kg;
                        self.stats.mass_corruptions += 1;
                        true
                    }
                    None => false,
                }
            }
            Injection::ChainForce { .. } | Injection::NonFiniteForce => self.pending.push(injection).is_ok(),
        };
        if accepted {
            self.stats.total_injected += 1;
            debug!(?injection, "injection accepted");
        }
        accepted
    }

    /// Drain queued force injections into a single chain force for this tick.
    pub fn take_chain_force(&mut self) -> f64 {
        let mut force = 0.0;
        for injection in self.pending.iter() {
            match injection {
                Injection::ChainForce { newtons } => {
                    force += newtons;
                    self.stats.chain_forces += 1;
                }
                Injection::NonFiniteForce => {
                    force = f64::NAN;
                    self.stats.non_finite_forces += 1;
                }
                Injection::FloaterMass { .. } => {}
            }
        }
        self.pending.clear();
        force
    }

    /// Randomly disturb floater masses at the configured rate.
    pub fn perturb(&mut self, floaters: &mut [Floater]) -> u32 {
        if !self.random_enabled || self.rate_percent <= 0.0 {
            return 0;
        }
        let mut perturbed = 0;
        for floater in floaters.iter_mut() {
            if self.random_float() * 100.0 < self.rate_percent {
                let delta = (self.random_float() * 2.0 - 1.0) * PERTURBATION_SCALE_KG;
                floater.effective_mass += delta;
                perturbed += 1;
            }
        }
        self.stats.random_perturbations += perturbed;
        self.stats.total_injected += perturbed;
        perturbed
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn get_stats(&self) -> &InjectionStats {
        &self.stats
    }

    fn next_random(&mut self) -> u64 {
        // Numerical Recipes LCG constants
        self.rng_state = self.rng_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.rng_state
    }

    fn random_float(&mut self) -> f64 {
        (self.next_random() >> 11) as f64 / (1u64 << 53) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunParameters;

    fn floaters() -> std::vec::Vec<Floater> {
        let params = RunParameters::default();
        (0..4)
            .map(|i| Floater::new(i, &params.floaters, i as f64, &params.fluid))
            .collect()
    }

    #[test]
    fn test_random_float_range() {
        let mut injector = Injector::new(&InjectionParams {
            enabled: true,
            seed: 42,
            perturbation_rate_percent: 50.0,
        });
        for _ in 0..1000 {
            let value = injector.random_float();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_forces_are_one_shot() {
        let mut floaters = floaters();
        let mut injector = Injector::new(&RunParameters::default().injection);

        assert!(injector.inject(Injection::ChainForce { newtons: 100.0 }, &mut floaters));
        assert!(injector.inject(Injection::ChainForce { newtons: 50.0 }, &mut floaters));
        assert_eq!(injector.take_chain_force(), 150.0);
        assert_eq!(injector.take_chain_force(), 0.0);
        assert_eq!(injector.get_stats().chain_forces, 2);
    }

    #[test]
    fn test_unknown_floater_rejected() {
        let mut floaters = floaters();
        let mut injector = Injector::new(&RunParameters::default().injection);
        assert!(!injector.inject(
            Injection::FloaterMass {
                floater: 99,
                delta_kg: 1.0
            },
            &mut floaters
        ));
        assert_eq!(injector.get_stats().total_injected, 0);
    }

    #[test]
    fn test_perturbation_disabled_by_default() {
        let mut floaters = floaters();
        let before: std::vec::Vec<f64> = floaters.iter().map(|f| f.effective_mass).collect();
        let mut injector = Injector::new(&RunParameters::default().injection);
        assert_eq!(injector.perturb(&mut floaters), 0);
        let after: std::vec::Vec<f64> = floaters.iter().map(|f| f.effective_mass).collect();
        assert_eq!(before, after);
    }
}
