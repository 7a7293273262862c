use buoysim::chain::ChainState;
use buoysim::config::TimestepParams;
use buoysim::drivetrain::DrivetrainState;
use buoysim::electrical::ElectricalState;
use buoysim::error::{EmergencyCondition, EngineError};
use buoysim::floater::Floater;
use buoysim::optimizer::RealTimeOptimizer;
use buoysim::safety::{SafetyEvent, SafetyLevel, SafetyManager};
use buoysim::synchronizer::{CorrectedField, StateSynchronizer};
use buoysim::RunParameters;
use proptest::prelude::*;
use std::f64::consts::TAU;
use std::time::{Duration, Instant};

fn floaters(params: &RunParameters) -> Vec<Floater> {
    let n = params.floaters.count;
    (0..n)
        .map(|i| Floater::new(i, &params.floaters, i as f64 * TAU / n as f64, &params.fluid))
        .collect()
}

fn timestep() -> TimestepParams {
    RunParameters::default().timestep
}

fn ms(value: f64) -> Duration {
    Duration::from_secs_f64(value / 1000.0)
}

// ---- synchronizer ----

#[test]
fn test_consistent_state_needs_no_correction() {
    let params = RunParameters::default();
    let mut floaters = floaters(&params);
    let mut sync = StateSynchronizer::new();

    assert_eq!(sync.synchronize(&mut floaters, 0.0, 1000.0, 1).unwrap(), 0);
    assert_eq!(sync.total_corrections(), 0);
    assert!(sync.get_history().is_empty());
}

#[test]
fn test_velocity_follows_chain_side() {
    let params = RunParameters::default();
    let mut floaters = floaters(&params);
    let mut sync = StateSynchronizer::new();

    let corrections = sync.synchronize(&mut floaters, 0.7, 1000.0, 1).unwrap();
    assert_eq!(corrections as usize, floaters.len());
    for floater in &floaters {
        assert_eq!(floater.velocity, floater.side().sign() * 0.7);
    }
    assert!(sync
        .get_history()
        .iter()
        .all(|r| r.field == CorrectedField::Velocity));
}

#[test]
fn test_corrupt_mass_is_replaced() {
    let params = RunParameters::default();
    let mut floaters = floaters(&params);
    floaters[2].effective_mass = f64::NAN;
    floaters[5].effective_mass += 1e-7;
    let mut sync = StateSynchronizer::new();

    // Inside tolerance stays untouched
    assert_eq!(sync.synchronize(&mut floaters, 0.0, 1000.0, 9).unwrap(), 1);
    assert_eq!(floaters[2].effective_mass, floaters[2].expected_mass(1000.0));
    let record = &sync.get_history()[0];
    assert_eq!(record.floater, 2);
    assert_eq!(record.tick_id, 9);
    assert_eq!(record.field, CorrectedField::Mass);
    assert!(record.actual.is_nan());
}

#[test]
fn test_broken_derivation_is_an_instability() {
    let params = RunParameters::default();
    let mut floaters = floaters(&params);
    floaters[0].water_fill_fraction = f64::INFINITY;
    let mut sync = StateSynchronizer::new();

    let result = sync.synchronize(&mut floaters, 0.0, 1000.0, 1);
    assert!(matches!(
        result,
        Err(EngineError::PhysicsInstability { signal: "floater_mass", .. })
    ));
}

#[test]
fn test_correction_history_is_bounded() {
    let params = RunParameters::default();
    let mut floaters = floaters(&params);
    let mut sync = StateSynchronizer::new();

    for tick in 0..100u64 {
        floaters[1].effective_mass += 1.0;
        sync.synchronize(&mut floaters, 0.0, 1000.0, tick).unwrap();
    }
    assert_eq!(sync.total_corrections(), 100);
    assert_eq!(sync.get_history().len(), 64);
    assert_eq!(sync.get_history().last().unwrap().tick_id, 99);
}

#[test]
fn test_publish_throttle_with_unrepresentable_interval() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);
    let start = Instant::now();

    assert!(optimizer.should_publish(start, 1e-20));
    assert!(!optimizer.should_publish(start + Duration::from_secs(3600), 1e-20));
    assert_eq!(optimizer.get_stats().snapshots_suppressed, 1);
}

proptest! {
    #[test]
    fn prop_synchronize_restores_invariants(
        offsets in proptest::collection::vec(-50.0f64..50.0, 8),
        speed in 0.0f64..10.0,
    ) {
        let params = RunParameters::default();
        let mut floaters = floaters(&params);
        for (floater, offset) in floaters.iter_mut().zip(&offsets) {
            floater.effective_mass += offset;
        }
        let mut sync = StateSynchronizer::new();
        let corrections = sync.synchronize(&mut floaters, speed, 1000.0, 1).unwrap();

        for floater in &floaters {
            prop_assert!((floater.effective_mass - floater.expected_mass(1000.0)).abs() <= 1e-6);
            prop_assert_eq!(floater.velocity, floater.side().sign() * speed);
        }
        prop_assert_eq!(u64::from(corrections), sync.total_corrections());
        // A second pass finds nothing left to fix
        prop_assert_eq!(sync.synchronize(&mut floaters, speed, 1000.0, 2).unwrap(), 0);
    }
}

// ---- optimizer ----

#[test]
fn test_over_budget_tick_shrinks_dt() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);
    assert_eq!(optimizer.dt(), 0.05);

    optimizer.finish_tick(ms(8.0), &ts);
    assert!((optimizer.dt() - 0.04).abs() < 1e-12);
    assert_eq!(optimizer.get_stats().over_budget_ticks, 1);
    assert_eq!(optimizer.get_stats().dt_shrinks, 1);
}

#[test]
fn test_calm_ticks_grow_dt() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);

    for _ in 0..9 {
        optimizer.finish_tick(ms(1.0), &ts);
    }
    assert_eq!(optimizer.dt(), 0.05);
    optimizer.finish_tick(ms(1.0), &ts);
    assert!((optimizer.dt() - 0.0525).abs() < 1e-12);

    // A middling tick resets the run
    for _ in 0..9 {
        optimizer.finish_tick(ms(1.0), &ts);
    }
    optimizer.finish_tick(ms(3.0), &ts);
    optimizer.finish_tick(ms(1.0), &ts);
    assert!((optimizer.dt() - 0.0525).abs() < 1e-12);
}

#[test]
fn test_rollback_halves_dt() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);
    optimizer.on_rollback(&ts);
    assert!((optimizer.dt() - 0.025).abs() < 1e-12);
    for _ in 0..10 {
        optimizer.on_rollback(&ts);
    }
    assert_eq!(optimizer.dt(), ts.min_dt);
    assert_eq!(optimizer.get_stats().rollbacks, 11);
}

#[test]
fn test_fixed_timestep_ignores_profile() {
    let mut ts = timestep();
    ts.adaptive = false;
    let mut optimizer = RealTimeOptimizer::new(&ts);
    for _ in 0..20 {
        optimizer.finish_tick(ms(50.0), &ts);
    }
    assert_eq!(optimizer.dt(), 0.05);
}

#[test]
fn test_tick_statistics() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);
    optimizer.finish_tick(ms(1.0), &ts);
    optimizer.finish_tick(ms(3.0), &ts);

    let stats = optimizer.get_stats();
    assert!((stats.mean_tick_ms - 2.0).abs() < 1e-9);
    assert!((stats.variance_tick_ms2 - 1.0).abs() < 1e-9);
    assert_eq!(stats.ticks_profiled, 2);
}

#[test]
fn test_stability_check() {
    let params = RunParameters::default();
    let optimizer = RealTimeOptimizer::new(&params.timestep);
    let chain = ChainState::default();
    let mut drivetrain = DrivetrainState::default();
    let mut electrical = ElectricalState::default();

    assert!(optimizer
        .check_stability(&chain, &drivetrain, Some(&electrical), &params)
        .is_ok());

    drivetrain.flywheel_speed = 700.0;
    assert!(matches!(
        optimizer.check_stability(&chain, &drivetrain, None, &params),
        Err(EngineError::PhysicsInstability { signal: "flywheel_speed", .. })
    ));

    drivetrain.flywheel_speed = 100.0;
    electrical.electrical_power = 40_000.0;
    assert!(matches!(
        optimizer.check_stability(&chain, &drivetrain, Some(&electrical), &params),
        Err(EngineError::PhysicsInstability { signal: "electrical_power", .. })
    ));
    // Mechanical-only runs skip the electrical checks
    assert!(optimizer
        .check_stability(&chain, &drivetrain, None, &params)
        .is_ok());
}

#[test]
fn test_publish_throttle() {
    let ts = timestep();
    let mut optimizer = RealTimeOptimizer::new(&ts);
    let start = Instant::now();

    assert!(optimizer.should_publish(start, 30.0));
    assert!(!optimizer.should_publish(start + Duration::from_millis(10), 30.0));
    assert!(optimizer.should_publish(start + Duration::from_millis(40), 30.0));
    assert_eq!(optimizer.get_stats().snapshots_published, 2);
    assert_eq!(optimizer.get_stats().snapshots_suppressed, 1);
}

proptest! {
    #[test]
    fn prop_dt_stays_within_bounds(
        durations in proptest::collection::vec(0.0f64..20.0, 1..200),
        rollbacks in proptest::collection::vec(any::<bool>(), 200),
    ) {
        let ts = timestep();
        let mut optimizer = RealTimeOptimizer::new(&ts);
        for (duration, rollback) in durations.iter().zip(&rollbacks) {
            if *rollback {
                optimizer.on_rollback(&ts);
            }
            optimizer.finish_tick(ms(*duration), &ts);
            prop_assert!(optimizer.dt() >= ts.min_dt);
            prop_assert!(optimizer.dt() <= ts.max_dt);
        }
    }
}

// ---- safety ----

fn chain_at(linear_speed: f64, tension: f64) -> ChainState {
    ChainState {
        linear_speed,
        angular_velocity: linear_speed / 0.5,
        tension,
        ..ChainState::default()
    }
}

#[test]
fn test_safety_starts_normal() {
    let safety = SafetyManager::new();
    let state = safety.get_state();
    assert_eq!(state.safety_level, SafetyLevel::Normal);
    assert_eq!(state.active_events, 0);
    assert!(!safety.is_emergency());
}

#[test]
fn test_warning_band_and_recovery() {
    let limits = RunParameters::default().safety;
    let mut safety = SafetyManager::new();

    safety.check_chain(&chain_at(8.5, 1_000.0), &limits, 1, 0.0).unwrap();
    assert_eq!(safety.get_state().safety_level, SafetyLevel::Warning);
    assert!(safety
        .get_event_history()
        .iter()
        .any(|e| e.event == SafetyEvent::ChainSpeedHigh && !e.resolved));

    safety.check_chain(&chain_at(8.5, 45_000.0), &limits, 2, 0.05).unwrap();
    assert_eq!(safety.get_state().active_events, 2);

    safety.check_chain(&chain_at(2.0, 1_000.0), &limits, 3, 0.1).unwrap();
    assert_eq!(safety.get_state().safety_level, SafetyLevel::Normal);
    assert_eq!(safety.get_state().active_events, 0);
}

#[test]
fn test_overspeed_latches_emergency() {
    let limits = RunParameters::default().safety;
    let mut safety = SafetyManager::new();

    let result = safety.check_chain(&chain_at(12.0, 1_000.0), &limits, 5, 0.25);
    assert!(matches!(
        result,
        Err(EmergencyCondition::ChainOverspeed { .. })
    ));
    assert!(safety.is_emergency());
    assert_eq!(safety.get_state().safety_level, SafetyLevel::Emergency);
    assert_eq!(safety.get_state().emergency_count, 1);

    safety.reset();
    assert!(!safety.is_emergency());
    assert!(safety.get_event_history().is_empty());
}

#[test]
fn test_instability_window_expires() {
    let limits = RunParameters::default().safety;
    let mut safety = SafetyManager::new();

    for tick in 1..=3 {
        safety.record_instability(&limits, tick, 0.0).unwrap();
    }
    assert_eq!(safety.get_state().instabilities_in_window, 3);

    // Far enough along that the earlier ones have aged out
    safety.record_instability(&limits, 100, 5.0).unwrap();
    assert_eq!(safety.get_state().instabilities_in_window, 1);
    assert!(!safety.is_emergency());
}

#[test]
fn test_instability_escalation() {
    let limits = RunParameters::default().safety;
    let mut safety = SafetyManager::new();

    for tick in 1..=3 {
        assert!(safety.record_instability(&limits, tick, 0.0).is_ok());
    }
    let result = safety.record_instability(&limits, 4, 0.0);
    assert_eq!(
        result,
        Err(EmergencyCondition::RepeatedInstability {
            count: 4,
            window: 50
        })
    );
    assert!(safety.is_emergency());
}

#[test]
fn test_grid_trip_resolves() {
    let mut safety = SafetyManager::new();
    safety.record_grid_trip(10, 0.5);
    assert_eq!(safety.get_state().safety_level, SafetyLevel::Warning);

    safety.resolve(SafetyEvent::GridTrip);
    assert_eq!(safety.get_state().safety_level, SafetyLevel::Normal);
    assert_eq!(safety.get_event_history().len(), 1);
    assert!(safety.get_event_history()[0].resolved);
}
