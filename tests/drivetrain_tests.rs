use buoysim::chain::{ChainAggregator, ChainState};
use buoysim::drivetrain::{ClutchOutput, Drivetrain, Flywheel, Gearbox, GearboxState, OneWayClutch, Sprocket};
use buoysim::error::StageFault;
use buoysim::floater::Floater;
use buoysim::pneumatics::Compressor;
use buoysim::stage::{Shaft, Stage, StageContext};
use buoysim::RunParameters;
use proptest::prelude::*;
use std::f64::consts::TAU;

fn ctx(params: &RunParameters, flywheel_speed: f64, load_torque: f64) -> StageContext<'_> {
    StageContext {
        params,
        dt: 0.1,
        load_torque,
        flywheel_speed,
        chain_inertia: 400.0,
    }
}

#[test]
fn test_sprocket_converts_tension() {
    let params = RunParameters::default();
    let mut sprocket = Sprocket::new();
    let chain = ChainState {
        tension: 1000.0,
        angular_velocity: 2.0,
        ..ChainState::default()
    };

    let shaft = sprocket.process(chain, &ctx(&params, 0.0, 0.0)).unwrap();
    assert!((shaft.torque - 490.0).abs() < 1e-9);
    assert_eq!(shaft.speed, 2.0);
    assert!((sprocket.get_state().torque_in - 500.0).abs() < 1e-9);

    let slack = ChainState {
        tension: -1.0,
        ..ChainState::default()
    };
    assert_eq!(
        sprocket.process(slack, &ctx(&params, 0.0, 0.0)),
        Err(StageFault::OutOfRange)
    );
}

#[test]
fn test_gearbox_steps_up_speed() {
    let params = RunParameters::default();
    let mut gearbox = Gearbox::new();
    let input = Shaft {
        torque: 490.0,
        speed: 2.0,
    };

    let out = gearbox.process(input, &ctx(&params, 0.0, 0.0)).unwrap();
    assert!((out.speed - 32.0).abs() < 1e-9);
    assert!((out.torque - 490.0 * 0.0625 * 0.95).abs() < 1e-9);
    assert_eq!(gearbox.get_state().gear_index, 2);

    let mut low = params.clone();
    low.drivetrain.gear_index = 0;
    let out = gearbox.process(input, &ctx(&low, 0.0, 0.0)).unwrap();
    assert!((out.speed - 8.0).abs() < 1e-9);
}

#[test]
fn test_clutch_overruns_when_flywheel_faster() {
    let params = RunParameters::default();
    let mut clutch = OneWayClutch::new();
    let input = Shaft {
        torque: 50.0,
        speed: 10.0,
    };

    let out = clutch.process(input, &ctx(&params, 100.0, 0.0)).unwrap();
    assert!(!out.engaged);
    assert_eq!(out.torque, 0.0);
    assert!(!clutch.is_engaged());
}

#[test]
fn test_gearbox_clears_state_on_fault() {
    let params = RunParameters::default();
    let mut gearbox = Gearbox::new();
    let input = Shaft {
        torque: 490.0,
        speed: 2.0,
    };
    gearbox.process(input, &ctx(&params, 0.0, 0.0)).unwrap();
    assert!(gearbox.get_state().shaft.speed_out > 0.0);

    let mut broken = params.clone();
    broken.drivetrain.gear_ratios[2] = -1.0;
    assert_eq!(
        gearbox.process(input, &ctx(&broken, 0.0, 0.0)),
        Err(StageFault::OutOfRange)
    );
    assert_eq!(gearbox.get_state(), GearboxState::default());
}

#[test]
fn test_clutch_stays_open_while_chain_lags_under_load() {
    let params = RunParameters::default();
    let mut clutch = OneWayClutch::new();
    let input = Shaft {
        torque: 10.0,
        speed: 9.9,
    };

    // Heavy load would pull the flywheel below the chain side by the end of
    // the tick, but the chain side starts behind it
    let out = clutch.process(input, &ctx(&params, 10.0, 500.0)).unwrap();
    assert!(!out.engaged);
    assert_eq!(out.torque, 0.0);
    assert_eq!(clutch.get_state().flywheel_speed, 10.0);
}

#[test]
fn test_clutch_never_drives_flywheel_past_chain_side() {
    let params = RunParameters::default();
    let mut clutch = OneWayClutch::new();
    let input = Shaft {
        torque: 2_000.0,
        speed: 10.5,
    };

    let out = clutch.process(input, &ctx(&params, 10.0, 0.0)).unwrap();
    assert!(out.engaged);
    // Just enough to lift the flywheel from 10.0 to 10.5 in 0.1 s
    let matching = 0.02 * 10.0 + 50.0 * 0.5 / 0.1;
    assert!((out.torque - matching).abs() < 1e-9);
}

#[test]
fn test_clutch_locks_at_matching_speed() {
    let params = RunParameters::default();
    let mut clutch = OneWayClutch::new();
    let input = Shaft {
        torque: 50.0,
        speed: 20.0,
    };

    // Chain side runs ahead of the flywheel within the engagement window
    let out = clutch.process(input, &ctx(&params, 19.8, 5.0)).unwrap();
    assert!(out.engaged);
    assert!(out.torque > 0.0);
    assert_eq!(clutch.get_state().engagements, 1);
}

#[test]
fn test_clutch_disengages_on_bad_input() {
    let params = RunParameters::default();
    let mut clutch = OneWayClutch::new();
    clutch
        .process(
            Shaft {
                torque: 50.0,
                speed: 20.0,
            },
            &ctx(&params, 19.8, 0.0),
        )
        .unwrap();
    assert!(clutch.is_engaged());

    let result = clutch.process(
        Shaft {
            torque: f64::NAN,
            speed: 20.0,
        },
        &ctx(&params, 19.8, 0.0),
    );
    assert_eq!(result, Err(StageFault::NonFiniteInput));
    assert!(!clutch.is_engaged());
    assert_eq!(clutch.get_state().torque_out, 0.0);
}

#[test]
fn test_flywheel_integration() {
    let params = RunParameters::default();
    let mut flywheel = Flywheel::new();
    let drive = ClutchOutput {
        torque: 100.0,
        engaged: true,
    };

    let out = flywheel.process(drive, &ctx(&params, 0.0, 0.0)).unwrap();
    assert!((out.speed - 0.2).abs() < 1e-12);
    let state = flywheel.get_state();
    assert!((state.stored_energy - 1.0).abs() < 1e-9);
    // First-order filter over one second
    assert!((state.average_torque - 100.0 * 0.1 / 1.1).abs() < 1e-9);
    assert!(state.available_power > 0.0);

    assert_eq!(
        flywheel.process(drive, &ctx(&params, 0.2, -1.0)),
        Err(StageFault::OutOfRange)
    );
}

#[test]
fn test_flywheel_never_spins_backwards() {
    let params = RunParameters::default();
    let mut flywheel = Flywheel::new();
    let idle = ClutchOutput::default();

    for _ in 0..10 {
        let out = flywheel.process(idle, &ctx(&params, 0.0, 500.0)).unwrap();
        assert_eq!(out.speed, 0.0);
    }
}

#[test]
fn test_drivetrain_follows_locked_chain() {
    let params = RunParameters::default();
    let n = params.floaters.count;
    let mut floaters: Vec<Floater> = (0..n)
        .map(|i| Floater::new(i, &params.floaters, i as f64 * TAU / n as f64, &params.fluid))
        .collect();
    let mut chain = ChainAggregator::new();
    let mut compressor = Compressor::new();
    let mut drivetrain = Drivetrain::new();
    let ratio = params.drivetrain.active_ratio();

    for tick in 0..40 {
        let coupling = drivetrain.coupling(&params, 0.0);
        let inertia = ChainAggregator::chain_inertia(&floaters, &params);
        chain
            .advance(
                &mut floaters,
                &mut compressor,
                &params,
                &coupling,
                0.0,
                tick as f64 * 0.05,
                0.05,
            )
            .unwrap();
        let state = drivetrain.process(&chain.get_state(), &params, inertia, 0.0, 0.05);

        let chain_state = chain.get_state();
        assert!(chain_state.locked_to_flywheel);
        assert!(state.clutch_engaged);
        let chain_side = chain_state.angular_velocity / ratio;
        assert!(
            (chain_side - state.flywheel_speed).abs() < 1e-6,
            "tick {tick}: chain side {chain_side} vs flywheel {}",
            state.flywheel_speed
        );
    }
    assert!(drivetrain.flywheel_speed() > 0.0);
    assert_eq!(drivetrain.get_state().stage_faults, 0);
}

#[test]
fn test_drivetrain_substitutes_zero_on_fault() {
    let params = RunParameters::default();
    let mut drivetrain = Drivetrain::new();
    let broken = ChainState {
        tension: f64::NAN,
        ..ChainState::default()
    };

    let state = drivetrain.process(&broken, &params, 400.0, 0.0, 0.05);
    assert!(state.stage_faults >= 1);
    assert_eq!(state.clutch.torque_out, 0.0);
    assert_eq!(state.flywheel_speed, 0.0);
}

proptest! {
    #[test]
    fn prop_engaged_clutch_never_pulls(
        torque in 0.0f64..2_000.0,
        speed in 0.0f64..400.0,
        flywheel_speed in 0.0f64..400.0,
        load in 0.0f64..2_000.0,
    ) {
        let params = RunParameters::default();
        let mut clutch = OneWayClutch::new();
        let out = clutch
            .process(Shaft { torque, speed }, &ctx(&params, flywheel_speed, load))
            .unwrap();

        if out.engaged {
            prop_assert!(out.torque >= 0.0);
            prop_assert!(speed + 1e-6 >= flywheel_speed);
            prop_assert!((speed - flywheel_speed).abs() < params.drivetrain.clutch_engagement_threshold);
            // The flywheel never ends the tick ahead of the chain side
            let resisting = load + params.drivetrain.flywheel_friction * flywheel_speed;
            let limit = resisting + params.drivetrain.flywheel_inertia * (speed - flywheel_speed) / 0.1;
            prop_assert!(out.torque <= limit.max(0.0) + 1e-9);
        } else {
            prop_assert_eq!(out.torque, 0.0);
        }
    }

    #[test]
    fn prop_flywheel_speed_non_negative(
        torques in proptest::collection::vec(0.0f64..500.0, 1..50),
        load in 0.0f64..1_000.0,
    ) {
        let params = RunParameters::default();
        let mut flywheel = Flywheel::new();
        for torque in torques {
            let speed = flywheel.speed();
            let out = flywheel
                .process(ClutchOutput { torque, engaged: torque > 0.0 }, &ctx(&params, speed, load))
                .unwrap();
            prop_assert!(out.speed >= 0.0);
            prop_assert!(flywheel.get_state().stored_energy >= 0.0);
        }
    }
}
