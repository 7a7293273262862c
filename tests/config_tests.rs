use buoysim::config::{MAX_FLOATERS, MIN_FLOATERS};
use buoysim::engine::Engine;
use buoysim::error::ValidationError;
use buoysim::snapshot::SimulationSnapshot;
use buoysim::RunParameters;

#[test]
fn test_defaults_are_valid() {
    let params = RunParameters::default();
    assert!(params.validate().is_ok());
    assert_eq!(params.floaters.count, 8);
    assert_eq!(params.drivetrain.active_ratio(), 0.0625);
    assert!(params.timestep.dt >= params.timestep.min_dt);
    assert!(params.timestep.dt <= params.timestep.max_dt);
}

#[test]
fn test_floater_count_rules() {
    let mut params = RunParameters::default();
    for count in [0, 2, MIN_FLOATERS - 1, 9, MAX_FLOATERS + 2] {
        params.floaters.count = count;
        assert!(
            matches!(params.validate(), Err(ValidationError::FloaterCount { .. })),
            "count {count} accepted"
        );
    }
    for count in [MIN_FLOATERS, 12, MAX_FLOATERS] {
        params.floaters.count = count;
        assert!(params.validate().is_ok(), "count {count} rejected");
    }
}

#[test]
fn test_field_validation() {
    let mut params = RunParameters::default();
    params.floaters.volume = -0.1;
    assert!(matches!(
        params.validate(),
        Err(ValidationError::OutOfRange { ref name, .. }) if name == "floaters.volume"
    ));

    let mut params = RunParameters::default();
    params.fluid.gravity = f64::NAN;
    assert!(matches!(
        params.validate(),
        Err(ValidationError::NotFinite { .. })
    ));

    let mut params = RunParameters::default();
    params.timestep.min_dt = 0.2;
    assert!(matches!(
        params.validate(),
        Err(ValidationError::TimestepBounds { .. })
    ));

    let mut params = RunParameters::default();
    params.drivetrain.gear_ratios.clear();
    assert!(matches!(
        params.validate(),
        Err(ValidationError::GearIndex { index: 2, available: 0 })
    ));

    let mut params = RunParameters::default();
    params.electrical.max_input_voltage_pu = 0.05;
    assert!(params.validate().is_err());
}

#[test]
fn test_with_parameter_copies() {
    let params = RunParameters::default();

    let next = params.with_parameter("max_dt", 0.02).unwrap();
    assert_eq!(next.timestep.max_dt, 0.02);
    assert_eq!(next.timestep.dt, 0.02);
    assert_eq!(params.timestep.max_dt, 0.1);

    let next = params.with_parameter("gas_expansion", 0.0).unwrap();
    assert!(!next.pneumatics.gas_expansion);

    assert!(params.with_parameter("gear_index", 1.5).is_err());
    assert!(matches!(
        params.with_parameter("publish_rate_hz", 1e-20),
        Err(ValidationError::OutOfRange { ref name, .. }) if name == "timestep.publish_rate_hz"
    ));
    assert!(params.with_parameter("publish_rate_hz", 1e6).is_err());
    assert!(params.with_parameter("publish_rate_hz", 0.5).is_ok());
    assert!(params.with_parameter("air_pressure", 100_000.0).is_err());
    assert!(matches!(
        params.with_parameter("nope", 1.0),
        Err(ValidationError::UnknownParameter(key)) if key == "nope"
    ));
}

#[test]
fn test_parameters_from_json() {
    let mut params = RunParameters::default();
    params.floaters.count = 12;
    params.electrical.load_factor = 0.7;
    let json = serde_json::to_string(&params).unwrap();

    let decoded: RunParameters = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded.floaters.count, 12);
    assert_eq!(decoded.electrical.load_factor, 0.7);
    assert!(decoded.validate().is_ok());
}

#[test]
fn test_snapshot_csv_row_matches_header() {
    let mut engine = Engine::with_parameters(RunParameters::default()).unwrap();
    let snapshot = engine.step(0.05).unwrap();

    let columns = SimulationSnapshot::csv_header().split(',').count();
    let row = snapshot.to_csv_row();
    assert_eq!(row.split(',').count(), columns);
    assert!(row.starts_with("1,0.0500,Running,"));
}
