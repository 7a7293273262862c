use buoysim::engine::{Engine, EngineStatus};
use buoysim::error::{CommandError, EngineError, ValidationError};
use buoysim::injection::Injection;
use buoysim::protocol::*;
use buoysim::runner::CommandOutcome;
use buoysim::scheduler::ScheduleError;
use buoysim::{Command, RunParameters};

#[test]
fn test_parse_simple_commands() {
    let mut handler = ProtocolHandler::new();

    let stop = handler.parse_command(r#"{"id":1,"command":"stop"}"#).unwrap();
    assert_eq!(stop.id, 1);
    assert_eq!(stop.command, Command::Stop);
    assert_eq!(stop.execution_time, None);

    let step = handler
        .parse_command(r#"  {"id":2,"command":{"step":{"dt":0.05}}}  "#)
        .unwrap();
    assert_eq!(step.command, Command::Step { dt: 0.05 });

    let set = handler
        .parse_command(
            r#"{"id":3,"command":{"set_parameter":{"key":"load_factor","value":0.3}},"execution_time":2.5}"#,
        )
        .unwrap();
    assert_eq!(
        set.command,
        Command::SetParameter {
            key: "load_factor".to_string(),
            value: 0.3
        }
    );
    assert_eq!(set.execution_time, Some(2.5));

    let inject = handler
        .parse_command(r#"{"id":4,"command":{"inject":{"ChainForce":{"newtons":250.0}}}}"#)
        .unwrap();
    assert_eq!(
        inject.command,
        Command::Inject(Injection::ChainForce { newtons: 250.0 })
    );

    assert_eq!(handler.commands_parsed(), 4);
    assert_eq!(handler.commands_rejected(), 0);
}

#[test]
fn test_parse_start_with_parameters() {
    let mut handler = ProtocolHandler::new();
    let envelope = CommandEnvelope {
        id: 9,
        command: Command::Start(Box::new(RunParameters::default())),
        execution_time: None,
    };
    let json = serde_json::to_string(&envelope).unwrap();

    let parsed = handler.parse_command(&json).unwrap();
    assert_eq!(parsed, envelope);
}

#[test]
fn test_parse_rejections() {
    let mut handler = ProtocolHandler::new();

    assert_eq!(
        handler.parse_command("not json"),
        Err(ProtocolError::InvalidJson)
    );
    assert_eq!(
        handler.parse_command(r#"{"id":1,"command":"warp"}"#),
        Err(ProtocolError::InvalidJson)
    );
    let oversized = format!(r#"{{"id":1,"command":"stop","pad":"{}"}}"#, "x".repeat(MAX_COMMAND_SIZE));
    assert_eq!(
        handler.parse_command(&oversized),
        Err(ProtocolError::MessageTooLarge)
    );
    assert_eq!(handler.commands_rejected(), 3);
}

#[test]
fn test_validate_command() {
    let handler = ProtocolHandler::new();
    let envelope = |id: u32, command: Command, execution_time: Option<f64>| CommandEnvelope {
        id,
        command,
        execution_time,
    };

    assert!(handler.validate_command(&envelope(1, Command::Pause, None)).is_ok());
    assert!(handler
        .validate_command(&envelope(1, Command::Pause, Some(3.0)))
        .is_ok());
    assert_eq!(
        handler.validate_command(&envelope(0, Command::Pause, None)),
        Err(ProtocolError::InvalidCommand)
    );
    assert_eq!(
        handler.validate_command(&envelope(1, Command::Pause, Some(-1.0))),
        Err(ProtocolError::InvalidParameter)
    );
    assert_eq!(
        handler.validate_command(&envelope(1, Command::Pause, Some(f64::NAN))),
        Err(ProtocolError::InvalidParameter)
    );
    assert_eq!(
        handler.validate_command(&envelope(1, Command::Step { dt: 0.0 }, None)),
        Err(ProtocolError::InvalidParameter)
    );
    assert_eq!(
        handler.validate_command(&envelope(
            1,
            Command::SetParameter {
                key: String::new(),
                value: 1.0
            },
            None
        )),
        Err(ProtocolError::InvalidParameter)
    );
}

#[test]
fn test_response_serialization() {
    let handler = ProtocolHandler::new();

    let ack = handler.create_ack_response(7);
    let json = handler.serialize_response(&ack).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["type"], "response");
    assert_eq!(value["data"]["id"], 7);
    assert_eq!(value["data"]["status"], "Acknowledged");

    let nack = handler.create_nack_response(8, "bad");
    assert_eq!(nack.status, ResponseStatus::NegativeAck);
    assert_eq!(nack.message.as_deref(), Some("bad"));

    let huge = handler.create_execution_failed_response(9, &"e".repeat(MAX_RESPONSE_SIZE));
    assert_eq!(
        handler.serialize_response(&huge),
        Err(ProtocolError::MessageTooLarge)
    );
}

#[test]
fn test_snapshot_message() {
    let handler = ProtocolHandler::new();
    let mut engine = Engine::with_parameters(RunParameters::default()).unwrap();
    let snapshot = engine.step(0.05).unwrap();

    let json = handler.serialize_snapshot(&snapshot).unwrap();
    match serde_json::from_str::<ServerMessage>(&json).unwrap() {
        ServerMessage::Snapshot(decoded) => {
            assert_eq!(decoded.tick_id, 1);
            assert_eq!(decoded.status, EngineStatus::Running);
            assert_eq!(decoded.floaters.len(), 8);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[test]
fn test_outcome_responses() {
    let handler = ProtocolHandler::new();

    let applied = handler.create_outcome_response(1, &Ok(CommandOutcome::Applied(EngineStatus::Paused)));
    assert_eq!(applied.status, ResponseStatus::Success);
    assert_eq!(applied.message.as_deref(), Some("Paused"));

    let scheduled = handler.create_outcome_response(2, &Ok(CommandOutcome::Scheduled));
    assert_eq!(scheduled.status, ResponseStatus::Scheduled);

    let invalid = handler.create_outcome_response(
        3,
        &Err(CommandError::Engine(EngineError::Validation(
            ValidationError::UnknownParameter("x".to_string()),
        ))),
    );
    assert_eq!(invalid.status, ResponseStatus::NegativeAck);

    let past = handler.create_outcome_response(4, &Err(CommandError::Schedule(ScheduleError::InPast)));
    assert_eq!(past.status, ResponseStatus::NegativeAck);

    let refused = handler.create_outcome_response(
        5,
        &Err(CommandError::Engine(EngineError::InvalidTransition {
            operation: "resume",
            status: EngineStatus::Running,
        })),
    );
    assert_eq!(refused.status, ResponseStatus::ExecutionFailed);
    assert!(refused.message.unwrap().contains("resume"));
}

#[test]
fn test_command_tracking() {
    let mut handler = ProtocolHandler::new();

    handler.track_command(1, 0.0).unwrap();
    assert_eq!(
        handler.get_command_status(1).unwrap().status,
        ResponseStatus::Acknowledged
    );
    assert_eq!(
        handler.track_command(1, 0.5),
        Err(ProtocolError::DuplicateCommand)
    );

    handler
        .update_command_status(1, ResponseStatus::Success, 1.0)
        .unwrap();
    let tracker = handler.get_command_status(1).unwrap();
    assert!(tracker.is_final());
    assert_eq!(tracker.last_update, 1.0);

    // A finished id may be reused
    handler.track_command(1, 2.0).unwrap();
    assert_eq!(handler.get_tracked_commands().len(), 1);

    assert_eq!(
        handler.update_command_status(99, ResponseStatus::Success, 1.0),
        Err(ProtocolError::InvalidCommand)
    );
}

#[test]
fn test_tracking_expiry_and_capacity() {
    let mut handler = ProtocolHandler::new();
    for id in 1..=20 {
        handler.track_command(id, 0.0).unwrap();
    }
    assert_eq!(handler.get_tracked_commands().len(), 16);
    assert!(handler.get_command_status(1).is_none());
    assert!(handler.get_command_status(20).is_some());

    handler.cleanup_expired_commands(31.0);
    assert!(handler.get_tracked_commands().is_empty());
}
