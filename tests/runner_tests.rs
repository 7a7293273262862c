use buoysim::engine::{Engine, EngineStatus};
use buoysim::error::{CommandError, EngineError};
use buoysim::runner::{CommandOutcome, RunnerOptions, SimulationRunner};
use buoysim::scheduler::ScheduleError;
use buoysim::{Command, RunParameters};

fn runner() -> SimulationRunner {
    let engine = Engine::with_parameters(RunParameters::default()).unwrap();
    let options = RunnerOptions {
        realtime: false,
        ..RunnerOptions::default()
    };
    SimulationRunner::with_options(engine, options).unwrap()
}

#[test]
fn test_step_reply_and_snapshot() {
    let runner = runner();
    let mut snapshots = runner.subscribe();

    let reply = runner
        .submit(Command::Step { dt: 0.05 })
        .unwrap()
        .blocking_recv()
        .unwrap();
    assert_eq!(reply, Ok(CommandOutcome::Applied(EngineStatus::Running)));

    let first = snapshots.blocking_recv().unwrap();
    assert_eq!(first.tick_id, 1);
    assert_eq!(first.status, EngineStatus::Running);

    let reply = runner.submit(Command::Pause).unwrap().blocking_recv().unwrap();
    assert_eq!(reply, Ok(CommandOutcome::Applied(EngineStatus::Paused)));

    let engine = runner.shutdown().unwrap();
    assert_eq!(engine.status(), EngineStatus::Paused);
    assert!(engine.tick_id() >= 1);
}

#[test]
fn test_runner_ticks_while_running() {
    let runner = runner();
    let mut snapshots = runner.subscribe();

    runner
        .submit(Command::Step { dt: 0.05 })
        .unwrap()
        .blocking_recv()
        .unwrap()
        .unwrap();

    // Continuous ticking publishes on its own once running
    let mut latest = snapshots.blocking_recv().unwrap().tick_id;
    while latest < 5 {
        latest = snapshots.blocking_recv().unwrap().tick_id;
    }

    let reply = runner.submit(Command::Stop).unwrap().blocking_recv().unwrap();
    assert_eq!(reply, Ok(CommandOutcome::Applied(EngineStatus::Stopped)));
    let engine = runner.shutdown().unwrap();
    assert_eq!(engine.status(), EngineStatus::Stopped);
    assert!(engine.tick_id() >= 5);
}

#[test]
fn test_rejected_commands_reply_with_error() {
    let runner = runner();

    let reply = runner.submit(Command::Resume).unwrap().blocking_recv().unwrap();
    assert!(matches!(
        reply,
        Err(CommandError::Engine(EngineError::InvalidTransition {
            operation: "resume",
            status: EngineStatus::Ready,
        }))
    ));

    let reply = runner
        .submit_at(3, Command::Step { dt: 0.05 }, 1.0)
        .unwrap()
        .blocking_recv()
        .unwrap();
    assert_eq!(
        reply,
        Err(CommandError::Schedule(ScheduleError::NotSchedulable))
    );

    let engine = runner.shutdown().unwrap();
    assert_eq!(engine.status(), EngineStatus::Ready);
}

#[test]
fn test_scheduled_command_through_runner() {
    let runner = runner();

    let reply = runner
        .submit_at(
            4,
            Command::SetParameter {
                key: "load_factor".to_string(),
                value: 0.25,
            },
            0.0,
        )
        .unwrap()
        .blocking_recv()
        .unwrap();
    assert_eq!(reply, Ok(CommandOutcome::Scheduled));

    // The first tick releases it
    runner
        .submit(Command::Step { dt: 0.05 })
        .unwrap()
        .blocking_recv()
        .unwrap()
        .unwrap();
    runner.submit(Command::Pause).unwrap().blocking_recv().unwrap().unwrap();

    let engine = runner.shutdown().unwrap();
    assert_eq!(engine.parameters().electrical.load_factor, 0.25);
    assert!(engine.scheduler().get_scheduled_commands().is_empty());
}

#[test]
fn test_fire_and_forget() {
    let runner = runner();
    runner.send(Command::TriggerPulse).unwrap();
    let reply = runner.submit(Command::Stop).unwrap().blocking_recv().unwrap();
    assert_eq!(reply, Ok(CommandOutcome::Applied(EngineStatus::Stopped)));

    let engine = runner.shutdown().unwrap();
    // Commands are applied in submission order
    assert_eq!(engine.compressor_state().pulses, 1);
}
