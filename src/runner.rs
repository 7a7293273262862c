//! Threaded continuous run loop.
//!
//! [`SimulationRunner`] moves an [`Engine`] onto a dedicated OS thread, the
//! only context that ever mutates simulation state. Commands arrive over a
//! bounded mpsc channel and are applied between ticks; snapshots leave over
//! a broadcast channel where slow subscribers lose the oldest frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::engine::{Engine, EngineStatus};
use crate::error::{CommandError, SubmitError};
use crate::snapshot::SimulationSnapshot;

const DEFAULT_COMMAND_CAPACITY: usize = 64;
const DEFAULT_SNAPSHOT_CAPACITY: usize = 256;

pub type Reply = Result<CommandOutcome, CommandError>;

/// What happened to an accepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied(EngineStatus),
    Scheduled,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub command_capacity: usize,
    pub snapshot_capacity: usize,
    /// Pace ticks to wall-clock time. Off runs as fast as the engine allows.
    pub realtime: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            realtime: true,
        }
    }
}

struct Request {
    id: u32,
    command: Command,
    execution_time: Option<f64>,
    reply: Option<oneshot::Sender<Reply>>,
}

pub struct SimulationRunner {
    commands: Option<mpsc::Sender<Request>>,
    snapshots: broadcast::Sender<SimulationSnapshot>,
    shutdown: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<Engine>>,
}

impl SimulationRunner {
    pub fn spawn(engine: Engine) -> std::io::Result<Self> {
        Self::with_options(engine, RunnerOptions::default())
    }

    pub fn with_options(engine: Engine, options: RunnerOptions) -> std::io::Result<Self> {
        let (command_tx, command_rx) = mpsc::channel(options.command_capacity.max(1));
        let (snapshot_tx, _) = broadcast::channel(options.snapshot_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_requested = Arc::new(AtomicBool::new(false));

        let tick_thread = TickThread {
            engine,
            commands: command_rx,
            snapshots: snapshot_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            stop_requested: Arc::clone(&stop_requested),
            realtime: options.realtime,
        };
        let handle = thread::Builder::new()
            .name("buoysim-tick".to_string())
            .spawn(move || tick_thread.run())?;

        Ok(Self {
            commands: Some(command_tx),
            snapshots: snapshot_tx,
            shutdown,
            stop_requested,
            handle: Some(handle),
        })
    }

    /// Submit a command and get a receiver for its outcome.
    pub fn submit(&self, command: Command) -> Result<oneshot::Receiver<Reply>, SubmitError> {
        self.submit_request(0, command, None)
    }

    /// Submit a command to run once simulation time reaches `execution_time`.
    pub fn submit_at(
        &self,
        id: u32,
        command: Command,
        execution_time: f64,
    ) -> Result<oneshot::Receiver<Reply>, SubmitError> {
        self.submit_request(id, command, Some(execution_time))
    }

    /// Submit without waiting for an outcome.
    pub fn send(&self, command: Command) -> Result<(), SubmitError> {
        self.enqueue(Request {
            id: 0,
            command,
            execution_time: None,
            reply: None,
        })
    }

    fn submit_request(
        &self,
        id: u32,
        command: Command,
        execution_time: Option<f64>,
    ) -> Result<oneshot::Receiver<Reply>, SubmitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Request {
            id,
            command,
            execution_time,
            reply: Some(reply_tx),
        })?;
        Ok(reply_rx)
    }

    fn enqueue(&self, request: Request) -> Result<(), SubmitError> {
        let sender = self.commands.as_ref().ok_or(SubmitError::Shutdown)?;
        let is_stop = matches!(request.command, Command::Stop) && request.execution_time.is_none();
        match sender.try_send(request) {
            Ok(()) => {
                if is_stop {
                    // Discard the snapshot of any tick already in flight
                    self.stop_requested.store(true, Ordering::Release);
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(SubmitError::ChannelFull),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Shutdown),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimulationSnapshot> {
        self.snapshots.subscribe()
    }

    /// Stop the tick thread and hand back the engine.
    ///
    /// Returns `None` if the thread panicked.
    pub fn shutdown(mut self) -> Option<Engine> {
        self.shutdown.store(true, Ordering::Release);
        self.commands.take();
        self.handle.take()?.join().ok()
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

struct TickThread {
    engine: Engine,
    commands: mpsc::Receiver<Request>,
    snapshots: broadcast::Sender<SimulationSnapshot>,
    shutdown: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    realtime: bool,
}

impl TickThread {
    fn run(mut self) -> Engine {
        info!("tick thread started");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !self.drain_commands() {
                break;
            }
            if self.engine.status() != EngineStatus::Running {
                continue;
            }

            let tick_start = Instant::now();
            match self.engine.run_tick() {
                Ok(snapshot) => {
                    let changed = snapshot.status != EngineStatus::Running;
                    let dt = snapshot.dt;
                    if self.stop_requested.load(Ordering::Acquire) {
                        debug!(tick_id = snapshot.tick_id, "stop pending, in-flight snapshot discarded");
                    } else if changed || self.engine.should_publish(Instant::now()) {
                        self.publish(snapshot);
                    }
                    if self.realtime {
                        let budget = Duration::from_secs_f64(dt.max(0.0));
                        if let Some(remaining) = budget.checked_sub(tick_start.elapsed()) {
                            thread::sleep(remaining);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "tick failed");
                    if let Some(snapshot) = self.engine.last_snapshot() {
                        let snapshot = snapshot.clone();
                        self.publish(snapshot);
                    }
                }
            }
        }
        info!("tick thread stopped");
        self.engine
    }

    /// Apply every queued command. Blocks for the next one while the
    /// engine is not running. Returns `false` once all senders are gone.
    fn drain_commands(&mut self) -> bool {
        loop {
            let request = if self.engine.status() == EngineStatus::Running {
                match self.commands.try_recv() {
                    Ok(request) => request,
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Disconnected) => return false,
                }
            } else {
                match self.commands.blocking_recv() {
                    Some(request) => request,
                    None => return false,
                }
            };
            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        let Request {
            id,
            command,
            execution_time,
            reply,
        } = request;
        let name = command.name();
        let before = self.engine.status();
        let is_stop = matches!(command, Command::Stop);
        let is_step = matches!(command, Command::Step { .. });

        let outcome: Reply = match execution_time {
            Some(at) => self
                .engine
                .schedule(id, command, at)
                .map(|()| CommandOutcome::Scheduled)
                .map_err(CommandError::from),
            None => self
                .engine
                .apply(command)
                .map(CommandOutcome::Applied)
                .map_err(CommandError::from),
        };
        if is_stop && execution_time.is_none() {
            self.stop_requested.store(false, Ordering::Release);
        }

        match &outcome {
            Ok(result) => debug!(id, command = name, ?result, "command applied"),
            Err(e) => warn!(id, command = name, error = %e, "command rejected"),
        }
        if is_step || self.engine.status() != before {
            self.publish(self.engine.snapshot());
        }
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn publish(&self, snapshot: SimulationSnapshot) {
        // No subscribers is not an error
        let _ = self.snapshots.send(snapshot);
    }
}
