use buoysim::protocol::{CommandEnvelope, ProtocolHandler, ResponseStatus};
use buoysim::{Engine, RunParameters, RunnerOptions, SimulationRunner, SubmitError};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 8080;

struct Server {
    runner: SimulationRunner,
    protocol: Mutex<ProtocolHandler>,
    started: Instant,
}

impl Server {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Buoyancy Generator Simulator");
    println!("============================");

    let port = std::env::args()
        .nth(1)
        .map(|p| p.parse::<u16>())
        .transpose()?
        .unwrap_or(TCP_PORT);

    let engine = Engine::with_parameters(RunParameters::default())?;
    let runner = SimulationRunner::with_options(engine, RunnerOptions::default())?;
    let server = Arc::new(Server {
        runner,
        protocol: Mutex::new(ProtocolHandler::new()),
        started: Instant::now(),
    });

    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!(port, "TCP server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(%addr, "client connected");
                    let client_server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, client_server).await {
                            warn!(%addr, error = %e, "client error");
                        }
                        info!(%addr, "client disconnected");
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    match Arc::try_unwrap(server) {
        Ok(server) => {
            if let Some(engine) = server.runner.shutdown() {
                info!(status = ?engine.status(), sim_time = engine.sim_time(), "simulation stopped");
            }
        }
        Err(_) => warn!("clients still connected, tick thread left to exit on drop"),
    }
    println!("Simulator stopped");
    Ok(())
}

async fn write_line(writer: &Mutex<OwnedWriteHalf>, line: &str) -> std::io::Result<()> {
    let mut guard = writer.lock().await;
    guard.write_all(line.as_bytes()).await?;
    guard.write_all(b"\n").await
}

async fn handle_client(stream: TcpStream, server: Arc<Server>) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    // Snapshot streaming task
    let mut snapshots = server.runner.subscribe();
    let snapshot_writer = Arc::clone(&writer);
    let snapshot_server = Arc::clone(&server);
    let snapshot_task = tokio::spawn(async move {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    let line = {
                        let protocol = snapshot_server.protocol.lock().await;
                        protocol.serialize_snapshot(&snapshot)
                    };
                    let Ok(line) = line else { continue };
                    if let Err(e) = write_line(&snapshot_writer, &line).await {
                        warn!(error = %e, "failed to send snapshot");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "client lagging, snapshots dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&server, &writer, &line).await {
            write_line(&writer, &response).await?;
        }
    }

    snapshot_task.abort();
    Ok(())
}

/// Parse, validate and submit one command. Returns a rejection line, or
/// `None` once the command was acknowledged; the final response is written
/// when the simulation thread replies.
async fn handle_line(server: &Arc<Server>, writer: &Arc<Mutex<OwnedWriteHalf>>, line: &str) -> Option<String> {
    let mut protocol = server.protocol.lock().await;

    let envelope: CommandEnvelope = match protocol.parse_command(line) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "failed to parse command");
            let response = protocol.create_nack_response(0, &e.to_string());
            return protocol.serialize_response(&response).ok();
        }
    };
    let id = envelope.id;
    if let Err(e) = protocol.validate_command(&envelope) {
        let response = protocol.create_nack_response(id, &e.to_string());
        return protocol.serialize_response(&response).ok();
    }
    if let Err(e) = protocol.track_command(id, server.now()) {
        let response = protocol.create_nack_response(id, &e.to_string());
        return protocol.serialize_response(&response).ok();
    }

    info!(id, command = envelope.command.name(), "command received");
    let submitted = match envelope.execution_time {
        Some(at) => server.runner.submit_at(id, envelope.command, at),
        None => server.runner.submit(envelope.command),
    };
    let reply = match submitted {
        Ok(reply) => reply,
        Err(e) => {
            let status = match e {
                SubmitError::ChannelFull => ResponseStatus::NegativeAck,
                SubmitError::Shutdown => ResponseStatus::ExecutionFailed,
            };
            let _ = protocol.update_command_status(id, status, server.now());
            let response = protocol.create_response(id, status, Some(&e.to_string()));
            return protocol.serialize_response(&response).ok();
        }
    };

    let ack = protocol.create_ack_response(id);
    let ack_line = protocol.serialize_response(&ack).ok();
    drop(protocol);
    if let Some(ack_line) = ack_line {
        if let Err(e) = write_line(writer, &ack_line).await {
            warn!(id, error = %e, "failed to send acknowledgement");
        }
    }

    let server = Arc::clone(server);
    let writer = Arc::clone(writer);
    tokio::spawn(async move {
        let outcome = reply.await;
        let line = {
            let mut protocol = server.protocol.lock().await;
            let response = match outcome {
                Ok(outcome) => protocol.create_outcome_response(id, &outcome),
                Err(_) => protocol.create_execution_failed_response(id, "simulation thread stopped"),
            };
            let _ = protocol.update_command_status(id, response.status, server.now());
            protocol.serialize_response(&response)
        };
        match line {
            Ok(line) => {
                if let Err(e) = write_line(&writer, &line).await {
                    warn!(id, error = %e, "failed to send response");
                }
            }
            Err(e) => error!(id, error = %e, "failed to serialize response"),
        }
    });

    None
}
