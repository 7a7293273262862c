use buoysim::protocol::{CommandEnvelope, ResponseStatus, ServerMessage};
use buoysim::{Command, Engine, EngineError, Injection, RunParameters, SimulationSnapshot};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const RESPONSE_TIMEOUT_SECS: u64 = 5;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

fn positive_number(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(x) if x.is_finite() && x > 0.0 => Ok(()),
        _ => Err("must be a positive number".to_string()),
    }
}

fn number(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(x) if x.is_finite() => Ok(()),
        _ => Err("must be a finite number".to_string()),
    }
}

fn count(v: String) -> Result<(), String> {
    v.parse::<u64>().map(|_| ()).map_err(|_| "must be a whole number".to_string())
}

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("buoysim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Chain-driven buoyancy generator simulator")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Simulator port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "compact", "json", "csv"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("at")
                .long("at")
                .value_name("SIM_SECONDS")
                .help("Schedule the command for a simulation time")
                .takes_value(true)
                .global(true)
                .validator(number),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run a headless batch simulation in this process")
                .arg(
                    Arg::with_name("ticks")
                        .short("n")
                        .long("ticks")
                        .value_name("N")
                        .takes_value(true)
                        .default_value("200")
                        .validator(count),
                )
                .arg(
                    Arg::with_name("dt")
                        .long("dt")
                        .value_name("SECONDS")
                        .help("Fixed timestep; omitted uses the adaptive timestep")
                        .takes_value(true)
                        .validator(positive_number),
                )
                .arg(
                    Arg::with_name("every")
                        .long("every")
                        .value_name("N")
                        .help("Print every Nth snapshot")
                        .takes_value(true)
                        .default_value("10")
                        .validator(count),
                )
                .arg(
                    Arg::with_name("floaters")
                        .long("floaters")
                        .value_name("COUNT")
                        .takes_value(true)
                        .validator(count),
                )
                .arg(
                    Arg::with_name("load-factor")
                        .long("load-factor")
                        .value_name("FRACTION")
                        .takes_value(true)
                        .validator(number),
                )
                .arg(
                    Arg::with_name("air-pressure")
                        .long("air-pressure")
                        .value_name("PASCAL")
                        .takes_value(true)
                        .validator(positive_number),
                )
                .arg(
                    Arg::with_name("mechanical-only")
                        .long("mechanical-only")
                        .help("Run without the electrical system"),
                )
                .arg(
                    Arg::with_name("params")
                        .long("params")
                        .value_name("JSON")
                        .help("Full run parameters as JSON")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("start").about("Start the server simulation with default parameters"))
        .subcommand(SubCommand::with_name("stop").about("Stop the server simulation"))
        .subcommand(SubCommand::with_name("pause").about("Pause the server simulation"))
        .subcommand(SubCommand::with_name("resume").about("Resume a paused simulation"))
        .subcommand(SubCommand::with_name("reset").about("Reset to the initial state"))
        .subcommand(SubCommand::with_name("pulse").about("Fire the air compressor now"))
        .subcommand(
            SubCommand::with_name("step").about("Advance one tick").arg(
                Arg::with_name("dt")
                    .help("Timestep in seconds")
                    .required(true)
                    .validator(positive_number),
            ),
        )
        .subcommand(
            SubCommand::with_name("set")
                .about("Change a runtime parameter")
                .arg(Arg::with_name("key").required(true))
                .arg(Arg::with_name("value").required(true).validator(number)),
        )
        .subcommand(
            SubCommand::with_name("inject")
                .about("Inject a one-shot chain force")
                .arg(
                    Arg::with_name("newtons")
                        .required(true)
                        .validator(number),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("Stream snapshots from the server")
                .arg(
                    Arg::with_name("count")
                        .short("c")
                        .long("count")
                        .value_name("N")
                        .help("Stop after N snapshots")
                        .takes_value(true)
                        .validator(count),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string();
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let format = matches.value_of("format").unwrap_or("table").to_string();
    let at = matches.value_of("at").map(str::parse::<f64>).transpose()?;

    let remote = |command: Command| RemoteCommand {
        host: host.clone(),
        port,
        format: format.clone(),
        execution_time: at,
        command,
    };

    match matches.subcommand() {
        ("run", Some(sub)) => run_batch(sub, &format)?,
        ("start", _) => remote(Command::Start(Box::default())).send().await?,
        ("stop", _) => remote(Command::Stop).send().await?,
        ("pause", _) => remote(Command::Pause).send().await?,
        ("resume", _) => remote(Command::Resume).send().await?,
        ("reset", _) => remote(Command::Reset).send().await?,
        ("pulse", _) => remote(Command::TriggerPulse).send().await?,
        ("step", Some(sub)) => {
            let dt = parse_arg(sub, "dt")?;
            remote(Command::Step { dt }).send().await?
        }
        ("set", Some(sub)) => {
            let key = sub.value_of("key").unwrap_or_default().to_string();
            let value = parse_arg(sub, "value")?;
            remote(Command::SetParameter { key, value }).send().await?
        }
        ("inject", Some(sub)) => {
            let newtons = parse_arg(sub, "newtons")?;
            remote(Command::Inject(Injection::ChainForce { newtons })).send().await?
        }
        ("monitor", Some(sub)) => {
            let limit = sub.value_of("count").map(str::parse::<u64>).transpose()?;
            monitor(&host, port, &format, limit).await?
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
        }
    }
    Ok(())
}

fn parse_arg(matches: &ArgMatches<'_>, name: &str) -> CliResult<f64> {
    let raw = matches.value_of(name).ok_or_else(|| format!("missing {name}"))?;
    Ok(raw.parse()?)
}

// ---- headless batch ----

fn run_batch(matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let mut params = match matches.value_of("params") {
        Some(json) => serde_json::from_str::<RunParameters>(json)?,
        None => RunParameters::default(),
    };
    if let Some(n) = matches.value_of("floaters") {
        params.floaters.count = n.parse()?;
    }
    if let Some(v) = matches.value_of("load-factor") {
        params.electrical.load_factor = v.parse()?;
    }
    if let Some(v) = matches.value_of("air-pressure") {
        params.pneumatics.air_pressure = v.parse()?;
    }
    if matches.is_present("mechanical-only") {
        params.electrical.enabled = false;
    }

    let ticks: u64 = matches.value_of("ticks").unwrap_or("200").parse()?;
    let every: u64 = matches.value_of("every").unwrap_or("10").parse::<u64>()?.max(1);
    let fixed_dt = matches.value_of("dt").map(str::parse::<f64>).transpose()?;

    let mut engine = Engine::new();
    if let Err(e) = engine.start(params) {
        eprintln!("{} {}", "Invalid parameters:".bright_red(), e);
        return Err(e.into());
    }

    print_header(format);
    for _ in 0..ticks {
        let result = match fixed_dt {
            Some(dt) => engine.step(dt),
            None => engine.run_tick(),
        };
        match result {
            Ok(snapshot) => {
                if snapshot.tick_id % every == 0 {
                    print_snapshot(&snapshot, format);
                }
            }
            Err(EngineError::Emergency(condition)) => {
                if let Some(snapshot) = engine.last_snapshot() {
                    print_snapshot(snapshot, format);
                }
                eprintln!("{} {}", "EMERGENCY:".bright_red().bold(), condition);
                break;
            }
            Err(e) => {
                eprintln!("{} {}", "Tick failed:".bright_red(), e);
                break;
            }
        }
    }
    print_footer(&engine, format);
    Ok(())
}

// ---- remote commands ----

struct RemoteCommand {
    host: String,
    port: u16,
    format: String,
    execution_time: Option<f64>,
    command: Command,
}

impl RemoteCommand {
    async fn send(self) -> CliResult {
        let name = self.command.name();
        let id = command_id();
        let envelope = CommandEnvelope {
            id,
            command: self.command,
            execution_time: self.execution_time,
        };
        let stream = connect(&self.host, self.port).await?;
        let (reader, mut writer) = stream.into_split();
        writer
            .write_all(format!("{}\n", serde_json::to_string(&envelope)?).as_bytes())
            .await?;

        let mut lines = BufReader::new(reader).lines();
        let wait = async {
            while let Some(line) = lines.next_line().await? {
                let Ok(ServerMessage::Response(response)) = serde_json::from_str::<ServerMessage>(&line) else {
                    continue;
                };
                if response.id != id {
                    continue;
                }
                if self.format == "json" {
                    println!("{line}");
                }
                if response.status != ResponseStatus::Acknowledged {
                    return Ok::<_, std::io::Error>(Some(response));
                }
            }
            Ok(None)
        };
        let response = tokio::time::timeout(std::time::Duration::from_secs(RESPONSE_TIMEOUT_SECS), wait)
            .await
            .map_err(|_| "timed out waiting for a response")??;

        let Some(response) = response else {
            return Err("server closed connection".into());
        };
        if self.format == "json" {
            return Ok(());
        }
        let message = response.message.unwrap_or_default();
        let message = message.as_str();
        match response.status {
            ResponseStatus::Success => println!("{} {} {}", "OK".bright_green(), name.bright_white(), message.bright_cyan()),
            ResponseStatus::Scheduled => println!("{} {} scheduled", "OK".bright_green(), name.bright_white()),
            ResponseStatus::NegativeAck => println!("{} {} rejected: {}", "NACK".red(), name.bright_white(), message.bright_red()),
            ResponseStatus::ExecutionFailed => println!("{} {} failed: {}", "FAIL".yellow(), name.bright_white(), message.bright_red()),
            ResponseStatus::Acknowledged => {}
        }
        Ok(())
    }
}

fn command_id() -> u32 {
    // Low bits of the wall clock are unique enough per invocation
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos().max(1))
        .unwrap_or(1)
}

async fn connect(host: &str, port: u16) -> CliResult<TcpStream> {
    let addr = format!("{host}:{port}");
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to simulator at {}", "ERR".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("   Start it with {}", "cargo run --bin buoysim-simulator".bright_cyan());
            }
            Err(e.into())
        }
    }
}

async fn monitor(host: &str, port: u16, format: &str, limit: Option<u64>) -> CliResult {
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();
    let mut seen = 0u64;

    print_header(format);
    while let Some(line) = lines.next_line().await? {
        if let Ok(ServerMessage::Snapshot(snapshot)) = serde_json::from_str::<ServerMessage>(&line) {
            print_snapshot(&snapshot, format);
            seen += 1;
            if limit.is_some_and(|n| seen >= n) {
                break;
            }
        }
    }
    Ok(())
}

// ---- output ----

fn print_header(format: &str) {
    match format {
        "csv" => println!("{}", SimulationSnapshot::csv_header()),
        "table" => {
            println!(
                "{}",
                format!(
                    "{:>6} {:>8} {:>9} {:>10} {:>8} {:>9} {:>9} {:>9} {:>5} {:>5} {:>4}",
                    "tick", "time s", "status", "tension N", "chain", "fly rad/s", "power W", "load Nm", "grid", "corr", "rb"
                )
                .as_str()
                .bright_white()
                .bold()
            );
        }
        _ => {}
    }
}

fn print_snapshot(s: &SimulationSnapshot, format: &str) {
    match format {
        "json" => match serde_json::to_string(s) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("{} {}", "serialization failed:".red(), e),
        },
        "csv" => println!("{}", s.to_csv_row()),
        "compact" => println!(
            "t={:.2} {:?} T={:.0}N v={:.3}m/s w={:.2} P={:.0}W",
            s.sim_time, s.status, s.chain_tension, s.chain_speed, s.flywheel_speed, s.electrical_power
        ),
        _ => {
            let status = format!("{:?}", s.status);
            let status = match s.status {
                buoysim::EngineStatus::Running => status.as_str().bright_green(),
                buoysim::EngineStatus::Error => status.as_str().bright_red().bold(),
                _ => status.as_str().yellow(),
            };
            let grid = if s.grid_synchronized { "sync".green() } else { "off".dimmed() };
            println!(
                "{:>6} {:>8.2} {:>9} {:>10.1} {:>8.3} {:>9.2} {:>9.1} {:>9.2} {:>5} {:>5} {:>4}",
                s.tick_id,
                s.sim_time,
                status,
                s.chain_tension,
                s.chain_speed,
                s.flywheel_speed,
                s.electrical_power,
                s.load_torque_command,
                grid,
                s.correction_events_count,
                s.rollback_count
            );
        }
    }
}

fn print_footer(engine: &Engine, format: &str) {
    if format != "table" {
        return;
    }
    let stats = engine.optimizer().get_stats();
    let compressor = engine.compressor_state();
    println!();
    println!("{}", "Run summary".bright_blue().bold());
    println!("  status            {:?}", engine.status());
    println!("  sim time          {:.2} s over {} ticks", engine.sim_time(), engine.tick_id());
    println!("  tick duration     {:.3} ms mean, {:.4} ms² variance", stats.mean_tick_ms, stats.variance_tick_ms2);
    println!("  timestep          {:.4} s ({} shrinks, {} grows)", stats.dt, stats.dt_shrinks, stats.dt_grows);
    println!("  compressor        {} pulses, {} missed", compressor.pulses, compressor.missed_pulses);
    println!("  corrections       {}", engine.synchronizer().total_corrections());
    let events = engine.safety().get_event_history();
    if !events.is_empty() {
        println!("  safety events     {}", events.len().to_string().as_str().yellow());
        for event in events.iter().rev().take(5) {
            println!(
                "    tick {:>6} {:?} {:?}{}",
                event.tick_id,
                event.level,
                event.event,
                if event.resolved { " (resolved)" } else { "" }
            );
        }
    }
}
