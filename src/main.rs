use anyhow::Context;
use env_logger::{Env, TimestampPrecision};
use sandfuzz::{
    config::{BackendKind, Config},
    crash::CrashTable,
    exec::{ExecOptions, Language},
    fuzz::{self, stats::Stats, EngineSettings, FuzzEngine, FuzzJob},
    import,
    monitor::{ClientMessage, MessageKind, ServerMessage},
    mutation::http::mutate_all,
    serve, setup_signal_handler,
    utils::StopToken,
};
use std::{
    fs::read_to_string,
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "sandfuzz", about = "Sandboxed fuzzing execution engine.")]
struct Settings {
    /// Sandbox backend: container or process (unconfined, for local testing).
    #[structopt(long, short = "b", default_value = "container")]
    backend: BackendKind,
    /// Container runtime binary.
    #[structopt(long, default_value = "docker")]
    runtime: String,
    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Run the job queue, worker pool and live monitor.
    Serve {
        /// Number of workers, the cap on concurrent sandboxes.
        #[structopt(long, short = "j", default_value = "4")]
        workers: usize,
        /// Directory holding the job store and the crash table.
        #[structopt(long, short = "s")]
        state_dir: Option<PathBuf>,
        /// Live monitor address.
        #[structopt(long, default_value = "127.0.0.1:7878")]
        monitor: String,
        /// Disable the live monitor.
        #[structopt(long)]
        no_monitor: bool,
        /// Monitor broadcast tick in milliseconds.
        #[structopt(long, default_value = "1000")]
        tick_ms: u64,
        /// Idle poll interval in milliseconds.
        #[structopt(long, default_value = "250")]
        poll_ms: u64,
        /// Attempts per job.
        #[structopt(long, default_value = "3")]
        max_attempts: u32,
    },
    /// Fuzz one job described by a json file and print its report.
    Run {
        /// FuzzJob json.
        job: PathBuf,
        /// Crash table to update.
        #[structopt(long)]
        crashes: Option<PathBuf>,
    },
    /// Run a program once per input file and print crashing inputs.
    Fuzz {
        /// Program file.
        code: PathBuf,
        /// Program language.
        #[structopt(long, short = "l")]
        language: Language,
        /// Input files.
        inputs: Vec<PathBuf>,
        /// Per-execution timeout in milliseconds.
        #[structopt(long)]
        timeout_ms: Option<u64>,
    },
    /// Submit a FuzzJob json file to a running server and print its job id.
    Submit {
        job: PathBuf,
        /// Monitor address of the server.
        #[structopt(long, default_value = "127.0.0.1:7878")]
        server: String,
    },
    /// Cancel a job on a running server.
    Cancel {
        id: String,
        #[structopt(long, default_value = "127.0.0.1:7878")]
        server: String,
    },
    /// Import a Postman collection or HAR log and print the normalized session.
    Import {
        file: PathBuf,
        /// Print the protocol-aware mutations of every request instead.
        #[structopt(long)]
        mutations: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("SANDFUZZ_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let config = Config {
        backend: settings.backend,
        container_runtime: settings.runtime,
        ..Config::default()
    };
    match settings.cmd {
        Command::Serve {
            workers,
            state_dir,
            monitor,
            no_monitor,
            tick_ms,
            poll_ms,
            max_attempts,
        } => serve(Config {
            workers,
            state_dir,
            monitor_addr: if no_monitor { None } else { Some(monitor) },
            monitor_tick: Duration::from_millis(tick_ms),
            poll_interval: Duration::from_millis(poll_ms),
            max_attempts,
            ..config
        }),
        Command::Run { job, crashes } => run_job(config, job, crashes),
        Command::Fuzz {
            code,
            language,
            inputs,
            timeout_ms,
        } => batch(config, code, language, inputs, timeout_ms),
        Command::Submit { job, server } => {
            let text =
                read_to_string(&job).with_context(|| format!("failed to read {}", job.display()))?;
            let job: FuzzJob = serde_json::from_str(&text).context("bad job file")?;
            job.validate().context("bad job")?;
            let reply = request(&server, &ClientMessage::Submit { job })?;
            println!("{}", reply.data["jobId"].as_str().unwrap_or_default());
            Ok(())
        }
        Command::Cancel { id, server } => {
            let reply = request(&server, &ClientMessage::Cancel { job_id: id })?;
            println!("{}", serde_json::to_string_pretty(&reply.data)?);
            Ok(())
        }
        Command::Import { file, mutations } => import_session(file, mutations),
    }
}

/// Sends one request to a running server and waits for its answer.
fn request(server: &str, msg: &ClientMessage) -> anyhow::Result<ServerMessage> {
    let stream =
        TcpStream::connect(server).with_context(|| format!("failed to connect to {}", server))?;
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    let mut w = stream.try_clone()?;
    writeln!(w, "{}", serde_json::to_string(msg)?)?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .context("no answer from server")?;
    if line.is_empty() {
        anyhow::bail!("server closed the connection");
    }
    let reply: ServerMessage = serde_json::from_str(&line).context("bad answer from server")?;
    if reply.kind == MessageKind::Error {
        anyhow::bail!("server error: {}", reply.data["message"]);
    }
    Ok(reply)
}

fn local_engine(config: &Config, crashes: Option<PathBuf>) -> anyhow::Result<FuzzEngine> {
    config.check().context("config error")?;
    let table = match crashes {
        Some(p) => CrashTable::open(p).context("failed to load crash table")?,
        None => CrashTable::in_memory(),
    };
    Ok(FuzzEngine::new(
        Arc::new(config.sandbox_backend()),
        Arc::new(table),
        Arc::new(Stats::new()),
        EngineSettings::default(),
    ))
}

fn run_job(config: Config, job: PathBuf, crashes: Option<PathBuf>) -> anyhow::Result<()> {
    let text = read_to_string(&job).with_context(|| format!("failed to read {}", job.display()))?;
    let job: FuzzJob = serde_json::from_str(&text).context("bad job file")?;
    job.validate().context("bad job")?;
    let engine = local_engine(&config, crashes)?;

    let stop = StopToken::new();
    setup_signal_handler(stop.clone()).context("failed to install signal handler")?;
    let report = fuzz::run_detached(&engine, &job, stop).context("fuzz job failed")?;
    if let Err(e) = engine.crashes().save() {
        log::warn!("failed to save crash table: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn batch(
    config: Config,
    code: PathBuf,
    language: Language,
    inputs: Vec<PathBuf>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let program =
        read_to_string(&code).with_context(|| format!("failed to read {}", code.display()))?;
    let inputs = inputs
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("failed to read {}", p.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let engine = local_engine(&config, None)?;
    let opts = ExecOptions {
        timeout_ms,
        ..ExecOptions::default()
    };
    let report = engine.fuzz(&program, language, &inputs, &opts);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn import_session(file: PathBuf, mutations: bool) -> anyhow::Result<()> {
    let session =
        import::load(&file).with_context(|| format!("failed to import {}", file.display()))?;
    log::info!(
        "{:?} session '{}': {} requests",
        session.format,
        session.name,
        session.requests.len()
    );
    if !mutations {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }
    for req in session.requests.iter() {
        for m in mutate_all(req) {
            println!("{}", serde_json::to_string(&m)?);
        }
    }
    Ok(())
}
