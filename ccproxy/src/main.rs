//! CCProxy binary entry point: `start` / `stop` / `status` / `version`.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use ccproxy::config::Config;
use ccproxy::process::{self, ProcessGuard};
use ccproxy::server::create_server;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Directory holding the PID file, lock files, and reference count.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proxy, refusing to run alongside an already-running instance.
    Start,
    /// Gracefully stop a running instance, force-killing after the timeout.
    Stop {
        #[arg(long, default_value_t = 30)]
        shutdown_timeout_secs: u64,
    },
    /// Print whether an instance is running and its PID.
    Status,
    /// Print the binary's version.
    Version,
}

fn default_home() -> PathBuf {
    dirs_home().join(".ccproxy")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let home = args.home.clone().unwrap_or_else(default_home);

    let exit_code = match args.command {
        Command::Start => run_start(&args.config, &home).await,
        Command::Stop { shutdown_timeout_secs } => {
            run_stop(&home, Duration::from_secs(shutdown_timeout_secs)).await
        }
        Command::Status => run_status(&home),
        Command::Version => {
            println!("ccproxy {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };

    std::process::exit(exit_code);
}

async fn run_start(config_path: &str, home: &PathBuf) -> i32 {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };

    tracing_subscriber::fmt().with_env_filter(&config.log).init();

    let guard = match ProcessGuard::acquire(home.clone()) {
        Ok(guard) => guard,
        Err(process::ProcessError::AlreadyRunning(pid)) => {
            eprintln!("ccproxy is already running with PID {pid}");
            return 2;
        }
        Err(err) => {
            eprintln!("failed to acquire process lock: {err}");
            return 1;
        }
    };

    let host = config.host.clone();
    let port = config.port;

    let app = match create_server(config).await {
        Ok(app) => app,
        Err(err) => {
            eprintln!("failed to build server: {err}");
            return 1;
        }
    };

    let addr = match format!("{host}:{port}").parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid host/port: {err}");
            return 1;
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {addr}: {err}");
            return 1;
        }
    };

    tracing::info!("ccproxy listening on {addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    drop(guard);

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("server error: {err}");
            1
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_stop(home: &PathBuf, shutdown_timeout: Duration) -> i32 {
    let Some(pid) = process::read_pid(home) else {
        eprintln!("no running instance found");
        return 3;
    };

    match process::graceful_shutdown(pid, shutdown_timeout).await {
        Ok(()) => 0,
        Err(process::ProcessError::NotRunning) => {
            eprintln!("no running instance found");
            3
        }
        Err(err) => {
            eprintln!("failed to stop: {err}");
            1
        }
    }
}

fn run_status(home: &PathBuf) -> i32 {
    match process::read_pid(home) {
        Some(pid) if process::is_alive(pid) => {
            println!("running (PID {pid})");
            0
        }
        Some(pid) => {
            println!("stale PID file (PID {pid} not alive)");
            3
        }
        None => {
            println!("not running");
            3
        }
    }
}
