//! `gns3-proxy` binary entry point (§6): parses CLI flags, loads the INI
//! configuration snapshot, binds the listener, and runs the accept loop
//! until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gns3_proxy::acceptor::Acceptor;
use gns3_proxy::config;
use gns3_proxy::metrics::Metrics;

const DEFAULT_CONFIG_PATH: &str = "./gns3_proxy_config.ini";

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevel {
	Debug,
	Info,
	Warning,
	Error,
	Critical,
}

impl LogLevel {
	/// Maps the five config-file-style levels onto `tracing`'s four;
	/// `CRITICAL` has no direct `tracing` equivalent so it collapses to
	/// `ERROR`.
	fn as_filter(&self) -> &'static str {
		match self {
			LogLevel::Debug => "debug",
			LogLevel::Info => "info",
			LogLevel::Warning => "warn",
			LogLevel::Error | LogLevel::Critical => "error",
		}
	}
}

#[derive(Parser, Debug)]
#[command(name = "gns3-proxy", version, about = "Authenticating, filtering reverse proxy for GNS3 backends")]
struct Args {
	/// Path to the INI configuration file.
	#[arg(long = "config-file", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
	config_file: String,

	/// Overrides the log verbosity; falls back to the config file's
	/// `log_level` when omitted.
	#[arg(long = "log-level", value_enum)]
	log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();

	let config = match config::load_from_file(&args.config_file) {
		Ok(config) => config,
		Err(err) => {
			init_tracing(args.log_level.unwrap_or(LogLevel::Info).as_filter());
			error!(error = %err, path = %args.config_file, "failed to load configuration");
			return ExitCode::from(1);
		},
	};

	let filter = args
		.log_level
		.map(|l| l.as_filter().to_string())
		.unwrap_or_else(|| config.log_level.to_ascii_lowercase());
	init_tracing(&filter);

	let mut registry = Registry::default();
	let metrics = Arc::new(Metrics::new(gns3_proxy::metrics::sub_registry(&mut registry)));
	let config = Arc::new(config);

	let acceptor = match Acceptor::bind(config, metrics).await {
		Ok(acceptor) => acceptor,
		Err(err) => {
			error!(error = %err, "failed to bind listener");
			return ExitCode::from(2);
		},
	};

	let shutdown = CancellationToken::new();
	let signal_token = shutdown.clone();
	tokio::spawn(async move {
		wait_for_shutdown_signal().await;
		info!("shutdown signal received");
		signal_token.cancel();
	});

	acceptor.run(shutdown).await;
	info!("clean shutdown");
	ExitCode::from(0)
}

fn init_tracing(filter: &str) {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.try_init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
	tokio::select! {
		_ = sigterm.recv() => {},
		_ = sigint.recv() => {},
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
