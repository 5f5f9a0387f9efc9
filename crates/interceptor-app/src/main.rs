//! CLI entry point: loads configuration, starts a session, and runs until a
//! shutdown signal arrives. Mirrors the teacher's app-crate split — the
//! binary only wires together config loading, logging, and signal handling;
//! everything else lives in the library crate.

use std::path::PathBuf;

use clap::Parser;
use interceptor::config::{Config, RawConfig};
use interceptor::session::Session;

#[derive(Parser, Debug)]
#[command(name = "interceptor", about = "HTTP/HTTPS/WebSocket interception proxy")]
struct Args {
	/// Path to a YAML configuration file. Without one, the engine starts with
	/// an empty rule set and CLI-supplied listener settings only.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Port to listen on. Overrides the config file's `port`.
	#[arg(short, long)]
	port: Option<u16>,

	/// Inclusive port range to auto-select from, formatted `start-end`.
	/// Overrides the config file's `port_range`. Ignored if `--port` is set.
	#[arg(long, value_parser = parse_port_range)]
	port_range: Option<(u16, u16)>,
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
	let (start, end) = s
		.split_once('-')
		.ok_or_else(|| format!("expected `start-end`, got `{s}`"))?;
	let start: u16 = start.parse().map_err(|_| format!("invalid start port `{start}`"))?;
	let end: u16 = end.parse().map_err(|_| format!("invalid end port `{end}`"))?;
	Ok((start, end))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	engine_core::telemetry::setup_logging();
	let args = Args::parse();

	let mut config = match &args.config {
		Some(path) => Config::from_yaml_file(path.clone())?,
		None => Config::resolve(RawConfig::default(), None),
	};
	if let Some(port) = args.port {
		config.port = Some(port);
		config.port_range = None;
	} else if let Some(range) = args.port_range {
		config.port_range = Some(range);
	}

	let session = Session::new(config)?;
	let listening = session.start().await?;
	tracing::info!(local_addr = %listening.local_addr(), "interceptor listening");

	engine_core::signal::Shutdown::new().wait().await;
	listening.stop().await;
	Ok(())
}
