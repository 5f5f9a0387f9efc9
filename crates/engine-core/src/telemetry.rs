use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Registry, filter, fmt, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

/// Installs the process-wide `tracing` subscriber. `LOG_FORMAT=json` selects structured output;
/// otherwise a compact human-readable formatter is used. Filtering is controlled by `RUST_LOG`.
pub fn setup_logging() {
	Lazy::force(&APPLICATION_START_TIME);
	let use_json = env::var("LOG_FORMAT").unwrap_or_else(|_| "plain".to_string()) == "json";
	let filter = default_filter();
	let (layer, reload) = reload::Layer::new(base_layer(use_json).with_filter(filter));
	LOG_HANDLE
		.set(reload)
		.unwrap_or_else(|_| warn!("logging already initialized"));
	tracing_subscriber::registry().with(layer).init();
}

type BoxLayer = Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, filter::Targets, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

fn base_layer(json: bool) -> BoxLayer {
	if json {
		Box::new(fmt::layer().json().with_target(true))
	} else {
		Box::new(fmt::layer().with_target(true))
	}
}

fn default_filter() -> filter::Targets {
	let var = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
	filter::Targets::from_str(&var).expect("RUST_LOG must be a valid filter directive")
}

/// Dynamically updates the log level. If `reset` is set, replaces the whole filter rather than
/// layering the new directive on top of the current one.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let Some(handle) = LOG_HANDLE.get() else {
		return Err(Error::Uninitialized);
	};
	let current = handle
		.with_current(|f| f.filter().to_string())
		.unwrap_or_default();
	let new_directive = if reset {
		if level.is_empty() {
			default_filter().to_string()
		} else {
			format!("{},{}", default_filter(), level)
		}
	} else {
		format!("{current},{level}")
	};
	let new_filter = filter::Targets::from_str(&new_directive)?;
	handle.modify(|layer| *layer.filter_mut() = new_filter)?;
	Ok(())
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("invalid filter: {0}")]
	InvalidFilter(#[from] filter::ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}
