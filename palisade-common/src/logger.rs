//! `tracing` setup for the enrolment binary and for tests.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// What gets logged when `RUST_LOG` says nothing: INFO and louder.
const DEFAULT_LEVEL: Level = Level::INFO;

/// Install the process-wide logger: a compact, colored stdout layer,
/// filtered by `RUST_LOG` target directives when the variable is set and
/// parseable, at [`DEFAULT_LEVEL`] otherwise.
///
/// Panics if a global logger is already installed. Binaries call this
/// exactly once, first thing in `main`.
pub fn init() {
    try_init().expect("A global logger was already installed");
}

/// Logger setup for tests, where many test threads race to install the
/// one global subscriber and most runs want no output at all: does
/// nothing unless `RUST_LOG` is set, and silently loses the install race
/// when another test won it.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Fallible [`init`]: `Err` when a global logger already exists.
pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|directives| Targets::from_str(&directives).ok())
        .unwrap_or_else(|| Targets::new().with_default(DEFAULT_LEVEL));

    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout).try_init()
}
