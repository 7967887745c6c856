//! Logging setup for the gateway daemon.
//!
//! The daemon calls [`init_journald_or_stdout`] once at startup. Library code
//! only emits events, through `use crate::tracing::prelude::*`.
//!
//! Two dedicated targets exist so operators can route them separately with
//! `RUST_LOG`: [`AUDIT_TARGET`] for mutating commands and [`TRAFFIC_TARGET`]
//! for raw request/response lines.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Target for audit trail events.
pub const AUDIT_TARGET: &str = "julabo::audit";

/// Target for wire traffic events (emitted at TRACE).
pub const TRAFFIC_TARGET: &str = "julabo::traffic";

/// Install a journald subscriber under systemd, stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer.with_syslog_identifier("julabod".to_string()))
                    .init();
            }
            Err(e) => {
                use_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        use_stdout();
    }
}

// RUST_LOG wins; otherwise INFO.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Local time, to the second. Lab operators correlate log lines with the
// wall clock on the bench, not with UTC.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{formatted}")
    }
}
