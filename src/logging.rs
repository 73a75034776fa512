//! Tracing setup for `oraboard`.
//!
//! Observer components tag their lines with a bracketed component name
//! (`[scanner]`, `[watcher#3]`, `[pipeline]`) through [`log_event!`] and
//! [`debug_event!`]. Output goes to stderr so `oraboard watch --json` can
//! own stdout.
//!
//! Levels come from the `[logging]` settings section unless `RUST_LOG` is
//! set:
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! "oraboard::observer::pipeline" = "debug"
//! ```
//!
//! ```bash
//! RUST_LOG=oraboard::observer=trace oraboard watch --shared-fs
//! ```

use std::sync::Once;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static SUBSCRIBER: Once = Once::new();

/// Wall-clock time of day with milliseconds.
struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// `default,module=level,...` as understood by [`EnvFilter`].
fn filter_directives(config: &LoggingConfig) -> String {
    config
        .modules
        .iter()
        .fold(config.default.clone(), |mut directives, (module, level)| {
            directives.push_str(&format!(",{module}={level}"));
            directives
        })
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(filter_directives(config)),
    }
}

/// Install the stderr subscriber for `config`.
///
/// The first call in a process wins. Tests may call this repeatedly, and a
/// subscriber installed by someone else is left alone.
pub fn init_with_config(config: &LoggingConfig) {
    SUBSCRIBER.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(ClockTime)
            .with_target(true)
            .with_filter(env_filter(config));

        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// [`init_with_config`] with default levels.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Info line tagged with an observer component.
///
/// ```ignore
/// log_event!("scanner", "found", "{}", name);
/// log_event!("observer", "shutting down");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Debug counterpart of [`log_event!`].
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_filter_directives_include_module_overrides() {
        let mut modules = BTreeMap::new();
        modules.insert("oraboard::observer".to_string(), "debug".to_string());
        modules.insert("oraboard::convert".to_string(), "trace".to_string());
        let config = LoggingConfig {
            default: "warn".to_string(),
            modules,
        };

        assert_eq!(
            filter_directives(&config),
            "warn,oraboard::convert=trace,oraboard::observer=debug"
        );
    }

    #[test]
    fn test_default_directives_are_just_the_level() {
        assert_eq!(filter_directives(&LoggingConfig::default()), "info");
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
