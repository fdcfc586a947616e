//! Log output for the scheduler binary.
//!
//! `PROCESSOR_LOG_FORMAT` picks `text` or `json`. When unset, `PROCESSOR_DEBUG=true` selects text
//! at debug level and anything else selects JSON at info level. `RUST_LOG` narrows either.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const ENV_LOG_FORMAT: &str = "PROCESSOR_LOG_FORMAT";
const ENV_DEBUG: &str = "PROCESSOR_DEBUG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    format: LogFormat,
    level: Level,
}

impl LogSettings {
    fn from_vars(vars: &HashMap<String, String>) -> Self {
        let debug = vars
            .get(ENV_DEBUG)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let format = match vars.get(ENV_LOG_FORMAT).map(|v| v.to_ascii_lowercase()) {
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            _ if debug => LogFormat::Text,
            _ => LogFormat::Json,
        };
        let level = if debug { Level::DEBUG } else { Level::INFO };
        Self { format, level }
    }

    fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        match self.format {
            LogFormat::Text => fmt::layer().with_target(true).boxed(),
            LogFormat::Json => fmt::layer()
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .boxed(),
        }
    }
}

fn panic_message<'a>(info: &'a PanicHookInfo<'_>) -> &'a str {
    let payload = info.payload();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Panics become a single error record with the location as fields.
fn log_panic(info: &PanicHookInfo<'_>) {
    let message = panic_message(info);
    let (file, line) = info
        .location()
        .map_or(("<unknown>", 0), |l| (l.file(), l.line()));
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");

    // RUST_BACKTRACE decides whether this is captured
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        tracing::error!(file, line, thread, %backtrace, "panic: {message}");
    } else {
        tracing::error!(file, line, thread, "panic: {message}");
    }
}

pub fn register() {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let settings = LogSettings::from_vars(&vars);

    let filter = EnvFilter::builder()
        .with_default_directive(settings.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(settings.layer())
        .with(filter)
        .init();

    std::panic::set_hook(Box::new(log_panic));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_to_json_at_info() {
        let settings = LogSettings::from_vars(&HashMap::new());
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, Level::INFO);
    }

    #[test]
    fn test_debug_switches_to_text() {
        let settings = LogSettings::from_vars(&vars(&[(ENV_DEBUG, "TRUE")]));
        assert_eq!(settings.format, LogFormat::Text);
        assert_eq!(settings.level, Level::DEBUG);
    }

    #[test]
    fn test_explicit_format_wins_over_debug() {
        let settings =
            LogSettings::from_vars(&vars(&[(ENV_DEBUG, "true"), (ENV_LOG_FORMAT, "json")]));
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.level, Level::DEBUG);

        let settings = LogSettings::from_vars(&vars(&[(ENV_LOG_FORMAT, "Text")]));
        assert_eq!(settings.format, LogFormat::Text);
        assert_eq!(settings.level, Level::INFO);
    }

    #[test]
    fn test_unknown_format_falls_back() {
        let settings = LogSettings::from_vars(&vars(&[(ENV_LOG_FORMAT, "xml")]));
        assert_eq!(settings.format, LogFormat::Json);
    }
}
