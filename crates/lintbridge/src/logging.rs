//! Tracing subscriber setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

pub const ENV_LOG: &str = "LINTBRIDGE_LOG";

/// Filter directives for a `LINTBRIDGE_LOG` value. Unknown values mean `info`.
fn filter_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("lintbridge={level},lintbridge_cli={level}")
}

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins if set. Otherwise `LINTBRIDGE_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a subscriber
/// is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(std::env::var(ENV_LOG).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives() {
        assert_eq!(
            filter_directives(None),
            "lintbridge=info,lintbridge_cli=info"
        );
        assert_eq!(
            filter_directives(Some("warning")),
            "lintbridge=warn,lintbridge_cli=warn"
        );
        assert_eq!(
            filter_directives(Some("debug")),
            "lintbridge=debug,lintbridge_cli=debug"
        );
        assert_eq!(
            filter_directives(Some("loud")),
            "lintbridge=info,lintbridge_cli=info"
        );
    }
}
