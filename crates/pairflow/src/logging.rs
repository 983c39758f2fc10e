//! Tracing setup shared by the coordinator and worker processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with PAIRFLOW_LOG and LOG_FORMAT support.
///
/// Always writes to stderr: inside a producer worker, stdout is the channel.
/// `RUST_LOG` takes precedence over `PAIRFLOW_LOG` when set.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directive(std::env::var("PAIRFLOW_LOG").ok().as_deref()))
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

fn filter_directive(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        Some("off") => "off",
        _ => "info",
    };
    format!("pairflow={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(filter_directive(None), "pairflow=info");
        assert_eq!(filter_directive(Some("verbose")), "pairflow=info");
    }

    #[test]
    fn level_aliases() {
        assert_eq!(filter_directive(Some("warning")), "pairflow=warn");
        assert_eq!(filter_directive(Some("debug")), "pairflow=debug");
    }
}
