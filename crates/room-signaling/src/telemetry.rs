use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::SignalingConfig;

/// Install the global subscriber. Returns `false` if one was already set,
/// which lets every test call this freely.
pub fn init_tracing(filter: &str) -> bool {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default()
        .with(build_filter(filter))
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

/// [`init_tracing`] with the filter carried by `config` (`RUST_LOG` when
/// loaded through [`SignalingConfig::from_env`]).
pub fn init_tracing_from(config: &SignalingConfig) -> bool {
    init_tracing(&config.log_filter)
}

fn build_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_filter_is_used() {
        let config = SignalingConfig {
            log_filter: "warn,room_signaling=trace".into(),
            ..SignalingConfig::default()
        };
        let filter = build_filter(&config.log_filter).to_string();
        assert!(filter.contains("room_signaling=trace"), "{filter}");
    }

    #[test]
    fn malformed_filter_falls_back_to_info() {
        assert_eq!(build_filter("room_signaling=loudest").to_string(), "info");
    }

    #[test]
    fn second_install_is_refused() {
        init_tracing_from(&SignalingConfig::default());
        assert!(!init_tracing("debug"));
    }
}
