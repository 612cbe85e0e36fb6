use std::time::Duration;

/// Tunables for channel lifecycle, negotiation retry budgets and notice dedup.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// How long a channel connect may wait for any lifecycle signal.
    pub connect_timeout: Duration,
    /// Interval of the low-level joined-flag poll that runs beside the status listener.
    pub join_poll_interval: Duration,
    /// Hard cap on derived channel names.
    pub max_channel_name_len: usize,
    /// Answer attempts allowed per peer link before failing fast.
    pub answer_attempt_limit: u32,
    /// Connection constructions allowed per remote identity.
    pub creation_attempt_limit: u32,
    /// Window within which identical system notices collapse into one.
    pub notice_dedup_window: Duration,
    /// Delay before the bitrate cap is applied to a freshly created link.
    pub bitrate_grace: Duration,
    pub video_bitrate_cap_bps: u64,
    /// Broadcast `user-joined` after a room channel subscribes.
    pub announce_presence: bool,
    /// Start an offer towards a participant announcing itself.
    pub offer_on_peer_joined: bool,
    pub log_filter: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            join_poll_interval: Duration::from_millis(500),
            max_channel_name_len: 200,
            answer_attempt_limit: 3,
            creation_attempt_limit: 5,
            notice_dedup_window: Duration::from_secs(10),
            bitrate_grace: Duration::from_millis(100),
            video_bitrate_cap_bps: 1_000_000,
            announce_presence: true,
            offer_on_peer_joined: true,
            log_filter: "info,room_signaling=debug".into(),
        }
    }
}

impl SignalingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: env_millis("ROOM_SIGNALING_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            join_poll_interval: env_millis("ROOM_SIGNALING_JOIN_POLL_MS")
                .unwrap_or(defaults.join_poll_interval),
            max_channel_name_len: defaults.max_channel_name_len,
            answer_attempt_limit: env_parse("ROOM_SIGNALING_ANSWER_ATTEMPTS")
                .unwrap_or(defaults.answer_attempt_limit),
            creation_attempt_limit: env_parse("ROOM_SIGNALING_CREATION_ATTEMPTS")
                .unwrap_or(defaults.creation_attempt_limit),
            notice_dedup_window: env_millis("ROOM_SIGNALING_NOTICE_WINDOW_MS")
                .unwrap_or(defaults.notice_dedup_window),
            bitrate_grace: env_millis("ROOM_SIGNALING_BITRATE_GRACE_MS")
                .unwrap_or(defaults.bitrate_grace),
            video_bitrate_cap_bps: env_parse("ROOM_SIGNALING_VIDEO_BITRATE_BPS")
                .unwrap_or(defaults.video_bitrate_cap_bps),
            announce_presence: env_flag("ROOM_SIGNALING_ANNOUNCE")
                .unwrap_or(defaults.announce_presence),
            offer_on_peer_joined: env_flag("ROOM_SIGNALING_AUTO_OFFER")
                .unwrap_or(defaults.offer_on_peer_joined),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(defaults.log_filter),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SignalingConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.join_poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_channel_name_len, 200);
        assert_eq!(config.answer_attempt_limit, 3);
        assert_eq!(config.creation_attempt_limit, 5);
        assert_eq!(config.notice_dedup_window, Duration::from_secs(10));
    }

    #[test]
    fn env_overrides_are_read() {
        unsafe {
            std::env::set_var("ROOM_SIGNALING_ANSWER_ATTEMPTS", "7");
            std::env::set_var("ROOM_SIGNALING_AUTO_OFFER", "off");
        }
        let config = SignalingConfig::from_env();
        assert_eq!(config.answer_attempt_limit, 7);
        assert!(!config.offer_on_peer_joined);
        unsafe {
            std::env::remove_var("ROOM_SIGNALING_ANSWER_ATTEMPTS");
            std::env::remove_var("ROOM_SIGNALING_AUTO_OFFER");
        }
    }
}
