use std::{env, time::Duration};

use crate::fallback::ConnectivityProfile;

const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
const FULL_CANDIDATE_POOL: u8 = 10;
const REDUCED_CANDIDATE_POOL: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Transport settings a negotiation link is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSettings {
    pub profile: ConnectivityProfile,
    pub ice_servers: Vec<IceServer>,
    /// Candidates gathered ahead of the offer. Zero disables pre-gathering.
    pub candidate_pool_size: u8,
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub probe_delay: Duration,
    pub heartbeat_interval: Duration,
    pub stun_urls: Vec<String>,
    pub turn: Option<IceServer>,
    /// Skip all STUN/TURN servers; host candidates only.
    pub localhost_only: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            max_retries: 5,
            probe_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
            turn: None,
            localhost_only: false,
        }
    }
}

impl NegotiationConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            env::var(key)
                .ok()
                .and_then(|val| val.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        let turn = env::var("CALL_TURN_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| IceServer {
                urls: vec![url],
                username: env::var("CALL_TURN_USERNAME").unwrap_or_default(),
                credential: env::var("CALL_TURN_CREDENTIAL").unwrap_or_default(),
            });

        let stun_urls = env::var("CALL_STUN_URLS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| defaults.stun_urls.clone());

        Self {
            retry_delay: millis("CALL_RETRY_DELAY_MS", defaults.retry_delay),
            max_retries: env::var("CALL_MAX_RETRIES")
                .ok()
                .and_then(|val| val.parse().ok())
                .filter(|max: &u32| *max > 0)
                .unwrap_or(defaults.max_retries),
            probe_delay: millis("CALL_PROBE_DELAY_MS", defaults.probe_delay),
            stun_urls,
            turn,
            localhost_only: env::var("CALL_LOCALHOST_ONLY")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ..defaults
        }
    }

    /// Builds link settings for a traversal profile.
    ///
    /// `Full` offers every STUN server plus TURN and pre-gathers a large
    /// candidate pool. `Reduced` keeps direct-path discovery (STUN only) with a
    /// smaller pool. `Minimal` offers a single STUN server and gathers nothing
    /// ahead of the offer.
    pub fn settings_for(&self, profile: ConnectivityProfile) -> ProfileSettings {
        if self.localhost_only {
            return ProfileSettings {
                profile,
                ice_servers: Vec::new(),
                candidate_pool_size: 0,
            };
        }

        let stun = self.stun_urls.iter().map(IceServer::stun);
        let (ice_servers, candidate_pool_size) = match profile {
            ConnectivityProfile::Full => {
                let servers = stun.chain(self.turn.iter().cloned()).collect();
                (servers, FULL_CANDIDATE_POOL)
            }
            ConnectivityProfile::Reduced => (stun.collect(), REDUCED_CANDIDATE_POOL),
            ConnectivityProfile::Minimal => (stun.take(1).collect(), 0),
        };

        ProfileSettings {
            profile,
            ice_servers,
            candidate_pool_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_turn() -> NegotiationConfig {
        NegotiationConfig {
            turn: Some(IceServer {
                urls: vec!["turn:turn.example.org:3478".into()],
                username: "clinic".into(),
                credential: "secret".into(),
            }),
            ..NegotiationConfig::default()
        }
    }

    #[test_timeout::timeout]
    fn profiles_narrow_the_candidate_set() {
        let config = with_turn();

        let full = config.settings_for(ConnectivityProfile::Full);
        assert_eq!(full.ice_servers.len(), 3);
        assert!(full.ice_servers.iter().any(|s| s.username == "clinic"));
        assert_eq!(full.candidate_pool_size, FULL_CANDIDATE_POOL);

        let reduced = config.settings_for(ConnectivityProfile::Reduced);
        assert_eq!(
            reduced.ice_servers,
            DEFAULT_STUN_URLS.iter().map(|url| IceServer::stun(*url)).collect::<Vec<_>>()
        );
        assert!(reduced.candidate_pool_size > 0);
        assert!(reduced.candidate_pool_size < full.candidate_pool_size);

        let minimal = config.settings_for(ConnectivityProfile::Minimal);
        assert_eq!(minimal.ice_servers, vec![IceServer::stun(DEFAULT_STUN_URLS[0])]);
        assert_eq!(minimal.candidate_pool_size, 0);
    }

    #[test_timeout::timeout]
    fn localhost_only_has_no_servers() {
        let config = NegotiationConfig {
            localhost_only: true,
            ..with_turn()
        };
        let settings = config.settings_for(ConnectivityProfile::Full);
        assert!(settings.ice_servers.is_empty());
        assert_eq!(settings.candidate_pool_size, 0);
    }

    #[test_timeout::timeout]
    fn full_profile_without_turn_uses_stun_only() {
        let config = NegotiationConfig::default();
        let settings = config.settings_for(ConnectivityProfile::Full);
        assert_eq!(settings.ice_servers.len(), DEFAULT_STUN_URLS.len());
        assert!(settings.ice_servers.iter().all(|s| s.username.is_empty()));
    }
}
