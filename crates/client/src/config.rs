use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

/// Scope used in storage keys when no user id is configured.
pub const ANONYMOUS_SCOPE: &str = "anonymous";

/// Default prefix of every storage key.
pub const DEFAULT_PREFIX: &str = "crosstab";

/// Source of wall-clock time in milliseconds since the UNIX epoch.
///
/// Heartbeats written by different tabs are compared with each other, so every
/// tab sharing a store must use clocks that agree.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Current time in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> u64;
}

/// The operating system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        system_millis()
    }
}

/// A wall clock that advances with tokio's clock.
///
/// Anchored to the system time at creation, it follows `tokio::time::Instant`
/// afterwards, so it moves with paused and auto-advanced test time.
#[derive(Clone, Debug)]
pub struct TokioClock {
    origin_millis: u64,
    origin: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioClock {
    /// Creates a clock anchored at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin_millis: system_millis(),
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis
            .saturating_add(millis(self.origin.elapsed()))
    }
}

fn system_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, millis)
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration for the `CrossTabClient`.
#[derive(Clone, Debug)]
pub struct CrossTabConfig {
    /// Address of the remote peer the leading tab's node connects to.
    pub server: String,

    /// Protocol version spoken with the remote peer.
    pub subprotocol: String,

    /// Identity of the user. Tabs of different users never see each other.
    pub user_id: Option<String>,

    /// Prefix of every storage key.
    pub prefix: String,

    /// Fixed tab id. A random one is generated when `None`.
    pub tab_id: Option<String>,

    /// Minimum time a candidate waits before claiming leadership.
    pub election_delay: Duration,

    /// How often the leader refreshes the leader record.
    pub leader_ping: Duration,

    /// Age after which a leader record is considered abandoned.
    pub leader_timeout: Duration,

    /// Base period of the follower's leader recheck.
    pub role_timeout: Duration,

    /// Upper bound of the random jitter added to election and recheck timers.
    pub role_jitter: Duration,

    /// How often a tab refreshes its own heartbeat.
    pub tab_ping: Duration,

    /// Age after which a tab heartbeat is considered abandoned.
    pub tab_timeout: Duration,

    /// Seed for the jitter generator. Random when `None`.
    pub rng_seed: Option<u64>,

    /// Wall clock used for every heartbeat.
    pub clock: Arc<dyn Clock>,
}

impl Default for CrossTabConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            subprotocol: String::new(),
            user_id: None,
            prefix: DEFAULT_PREFIX.to_string(),
            tab_id: None,
            election_delay: Duration::from_secs(1),
            leader_ping: Duration::from_secs(2),
            leader_timeout: Duration::from_secs(5),
            role_timeout: Duration::from_secs(3),
            role_jitter: Duration::from_secs(1),
            tab_ping: Duration::from_secs(60),
            tab_timeout: Duration::from_secs(10 * 60),
            rng_seed: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl CrossTabConfig {
    /// Creates a configuration for `server` speaking `subprotocol`, with
    /// every other setting at its default.
    pub fn new<S: Into<String>, P: Into<String>>(server: S, subprotocol: P) -> Self {
        Self {
            server: server.into(),
            subprotocol: subprotocol.into(),
            ..Self::default()
        }
    }

    /// The scope of shared keys: the user id, or [`ANONYMOUS_SCOPE`].
    #[must_use]
    pub fn scope(&self) -> &str {
        self.user_id.as_deref().unwrap_or(ANONYMOUS_SCOPE)
    }
}

/// Durations the tab actually runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Timing {
    pub election_delay: Duration,
    pub leader_ping: Duration,
    pub leader_timeout: Duration,
    pub role_timeout: Duration,
    pub role_jitter: Duration,
    pub tab_ping: Duration,
    pub tab_timeout: Duration,
}

impl Timing {
    /// Heartbeats must be refreshed strictly faster than peers declare them
    /// stale. Misconfigured intervals are pulled down to half the timeout.
    pub fn from_config(config: &CrossTabConfig) -> Self {
        let mut leader_ping = config.leader_ping;
        if leader_ping.is_zero() || leader_ping >= config.leader_timeout {
            leader_ping = config.leader_timeout / 2;
            warn!(
                configured = ?config.leader_ping,
                leader_timeout = ?config.leader_timeout,
                "leader ping must be shorter than leader timeout, using {leader_ping:?}"
            );
        }

        let mut tab_ping = config.tab_ping;
        if tab_ping.is_zero() || tab_ping >= config.tab_timeout {
            tab_ping = config.tab_timeout / 2;
            warn!(
                configured = ?config.tab_ping,
                tab_timeout = ?config.tab_timeout,
                "tab ping must be shorter than tab timeout, using {tab_ping:?}"
            );
        }

        Self {
            election_delay: config.election_delay,
            leader_ping: leader_ping.max(Duration::from_millis(1)),
            leader_timeout: config.leader_timeout,
            role_timeout: config.role_timeout,
            role_jitter: config.role_jitter,
            tab_ping: tab_ping.max(Duration::from_millis(1)),
            tab_timeout: config.tab_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_defaults_to_anonymous() {
        let mut config = CrossTabConfig::new("wss://localhost:1337", "1.0.0");
        assert_eq!(config.scope(), ANONYMOUS_SCOPE);
        assert_eq!(config.subprotocol, "1.0.0");

        config.user_id = Some("10".into());
        assert_eq!(config.scope(), "10");
    }

    #[test]
    fn test_defaults_keep_pings_under_timeouts() {
        let timing = Timing::from_config(&CrossTabConfig::default());

        assert!(timing.leader_ping < timing.leader_timeout);
        assert!(timing.tab_ping < timing.tab_timeout);
        assert_eq!(timing.election_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_misconfigured_pings_are_clamped() {
        let config = CrossTabConfig {
            leader_ping: Duration::from_secs(10),
            leader_timeout: Duration::from_secs(4),
            tab_ping: Duration::ZERO,
            tab_timeout: Duration::from_secs(60),
            ..CrossTabConfig::default()
        };

        let timing = Timing::from_config(&config);

        assert_eq!(timing.leader_ping, Duration::from_secs(2));
        assert_eq!(timing.tab_ping, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now_millis();

        tokio::time::advance(Duration::from_millis(1500)).await;

        assert_eq!(clock.now_millis() - before, 1500);
    }
}
