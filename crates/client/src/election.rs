//! The per-tab election state machine.
//!
//! Each role owns its timers. Swapping the phase drops the previous role's
//! timers and watchers in the same step, so a timer armed for one role can
//! never fire into another.

use std::fmt;
use std::future;
use std::pin::Pin;
use std::time::Duration;

use crosstab_node::NodeState;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};

use crate::config::{Timing, millis};

/// The part a tab currently plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Waiting to see whether some other tab leads.
    #[default]
    Candidate,

    /// Another tab leads; this one mirrors its state.
    Follower,

    /// This tab owns the connection to the remote peer.
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Candidate => "candidate",
            Self::Follower => "follower",
            Self::Leader => "leader",
        })
    }
}

/// The shared claim to leadership.
///
/// Encoded as `[owner, heartbeat]`, or `[]` when nobody leads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LeaderRecord {
    /// No tab claims leadership.
    #[default]
    Empty,

    /// `owner` claimed leadership, last confirmed at `heartbeat`.
    Claimed {
        /// Id of the leading tab.
        owner: String,

        /// Milliseconds since the UNIX epoch.
        heartbeat: u64,
    },
}

impl LeaderRecord {
    /// A claim by `owner` at `heartbeat`.
    pub fn claimed<O: Into<String>>(owner: O, heartbeat: u64) -> Self {
        Self::Claimed {
            owner: owner.into(),
            heartbeat,
        }
    }

    /// The claiming tab, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Claimed { owner, .. } => Some(owner),
        }
    }
}

impl Serialize for LeaderRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => serializer.serialize_seq(Some(0))?.end(),
            Self::Claimed { owner, heartbeat } => (owner, heartbeat).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for LeaderRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = LeaderRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an empty array or an [owner, heartbeat] pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LeaderRecord, A::Error> {
                let Some(owner) = seq.next_element::<String>()? else {
                    return Ok(LeaderRecord::Empty);
                };
                let heartbeat = seq
                    .next_element::<u64>()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;

                Ok(LeaderRecord::Claimed { owner, heartbeat })
            }
        }

        deserializer.deserialize_seq(RecordVisitor)
    }
}

/// What woke the election up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleEvent {
    /// The candidate's election delay ran out.
    ElectionDue,

    /// The follower should make sure its leader is still alive.
    RecheckDue,

    /// The leader should refresh its claim.
    PingDue,

    /// The leader's node changed state.
    NodeState(NodeState),
}

enum Phase {
    Idle,
    Candidate {
        election: Pin<Box<Sleep>>,
    },
    Follower {
        recheck: Pin<Box<Sleep>>,
    },
    Leader {
        ping: Interval,
        node_state: Option<watch::Receiver<NodeState>>,
        last_ping: u64,
    },
}

/// Role bookkeeping and timers of a single tab.
pub struct Election {
    tab_id: String,
    timing: Timing,
    rng: fastrand::Rng,
    role_timeout: Duration,
    phase: Phase,
}

impl fmt::Debug for Election {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Election")
            .field("tab_id", &self.tab_id)
            .field("role", &self.role())
            .field("role_timeout", &self.role_timeout)
            .finish_non_exhaustive()
    }
}

impl Election {
    /// Creates an idle election. Jitter comes from `seed` when given.
    pub fn new(tab_id: String, timing: Timing, seed: Option<u64>) -> Self {
        let mut rng = seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
        let role_timeout = timing.role_timeout + jitter(&mut rng, timing.role_jitter);

        Self {
            tab_id,
            timing,
            rng,
            role_timeout,
            phase: Phase::Idle,
        }
    }

    /// The current role. An idle election counts as a candidate.
    pub const fn role(&self) -> Role {
        match self.phase {
            Phase::Idle | Phase::Candidate { .. } => Role::Candidate,
            Phase::Follower { .. } => Role::Follower,
            Phase::Leader { .. } => Role::Leader,
        }
    }

    /// This tab's first jittered role timeout.
    pub const fn role_timeout(&self) -> Duration {
        self.role_timeout
    }

    /// Whether `record` holds a claim younger than the leader timeout.
    pub fn is_live(&self, record: &LeaderRecord, now: u64) -> bool {
        match record {
            LeaderRecord::Empty => false,
            LeaderRecord::Claimed { heartbeat, .. } => {
                now.saturating_sub(*heartbeat) <= millis(self.timing.leader_timeout)
            }
        }
    }

    /// Whether `record` is a claim by some other tab.
    pub fn is_foreign(&self, record: &LeaderRecord) -> bool {
        record.owner().is_some_and(|owner| owner != self.tab_id)
    }

    /// Arms the election delay.
    pub fn become_candidate(&mut self) {
        let delay = self.timing.election_delay + self.draw();
        self.phase = Phase::Candidate {
            election: Box::pin(sleep(delay)),
        };
    }

    /// Arms the leader recheck.
    pub fn become_follower(&mut self) {
        let recheck = self.timing.role_timeout + self.draw();
        self.phase = Phase::Follower {
            recheck: Box::pin(sleep(recheck)),
        };
    }

    /// Starts pinging. The claim written at `now` counts as the first ping.
    pub fn become_leader(&mut self, node_state: watch::Receiver<NodeState>, now: u64) {
        let period = self.timing.leader_ping;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.phase = Phase::Leader {
            ping,
            node_state: Some(node_state),
            last_ping: now,
        };
    }

    /// Pushes the follower's recheck out by a freshly drawn timeout.
    pub fn rearm_recheck(&mut self) {
        let deadline = Instant::now() + self.timing.role_timeout + self.draw();
        if let Phase::Follower { recheck } = &mut self.phase {
            recheck.as_mut().reset(deadline);
        }
    }

    /// Remembers when the leader last wrote its claim.
    pub fn record_ping(&mut self, now: u64) {
        if let Phase::Leader { last_ping, .. } = &mut self.phase {
            *last_ping = now;
        }
    }

    /// When the leader last wrote its claim.
    pub const fn last_ping(&self) -> Option<u64> {
        match self.phase {
            Phase::Leader { last_ping, .. } => Some(last_ping),
            _ => None,
        }
    }

    /// Drops every timer and watcher.
    pub fn stop(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Waits for the current role's next timer or watcher event.
    ///
    /// Cancel safe. Never resolves while idle.
    pub async fn next_event(&mut self) -> RoleEvent {
        match &mut self.phase {
            Phase::Idle => future::pending().await,
            Phase::Candidate { election } => {
                election.as_mut().await;
                RoleEvent::ElectionDue
            }
            Phase::Follower { recheck } => {
                recheck.as_mut().await;
                RoleEvent::RecheckDue
            }
            Phase::Leader {
                ping, node_state, ..
            } => {
                tokio::select! {
                    _ = ping.tick() => RoleEvent::PingDue,
                    Some(state) = watch_next(node_state) => RoleEvent::NodeState(state),
                }
            }
        }
    }

    fn draw(&mut self) -> Duration {
        jitter(&mut self.rng, self.timing.role_jitter)
    }
}

fn jitter(rng: &mut fastrand::Rng, max: Duration) -> Duration {
    let max_micros = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
    if max_micros == 0 {
        return Duration::ZERO;
    }

    Duration::from_micros(rng.u64(0..=max_micros))
}

async fn watch_next(receiver: &mut Option<watch::Receiver<NodeState>>) -> Option<NodeState> {
    let Some(watcher) = receiver.as_mut() else {
        return future::pending().await;
    };

    match watcher.changed().await {
        Ok(()) => Some(*watcher.borrow_and_update()),
        Err(_) => {
            // The node is gone, stop listening.
            *receiver = None;
            None
        }
    }
}
