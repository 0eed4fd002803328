//! The tab actor: a single task owning every piece of per-tab state.

use std::collections::BTreeSet;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use crosstab_log::{ActionLog, Entry, LogEvent};
use crosstab_node::{NodeState, SyncNode};
use crosstab_store::{SharedStore, StorageEvent};
use futures::FutureExt;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastChannel, decode};
use crate::client::ClientEvent;
use crate::config::Clock;
use crate::election::{Election, LeaderRecord, Role, RoleEvent};
use crate::keys::StorageKeys;
use crate::liveness::{Liveness, tab_reason};
use crate::mirror::{LogMirror, MutationRecord};

const EVENT_CAPACITY: usize = 256;

/// Requests from the facade to a running tab.
#[derive(Debug)]
pub enum Command {
    /// Stop, resigning leadership.
    Destroy(oneshot::Sender<()>),

    /// Stop, resigning leadership and releasing everything this tab owns.
    Unload(oneshot::Sender<()>),
}

/// Values the tab publishes for the facade to read.
#[derive(Debug)]
pub struct Projections {
    pub role: watch::Sender<Role>,
    pub state: watch::Sender<NodeState>,
    pub subscriptions: watch::Sender<Vec<crosstab_log::Action>>,
    pub events: broadcast::Sender<ClientEvent>,
}

impl Projections {
    pub fn new(state: NodeState) -> Self {
        Self {
            role: watch::Sender::new(Role::Candidate),
            state: watch::Sender::new(state),
            subscriptions: watch::Sender::new(Vec::new()),
            events: broadcast::Sender::new(EVENT_CAPACITY),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

/// Everything needed to build a [`Tab`].
pub struct TabParts<S: SharedStore, L: ActionLog, N: SyncNode> {
    pub id: String,
    pub keys: StorageKeys,
    pub channel: BroadcastChannel<S>,
    pub log: L,
    pub node: N,
    pub clock: Arc<dyn Clock>,
    pub election: Election,
    pub mirror: LogMirror,
    pub liveness: Liveness,
    pub tab_ping: Duration,
    pub projections: Arc<Projections>,
}

pub struct Tab<S: SharedStore, L: ActionLog, N: SyncNode> {
    id: String,
    keys: StorageKeys,
    channel: BroadcastChannel<S>,
    log: L,
    node: N,
    clock: Arc<dyn Clock>,
    election: Election,
    mirror: LogMirror,
    liveness: Liveness,
    tab_ping: Duration,
    projections: Arc<Projections>,
}

impl<S, L, N> Tab<S, L, N>
where
    S: SharedStore,
    L: ActionLog,
    N: SyncNode,
{
    pub fn new(parts: TabParts<S, L, N>) -> Self {
        let TabParts {
            id,
            keys,
            channel,
            log,
            node,
            clock,
            election,
            mirror,
            liveness,
            tab_ping,
            projections,
        } = parts;

        Self {
            id,
            keys,
            channel,
            log,
            node,
            clock,
            election,
            mirror,
            liveness,
            tab_ping,
            projections,
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Reclaims what dead tabs left behind and takes the initial role.
    pub async fn begin(&mut self) {
        if !self.channel.is_available() {
            info!(tab = %self.id, "no shared store, leading alone");
            self.become_leader().await;
            return;
        }

        self.refresh_heartbeat();
        self.reclaim_stale_tabs().await;

        let record = self.read_leader();
        if self.election.is_live(&record, self.now()) && self.election.is_foreign(&record) {
            self.become_follower().await;
        } else {
            self.become_candidate();
        }
    }

    /// Runs until told to stop or until the facade goes away.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut storage: Option<BoxStream<'static, StorageEvent>>,
        mut log_events: BoxStream<'static, LogEvent>,
    ) {
        let mut tab_ping = interval_at(Instant::now() + self.tab_ping, self.tab_ping);
        tab_ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Destroy(done)) => {
                            self.shutdown().await;
                            let _ = done.send(());
                        }
                        Some(Command::Unload(done)) => {
                            self.unload(&mut log_events).await;
                            let _ = done.send(());
                        }
                        None => self.shutdown().await,
                    }
                    return;
                }
                event = self.election.next_event() => self.on_role_event(event).await,
                Some(event) = next_storage_event(&mut storage) => self.on_storage(event).await,
                Some(event) = log_events.next() => self.on_local(event).await,
                _ = tab_ping.tick() => self.refresh_heartbeat(),
            }
        }
    }

    fn announce_role(&self) {
        let role = self.election.role();
        let changed = self.projections.role.send_if_modified(|current| {
            if *current == role {
                return false;
            }
            *current = role;
            true
        });

        if changed {
            info!(tab = %self.id, %role, "role changed");
            self.projections.emit(ClientEvent::Role(role));
        }
    }

    fn set_state(&self, state: NodeState) {
        let changed = self.projections.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });

        if changed {
            debug!(tab = %self.id, %state, "state changed");
            self.projections.emit(ClientEvent::State(state));
        }
    }

    fn publish_state(&self, state: NodeState) {
        if self.channel.is_available()
            && let Err(e) = self.channel.send(&self.keys.state, &state)
        {
            warn!(tab = %self.id, error = %e, "failed to publish state");
        }
        self.set_state(state);
    }

    /// Rewrites the state record when it no longer matches the node, as after
    /// a follower wrongly declared this leader dead.
    fn reassert_state(&self) {
        let state = self.node.state();
        if self.channel.read::<NodeState>(&self.keys.state) != Some(state) {
            debug!(tab = %self.id, %state, "restoring state record");
            self.publish_state(state);
        }
    }

    fn read_leader(&self) -> LeaderRecord {
        self.channel.read(&self.keys.leader).unwrap_or_default()
    }

    fn write_claim(&self, now: u64) {
        if !self.channel.is_available() {
            return;
        }

        let record = LeaderRecord::claimed(self.id.as_str(), now);
        if let Err(e) = self.channel.send(&self.keys.leader, &record) {
            warn!(tab = %self.id, error = %e, "failed to write leader record");
        }
    }

    fn become_candidate(&mut self) {
        self.election.become_candidate();
        self.announce_role();
    }

    async fn become_follower(&mut self) {
        let was_leader = self.election.role() == Role::Leader;

        self.election.become_follower();
        self.announce_role();

        if was_leader && let Err(e) = self.node.disconnect().await {
            error!(tab = %self.id, error = %e, "failed to disconnect node");
        }

        let state = self.channel.read(&self.keys.state).unwrap_or_default();
        self.set_state(state);
    }

    async fn become_leader(&mut self) {
        let now = self.now();
        self.write_claim(now);

        // Subscribe first so the connect below is observed.
        self.election.become_leader(self.node.watch_state(), now);
        self.announce_role();

        if self.node.state() == NodeState::Disconnected
            && let Err(e) = self.node.connect().await
        {
            error!(tab = %self.id, error = %e, "failed to connect node");
        }

        self.publish_state(self.node.state());
    }

    fn on_dead_leader(&mut self) {
        info!(tab = %self.id, "leader is gone");
        self.publish_state(NodeState::Disconnected);
        self.become_candidate();
    }

    async fn on_role_event(&mut self, event: RoleEvent) {
        match event {
            RoleEvent::ElectionDue => {
                let record = self.read_leader();
                if self.election.is_live(&record, self.now()) && self.election.is_foreign(&record)
                {
                    self.become_follower().await;
                } else {
                    self.become_leader().await;
                }
            }
            RoleEvent::RecheckDue => {
                let record = self.read_leader();
                if self.election.is_live(&record, self.now()) {
                    self.election.rearm_recheck();
                } else {
                    self.on_dead_leader();
                }
            }
            RoleEvent::PingDue => {
                let now = self.now();
                debug!(tab = %self.id, "refreshing leader record");
                self.write_claim(now);
                self.election.record_ping(now);
                self.reassert_state();
            }
            RoleEvent::NodeState(state) => {
                if self.election.role() == Role::Leader {
                    self.publish_state(state);
                }
            }
        }
    }

    async fn on_storage(&mut self, event: StorageEvent) {
        let StorageEvent { key, new_value } = event;

        if key == self.keys.leader {
            self.on_leader_record(new_value.as_deref()).await;
        } else if key == self.keys.state {
            self.on_state_record(new_value.as_deref());
        } else if key == self.keys.add {
            if let Some(raw) = new_value {
                self.on_remote_add(&raw).await;
            }
        } else if key == self.keys.clean
            && let Some(raw) = new_value
        {
            self.on_remote_clean(&raw).await;
        }
    }

    async fn on_leader_record(&mut self, raw: Option<&str>) {
        // A removed record reads as no claim at all.
        let record = match raw {
            None => LeaderRecord::Empty,
            Some(raw) => match decode(&self.keys.leader, raw) {
                Some(record) => record,
                None => return,
            },
        };
        let now = self.now();

        match self.election.role() {
            Role::Leader => match &record {
                LeaderRecord::Claimed { owner, heartbeat } if *owner != self.id => {
                    if *heartbeat >= self.election.last_ping().unwrap_or_default() {
                        warn!(tab = %self.id, %owner, "another tab took over leadership");
                        self.become_follower().await;
                    }
                }
                LeaderRecord::Empty => {
                    debug!(tab = %self.id, "leader record cleared, reasserting");
                    self.write_claim(now);
                    self.election.record_ping(now);
                    self.reassert_state();
                }
                LeaderRecord::Claimed { .. } => {}
            },
            Role::Candidate => {
                if self.election.is_live(&record, now) && self.election.is_foreign(&record) {
                    self.become_follower().await;
                }
            }
            Role::Follower => {
                if !self.election.is_live(&record, now) {
                    self.on_dead_leader();
                }
            }
        }
    }

    fn on_state_record(&self, raw: Option<&str>) {
        if self.election.role() != Role::Follower {
            return;
        }

        if let Some(state) = raw.and_then(|raw| decode::<NodeState>(&self.keys.state, raw)) {
            self.set_state(state);
        }
    }

    async fn on_remote_add(&mut self, raw: &str) {
        let Some(record) = decode::<MutationRecord>(&self.keys.add, raw) else {
            return;
        };
        if self.mirror.is_own(&record) {
            return;
        }
        let MutationRecord {
            origin,
            action,
            meta,
        } = record;

        if self.mirror.is_addressed_to_us(&meta) {
            let replica = LogMirror::replica(&origin, meta.clone());
            debug!(tab = %self.id, %origin, id = %meta.id, "replaying entry");

            if self.log.is_shared() {
                self.observe(&LogEvent::Added(Entry::new(action.clone(), replica)));
            } else if let Err(e) = self.log.add(action.clone(), replica).await {
                error!(tab = %self.id, error = %e, "failed to replay entry");
            }
        }

        if meta.sync && self.election.role() == Role::Leader {
            let mut meta = meta;
            meta.id = self.mirror.outbound_id(&origin, &meta.id);
            self.transmit(action, meta).await;
        }
    }

    async fn on_remote_clean(&mut self, raw: &str) {
        let Some(record) = decode::<MutationRecord>(&self.keys.clean, raw) else {
            return;
        };
        if self.mirror.is_own(&record) || !self.mirror.is_addressed_to_us(&record.meta) {
            return;
        }
        let MutationRecord {
            origin,
            action,
            meta,
        } = record;

        if self.log.is_shared() {
            let replica = LogMirror::replica(&origin, meta);
            self.observe(&LogEvent::Cleaned(Entry::new(action, replica)));
        } else if let Err(e) = self.log.remove(&meta.id).await {
            error!(tab = %self.id, error = %e, "failed to remove replica");
        }
    }

    async fn on_local(&mut self, event: LogEvent) {
        self.observe(&event);

        if self.channel.is_available()
            && let Some(record) = self.mirror.outgoing(&event)
        {
            let key = match &event {
                LogEvent::Added(_) => &self.keys.add,
                LogEvent::Cleaned(_) => &self.keys.clean,
            };
            if let Err(e) = self.channel.send(key, &record) {
                warn!(tab = %self.id, error = %e, "failed to broadcast log change");
            }
        }

        if let LogEvent::Added(entry) = event
            && entry.meta.sync
            && !entry.meta.received
            && self.election.role() == Role::Leader
        {
            self.transmit(entry.action, entry.meta).await;
        }
    }

    fn observe(&mut self, event: &LogEvent) {
        if self.mirror.track(event) {
            self.projections
                .subscriptions
                .send_replace(self.mirror.subscriptions());
        }

        let entry = event.entry().clone();
        self.projections.emit(match event {
            LogEvent::Added(_) => ClientEvent::Add(entry),
            LogEvent::Cleaned(_) => ClientEvent::Clean(entry),
        });
    }

    async fn transmit(&mut self, action: crosstab_log::Action, meta: crosstab_log::Meta) {
        debug!(tab = %self.id, id = %meta.id, "forwarding entry to node");
        if let Err(e) = self.node.transmit(meta.id.clone(), action, meta).await {
            error!(tab = %self.id, error = %e, "failed to transmit entry");
        }
    }

    fn refresh_heartbeat(&self) {
        if !self.channel.is_available() {
            return;
        }

        let key = self.keys.tab(&self.id);
        if let Err(e) = self.channel.send(&key, &self.now()) {
            warn!(tab = %self.id, error = %e, "failed to refresh heartbeat");
        }
    }

    async fn reclaim_stale_tabs(&mut self) {
        let entries = self.log.entries().await.unwrap_or_else(|e| {
            error!(tab = %self.id, error = %e, "failed to scan log");
            Vec::new()
        });
        let heartbeats = match self.channel.keys() {
            Ok(keys) => self.liveness.heartbeat_owners(&self.keys, &keys),
            Err(e) => {
                warn!(tab = %self.id, error = %e, "failed to list heartbeats");
                BTreeSet::new()
            }
        };
        let mut owners = self.liveness.owners(&entries, &heartbeats);
        owners.extend(heartbeats);

        let now = self.now();
        for owner in owners {
            let key = self.keys.tab(&owner);
            if !self.liveness.is_stale(self.channel.read_raw(&key).as_deref(), now) {
                continue;
            }

            match self.log.remove_reason(&tab_reason(&owner)).await {
                Ok(reclaimed) => info!(tab = %self.id, %owner, reclaimed, "released stale tab"),
                Err(e) => error!(tab = %self.id, %owner, error = %e, "failed to release stale tab"),
            }
            if let Err(e) = self.channel.remove(&key) {
                warn!(tab = %self.id, %owner, error = %e, "failed to remove stale heartbeat");
            }
        }
    }

    fn resign(&self) {
        if self.election.role() != Role::Leader || !self.channel.is_available() {
            return;
        }

        info!(tab = %self.id, "resigning leadership");
        if let Err(e) = self.channel.send(&self.keys.leader, &LeaderRecord::Empty) {
            warn!(tab = %self.id, error = %e, "failed to clear leader record");
        }
    }

    async fn shutdown(&mut self) {
        self.resign();
        self.election.stop();
        self.node.destroy().await;
        info!(tab = %self.id, "tab stopped");
    }

    async fn unload(&mut self, log_events: &mut BoxStream<'static, LogEvent>) {
        self.resign();
        self.election.stop();

        match self.log.remove_reason(&tab_reason(&self.id)).await {
            Ok(released) => debug!(tab = %self.id, released, "released own entries"),
            Err(e) => error!(tab = %self.id, error = %e, "failed to release own entries"),
        }

        // Let peers hear about everything released above.
        while let Some(Some(event)) = log_events.next().now_or_never() {
            self.on_local(event).await;
        }

        if self.channel.is_available()
            && let Err(e) = self.channel.remove(&self.keys.tab(&self.id))
        {
            warn!(tab = %self.id, error = %e, "failed to remove heartbeat");
        }

        self.node.destroy().await;
        info!(tab = %self.id, "tab unloaded");
    }
}

async fn next_storage_event(
    storage: &mut Option<BoxStream<'static, StorageEvent>>,
) -> Option<StorageEvent> {
    match storage {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}
