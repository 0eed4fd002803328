use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crosstab_log::{Action, ActionLog, Entry};
use crosstab_node::{NodeState, SyncNode};
use crosstab_store::SharedStore;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastChannel;
use crate::config::{CrossTabConfig, Timing};
use crate::election::{Election, Role};
use crate::keys::StorageKeys;
use crate::liveness::Liveness;
use crate::mirror::LogMirror;
use crate::tab::{Command, Projections, Tab, TabParts};

/// Something observable happened to a tab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// An entry appeared in this tab's view of the log, locally or from
    /// another tab.
    Add(Entry),

    /// An entry left this tab's view of the log.
    Clean(Entry),

    /// The tab's role changed.
    Role(Role),

    /// The tab's externally observed connection state changed.
    State(NodeState),
}

enum Lifecycle<S: SharedStore, L: ActionLog, N: SyncNode> {
    Idle(Box<Tab<S, L, N>>),
    Running {
        commands: mpsc::Sender<Command>,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// A client that shares one connection to the remote peer between every tab
/// of a user.
///
/// Tabs coordinate through the shared store: exactly one of them leads and
/// drives the node, every other one follows and mirrors the leader's state.
/// Log changes made in any tab are replayed into the logs of the others.
///
/// # Example
/// ```no_run
/// use crosstab_client::{CrossTabClient, CrossTabConfig};
/// use crosstab_log_memory::MemoryLog;
/// use crosstab_node_mock::MockNode;
/// use crosstab_store_memory::MemoryStore;
///
/// # async fn example() {
/// let mut config = CrossTabConfig::new("wss://example.com", "1.0.0");
/// config.user_id = Some("10".into());
///
/// let store = MemoryStore::new();
/// let log = MemoryLog::new("10:tab");
/// let mut client = CrossTabClient::new(config, Some(store), log, MockNode::new());
///
/// client.start().await;
/// println!("{}", client.role());
/// client.destroy().await;
/// # }
/// ```
pub struct CrossTabClient<S, L, N>
where
    S: SharedStore,
    L: ActionLog,
    N: SyncNode,
{
    id: String,
    config: CrossTabConfig,
    keys: StorageKeys,
    channel: BroadcastChannel<S>,
    log: L,
    node: N,
    role_timeout: Duration,
    projections: Arc<Projections>,
    lifecycle: Lifecycle<S, L, N>,
}

impl<S, L, N> fmt::Debug for CrossTabClient<S, L, N>
where
    S: SharedStore,
    L: ActionLog,
    N: SyncNode,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossTabClient")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .field("role", &self.role())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<S, L, N> CrossTabClient<S, L, N>
where
    S: SharedStore,
    L: ActionLog,
    N: SyncNode,
{
    /// Creates a client. Nothing happens until [`CrossTabClient::start`].
    ///
    /// Without a `store` the tab cannot see any other tab and leads alone.
    pub fn new(config: CrossTabConfig, store: Option<S>, log: L, node: N) -> Self {
        let id = config
            .tab_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let keys = StorageKeys::new(&config.prefix, config.scope());
        let timing = Timing::from_config(&config);
        let channel = BroadcastChannel::new(store);
        let projections = Arc::new(Projections::new(node.state()));

        let election = Election::new(id.clone(), timing, config.rng_seed);
        let role_timeout = election.role_timeout();

        let tab = Tab::new(TabParts {
            id: id.clone(),
            keys: keys.clone(),
            channel: channel.clone(),
            log: log.clone(),
            node: node.clone(),
            clock: Arc::clone(&config.clock),
            election,
            mirror: LogMirror::new(id.clone(), config.scope().to_string()),
            liveness: Liveness::new(id.clone(), timing.tab_timeout),
            tab_ping: timing.tab_ping,
            projections: Arc::clone(&projections),
        });

        Self {
            id,
            config,
            keys,
            channel,
            log,
            node,
            role_timeout,
            projections,
            lifecycle: Lifecycle::Idle(Box::new(tab)),
        }
    }

    /// Starts the tab: releases entries of dead tabs, takes the initial role
    /// and begins mirroring the log. Calling it again does nothing.
    pub async fn start(&mut self) {
        let mut tab = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(tab) => tab,
            other => {
                self.lifecycle = other;
                return;
            }
        };

        info!(tab = %self.id, server = %self.config.server, "starting tab");

        // Subscribe before beginning so nothing done on start is missed.
        let storage = self.channel.subscribe();
        let log_events = self.log.subscribe();
        tab.begin().await;

        let (commands, receiver) = mpsc::channel(4);
        let task = tokio::spawn((*tab).run(receiver, storage, log_events));

        self.lifecycle = Lifecycle::Running { commands, task };
    }

    /// Stops every timer and subscription, hands leadership over and tears the
    /// node down.
    pub async fn destroy(&mut self) {
        self.stop(Command::Destroy).await;
    }

    /// Handles the host unloading the tab: like [`CrossTabClient::destroy`],
    /// but also releases the entries this tab owns and its heartbeat.
    pub async fn unload(&mut self) {
        self.stop(Command::Unload).await;
    }

    /// Destroys the client and removes every shared key it used.
    pub async fn clean(&mut self) {
        self.destroy().await;

        if !self.channel.is_available() {
            return;
        }

        let keys = [
            self.keys.add.clone(),
            self.keys.clean.clone(),
            self.keys.state.clone(),
            self.keys.leader.clone(),
            self.keys.tab(&self.id),
        ];
        for key in keys {
            if let Err(e) = self.channel.remove(&key) {
                warn!(tab = %self.id, %key, error = %e, "failed to remove shared key");
            }
        }
    }

    async fn stop(&mut self, command: fn(oneshot::Sender<()>) -> Command) {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(_) => self.node.destroy().await,
            Lifecycle::Running { commands, task } => {
                let (done, finished) = oneshot::channel();
                if commands.send(command(done)).await.is_ok() {
                    let _ = finished.await;
                }
                if let Err(e) = task.await {
                    error!(tab = %self.id, error = %e, "tab task failed");
                }
            }
            Lifecycle::Stopped => {}
        }
    }

    /// This tab's unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration the client was built with.
    #[must_use]
    pub const fn config(&self) -> &CrossTabConfig {
        &self.config
    }

    /// The shared keys this client uses.
    #[must_use]
    pub const fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// The tab's current role.
    #[must_use]
    pub fn role(&self) -> Role {
        *self.projections.role.borrow()
    }

    /// The externally observed connection state: the node's own while
    /// leading, the leader's while following.
    #[must_use]
    pub fn state(&self) -> NodeState {
        *self.projections.state.borrow()
    }

    /// Whether [`CrossTabClient::state`] is anything beyond `connecting`.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Active subscription requests seen in any tab's log.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Action> {
        self.projections.subscriptions.borrow().clone()
    }

    /// This tab's jittered role timeout.
    #[must_use]
    pub const fn role_timeout(&self) -> Duration {
        self.role_timeout
    }

    /// Subscribes to log, role and state events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.projections.events.subscribe()
    }

    /// Watches the role.
    #[must_use]
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.projections.role.subscribe()
    }

    /// Watches the externally observed connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<NodeState> {
        self.projections.state.subscribe()
    }

    /// The local log.
    #[must_use]
    pub const fn log(&self) -> &L {
        &self.log
    }

    /// The node, driven only while this tab leads.
    #[must_use]
    pub const fn node(&self) -> &N {
        &self.node
    }
}
