#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crosstab_client::{Clock, CrossTabClient, CrossTabConfig, TokioClock};
use crosstab_log_memory::MemoryLog;
use crosstab_node_mock::MockNode;
use crosstab_store::SharedStore;
use crosstab_store_memory::MemoryStore;

pub type TestClient = CrossTabClient<MemoryStore, MemoryLog, MockNode>;

pub const USER: &str = "10";

/// Long enough for any candidate to finish its election with default timing.
pub const ELECTION: Duration = Duration::from_millis(2100);

/// Tabs sharing one store and one clock.
pub struct Browser {
    pub store: MemoryStore,
    pub clock: Arc<TokioClock>,
}

impl Browser {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            clock: Arc::new(TokioClock::new()),
        }
    }

    pub fn config(&self, tab: &str, seed: u64) -> CrossTabConfig {
        let clock: Arc<dyn Clock> = self.clock.clone();

        CrossTabConfig {
            user_id: Some(USER.to_string()),
            tab_id: Some(tab.to_string()),
            rng_seed: Some(seed),
            clock,
            ..CrossTabConfig::new("wss://localhost:1337", "1.0.0")
        }
    }

    /// A tab with its own store handle, log and node.
    pub fn tab(&self, tab: &str, seed: u64) -> TestClient {
        self.tab_with(self.config(tab, seed), MemoryLog::new(format!("{USER}:{tab}")))
    }

    pub fn tab_with(&self, config: CrossTabConfig, log: MemoryLog) -> TestClient {
        CrossTabClient::new(config, Some(self.store.attach()), log, MockNode::new())
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key).unwrap()
    }

    /// Writes `value` from outside every tab, notifying all of them.
    pub fn set(&self, key: &str, value: &str) {
        self.store.set(key, value).unwrap();
    }

    /// A leader record claimed by `owner` right now.
    pub fn claim(&self, key: &str, owner: &str) {
        self.set(key, &format!(r#"["{owner}",{}]"#, self.now()));
    }

    /// Like [`Browser::claim`], but no tab hears about it.
    pub fn claim_silently(&self, key: &str, owner: &str) {
        self.store
            .set_silently(key, &format!(r#"["{owner}",{}]"#, self.now()));
    }
}

/// Lets every tab task react to what just happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
