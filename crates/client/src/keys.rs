/// Names of every shared key a tab touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageKeys {
    /// The leader record: `[owner, heartbeat]` or `[]`.
    pub leader: String,

    /// The leader's connection state.
    pub state: String,

    /// Broadcast of entries added to a tab's log.
    pub add: String,

    /// Broadcast of entries removed from a tab's log.
    pub clean: String,

    tab_prefix: String,
}

impl StorageKeys {
    /// Creates the key set for `prefix` and `scope`.
    #[must_use]
    pub fn new(prefix: &str, scope: &str) -> Self {
        Self {
            leader: format!("{prefix}:{scope}:leader"),
            state: format!("{prefix}:{scope}:state"),
            add: format!("{prefix}:{scope}:add"),
            clean: format!("{prefix}:{scope}:clean"),
            tab_prefix: format!("{prefix}:tab:"),
        }
    }

    /// The heartbeat key of tab `id`.
    #[must_use]
    pub fn tab(&self, id: &str) -> String {
        format!("{}{id}", self.tab_prefix)
    }

    /// The tab owning a heartbeat key, if `key` is one.
    #[must_use]
    pub fn tab_owner<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.tab_prefix.as_str())
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = StorageKeys::new("logux", "10");

        assert_eq!(keys.leader, "logux:10:leader");
        assert_eq!(keys.state, "logux:10:state");
        assert_eq!(keys.add, "logux:10:add");
        assert_eq!(keys.clean, "logux:10:clean");
        assert_eq!(keys.tab("abc"), "logux:tab:abc");
    }

    #[test]
    fn test_tab_owner() {
        let keys = StorageKeys::new("logux", "10");

        assert_eq!(keys.tab_owner("logux:tab:abc"), Some("abc"));
        assert_eq!(keys.tab_owner("logux:tab:"), None);
        assert_eq!(keys.tab_owner("logux:10:leader"), None);
        assert_eq!(keys.tab_owner("other:tab:abc"), None);
    }
}
