//! Configuration history
//!
//! The latest configuration in the log is in effect as soon as it is appended.
//! Older configurations are kept until a newer one commits so that a suffix
//! truncation can fall back to the previous membership.

use dcache_core::Configuration;

#[derive(Debug, Clone, Default)]
pub(crate) struct Membership {
    /// `(index, configuration)` pairs in log order
    history: Vec<(u64, Configuration)>,
}

impl Membership {
    pub(crate) fn new(index: u64, config: Configuration) -> Self {
        let mut membership = Self::default();
        if !config.is_empty() || index > 0 {
            membership.history.push((index, config));
        }
        membership
    }

    pub(crate) fn latest(&self) -> Option<&Configuration> {
        self.history.last().map(|(_, config)| config)
    }

    /// Configuration in effect, empty when the node has none yet
    pub(crate) fn config(&self) -> Configuration {
        self.latest().cloned().unwrap_or_default()
    }

    pub(crate) fn latest_index(&self) -> u64 {
        self.history.last().map(|(index, _)| *index).unwrap_or(0)
    }

    pub(crate) fn push(&mut self, index: u64, config: Configuration) {
        self.history.retain(|(i, _)| *i < index);
        self.history.push((index, config));
    }

    /// Forget configurations carried by entries at or after `from`
    pub(crate) fn truncate(&mut self, from: u64) {
        self.history.retain(|(index, _)| *index < from);
    }

    /// Drop configurations superseded by one that is committed
    pub(crate) fn compact(&mut self, commit_index: u64) {
        if let Some(pos) = self.history.iter().rposition(|(index, _)| *index <= commit_index) {
            self.history.drain(..pos);
        }
    }

    /// Reset to the configuration recorded in a snapshot
    pub(crate) fn reset(&mut self, index: u64, config: Configuration) {
        self.history.retain(|(i, _)| *i > index);
        self.history.insert(0, (index, config));
    }
}
