//! Sequential Membership
//!
//! The shape shared by election and registry: every participant creates an
//! ephemeral, sequentially-numbered child under a well-known root, and the
//! sorted sibling list decides who comes first and who precedes whom.

use crate::error::Result;
use crate::store::{ensure_path, join, basename, CoordinationStore, CreateMode};

/// Where a member sits in the sorted sibling list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    /// Smallest sequence number
    First,
    /// Immediately after the named sibling
    After(String),
    /// Not in the list (node gone)
    Absent,
}

/// A group of ephemeral sequential nodes under one root
#[derive(Debug, Clone)]
pub struct SequentialGroup {
    root: String,
    prefix: String,
}

impl SequentialGroup {
    /// Create a group rooted at `root` whose members are named `prefix` + sequence
    pub fn new(root: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Full path of a member name
    pub fn path_of(&self, name: &str) -> String {
        join(&self.root, name)
    }

    /// Create the persistent root if it is missing
    pub async fn bootstrap(&self, store: &dyn CoordinationStore) -> Result<()> {
        ensure_path(store, &self.root).await
    }

    /// Add an ephemeral sequential member; returns its name relative to the root
    pub async fn join(&self, store: &dyn CoordinationStore, data: &[u8]) -> Result<String> {
        let created = store
            .create(&self.path_of(&self.prefix), data, CreateMode::EphemeralSequential)
            .await?;
        Ok(basename(&created).to_string())
    }

    /// List member names in sequence order, optionally arming a children watch
    pub async fn members(&self, store: &dyn CoordinationStore, watch: bool) -> Result<Vec<String>> {
        let mut children = store.get_children(&self.root, watch).await?;
        // Suffixes are fixed width, so string order is sequence order
        children.sort();
        Ok(children)
    }

    /// Locate `name` in an already-sorted member list
    pub fn position(sorted: &[String], name: &str) -> Position {
        match sorted.binary_search_by(|m| m.as_str().cmp(name)) {
            Ok(0) => Position::First,
            Ok(idx) => Position::After(sorted[idx - 1].clone()),
            Err(_) => Position::Absent,
        }
    }

    /// Parse the numeric suffix of a member name
    pub fn sequence_number(&self, name: &str) -> Option<u64> {
        name.strip_prefix(self.prefix.as_str())?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_position() {
        let members: Vec<String> = ["c_0000000000", "c_0000000001", "c_0000000002"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        assert_eq!(SequentialGroup::position(&members, "c_0000000000"), Position::First);
        assert_eq!(
            SequentialGroup::position(&members, "c_0000000002"),
            Position::After("c_0000000001".to_string())
        );
        assert_eq!(SequentialGroup::position(&members, "c_0000000007"), Position::Absent);
        assert_eq!(SequentialGroup::position(&[], "c_0000000000"), Position::Absent);
    }

    #[tokio::test]
    async fn test_join_orders_members() {
        let namespace = MemoryStore::new();
        let (store, _events) = namespace.connect().await;
        let group = SequentialGroup::new("/election", "c_");
        group.bootstrap(&store).await.unwrap();

        let first = group.join(&store, b"").await.unwrap();
        let second = group.join(&store, b"").await.unwrap();

        assert_eq!(first, "c_0000000000");
        assert_eq!(group.sequence_number(&second), Some(1));
        assert_eq!(group.members(&store, false).await.unwrap(), vec![first, second]);
        assert_eq!(group.path_of("c_0000000001"), "/election/c_0000000001");
    }
}
