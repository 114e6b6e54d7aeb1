//! Leader Election
//!
//! Each participant owns one ephemeral sequential node under the election
//! root. The smallest node is the leader. Everyone else watches only the
//! node immediately before its own, so a departure wakes exactly one
//! process and N participants hold at most N-1 watches between them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use super::callback::OnElectionCallback;
use super::sequence::{Position, SequentialGroup};
use crate::error::{Error, Result};
use crate::session::Watcher;
use crate::store::{CoordinationStore, StoreEvent};

/// Leadership state of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeaderState {
    /// Not evaluated yet in this session
    Unknown,
    /// Holds the smallest election node
    Leader,
    /// Watching a predecessor
    Follower,
    /// Session gone; a new session starts over
    Disconnected,
}

impl std::fmt::Display for LeaderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaderState::Unknown => write!(f, "unknown"),
            LeaderState::Leader => write!(f, "leader"),
            LeaderState::Follower => write!(f, "follower"),
            LeaderState::Disconnected => write!(f, "disconnected"),
        }
    }
}

#[derive(Debug, Default)]
struct ElectionInner {
    /// Own node name, relative to the election root
    election_node: Option<String>,
    /// Full path of the predecessor currently watched
    watched: Option<String>,
}

/// Participates in leader election for one session
pub struct LeaderElector {
    store: Arc<dyn CoordinationStore>,
    group: SequentialGroup,
    callback: Arc<dyn OnElectionCallback>,
    state: watch::Sender<LeaderState>,
    /// Serializes evaluation between the caller and watch delivery
    inner: Mutex<ElectionInner>,
}

impl LeaderElector {
    /// Create an elector over `group` for the session behind `store`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        group: SequentialGroup,
        callback: Arc<dyn OnElectionCallback>,
    ) -> Self {
        let (state, _) = watch::channel(LeaderState::Unknown);
        Self {
            store,
            group,
            callback,
            state,
            inner: Mutex::new(ElectionInner::default()),
        }
    }

    /// Create this process's election node.
    ///
    /// Store failures, including a missing election root, come back as
    /// `Error::Registration`; nothing is retried here.
    pub async fn volunteer_for_leadership(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        if let Some(node) = &inner.election_node {
            return Err(Error::AlreadyVolunteered(node.clone()));
        }

        let name = self
            .group
            .join(self.store.as_ref(), &[])
            .await
            .map_err(|e| e.into_registration(self.group.root()))?;

        tracing::info!(
            "Volunteered for leadership as {} (session {})",
            self.group.path_of(&name),
            self.store.session_id()
        );
        inner.election_node = Some(name.clone());
        Ok(name)
    }

    /// Work out leader or follower and arm the predecessor watch.
    ///
    /// A predecessor that vanishes before the watch is armed sends the
    /// evaluation back to a fresh listing. There is no bound on that loop.
    pub async fn reevaluate_leadership(&self) -> Result<LeaderState> {
        let mut inner = self.inner.lock().await;
        let node = inner.election_node.clone().ok_or(Error::NotVolunteered)?;

        loop {
            let members = self.group.members(self.store.as_ref(), false).await?;

            match SequentialGroup::position(&members, &node) {
                Position::First => {
                    inner.watched = None;

                    if self.transition(LeaderState::Leader) != LeaderState::Leader {
                        tracing::info!("I am the leader ({})", node);
                        if let Err(e) = self.callback.on_elected_leader().await {
                            tracing::error!("Leader callback failed for {}: {}", node, e);
                        }
                    }
                    return Ok(LeaderState::Leader);
                }
                Position::After(predecessor) => {
                    if self.transition(LeaderState::Follower) != LeaderState::Follower {
                        tracing::info!(
                            "I am not the leader ({}); leader is {}",
                            node,
                            members.first().map(String::as_str).unwrap_or("-")
                        );
                    }
                    self.callback.on_worker().await;

                    let path = self.group.path_of(&predecessor);
                    match self.store.get_data(&path, true).await {
                        Ok(_) => {
                            tracing::debug!("Watching predecessor {}", path);
                            inner.watched = Some(path);
                            return Ok(LeaderState::Follower);
                        }
                        Err(e) if e.is_transient_race() => {
                            tracing::debug!("Predecessor {} vanished before watch was armed; re-listing", path);
                            inner.watched = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Position::Absent => {
                    inner.watched = None;
                    return Err(Error::ElectionNodeMissing(self.group.path_of(&node)));
                }
            }
        }
    }

    /// Current leadership state
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// Follow leadership state changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Own election node name
    pub async fn election_node(&self) -> Option<String> {
        self.inner.lock().await.election_node.clone()
    }

    /// Leader's node name, read from a fresh listing.
    ///
    /// No watch is armed, so a follower keeps watching only its predecessor.
    pub async fn current_leader(&self) -> Result<Option<String>> {
        let members = self.group.members(self.store.as_ref(), false).await?;
        Ok(members.into_iter().next())
    }

    /// Predecessor path currently watched
    pub async fn watched_path(&self) -> Option<String> {
        self.inner.lock().await.watched.clone()
    }

    pub fn group(&self) -> &SequentialGroup {
        &self.group
    }

    /// Move to `next` unless already disconnected; returns the previous state
    fn transition(&self, next: LeaderState) -> LeaderState {
        let mut previous = next;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == LeaderState::Disconnected || *state == next {
                return false;
            }
            *state = next;
            true
        });
        previous
    }
}

#[async_trait]
impl Watcher for LeaderElector {
    async fn process(&self, event: &StoreEvent) -> Result<()> {
        match event {
            StoreEvent::NodeDeleted(path) => {
                let watched = self.inner.lock().await.watched.clone();
                if watched.as_deref() != Some(path.as_str()) {
                    return Ok(());
                }
                tracing::info!("Predecessor {} is gone; re-evaluating leadership", path);
                self.reevaluate_leadership().await?;
                Ok(())
            }
            StoreEvent::Disconnected | StoreEvent::Expired => {
                let mut inner = self.inner.lock().await;
                let node = inner.election_node.take();
                inner.watched = None;
                self.transition(LeaderState::Disconnected);
                tracing::warn!(
                    "Left the election ({}): {}",
                    event.type_name(),
                    node.as_deref().unwrap_or("not volunteered")
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
