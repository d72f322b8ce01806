//! Partition ownership for one consumer.
//!
//! The consumer's group tasks report every membership change here as an event
//! code plus a partition list. Assign and revoke codes move the ownership state
//! machine and are forwarded to an [`AssignmentTarget`]; any other code is
//! logged as [`Error::Rebalance`] and leaves ownership as it was.
//!
//! ```text
//!   Unassigned --assign--> Assigned(partitions)
//!   Assigned   --assign--> Assigned(new partitions)
//!   Assigned   --revoke--> Revoking --> Unassigned
//! ```

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{BrokerCode, Error, Result};
use crate::metrics;
use crate::types::TopicPartition;

/// Ownership of partitions by this consumer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OwnershipState {
    #[default]
    Unassigned,
    Assigned(BTreeSet<TopicPartition>),
    /// Transient, while the target drops its partitions.
    Revoking,
}

impl OwnershipState {
    pub fn partitions(&self) -> BTreeSet<TopicPartition> {
        match self {
            OwnershipState::Assigned(partitions) => partitions.clone(),
            _ => BTreeSet::new(),
        }
    }
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipState::Unassigned => write!(f, "unassigned"),
            OwnershipState::Assigned(p) => write!(f, "assigned({})", p.len()),
            OwnershipState::Revoking => write!(f, "revoking"),
        }
    }
}

/// Partitions this process holds for a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroupMembership {
    pub group_id: String,
    pub partitions: BTreeSet<TopicPartition>,
}

impl ConsumerGroupMembership {
    /// Partition indexes of `topic`, sorted.
    pub fn partition_ids(&self, topic: &str) -> Vec<i32> {
        self.partitions
            .iter()
            .filter(|tp| tp.topic == topic)
            .map(|tp| tp.partition.value())
            .collect()
    }
}

/// The consumer side of an assignment: start or stop fetching.
#[async_trait]
pub trait AssignmentTarget: Send + Sync {
    async fn assign(&self, partitions: &[TopicPartition]) -> Result<()>;

    async fn unassign(&self) -> Result<()>;
}

/// Applies rebalance events to the ownership state.
pub struct RebalanceCoordinator {
    group_id: String,
    /// Held for the whole of one event so events apply one at a time.
    events: Mutex<()>,
    state: Mutex<OwnershipState>,
}

impl RebalanceCoordinator {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            events: Mutex::new(()),
            state: Mutex::new(OwnershipState::Unassigned),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Handle one rebalance event. `code` is the raw event code.
    ///
    /// A failing `assign` is logged and the partitions are still recorded as
    /// owned, so the next rebalance can revoke them. Returns the new state.
    pub async fn on_rebalance(
        &self,
        target: &dyn AssignmentTarget,
        code: i32,
        partitions: &[TopicPartition],
    ) -> OwnershipState {
        let _event = self.events.lock().await;

        match BrokerCode::from_raw(code) {
            BrokerCode::AssignPartitions => {
                if let Err(e) = target.assign(partitions).await {
                    warn!(
                        group = %self.group_id,
                        error = %e,
                        "Assign failed, keeping assignment"
                    );
                }
                *self.state.lock().await =
                    OwnershipState::Assigned(partitions.iter().cloned().collect());
                metrics::record_rebalance(&self.group_id, "assign");
                metrics::ASSIGNED_PARTITIONS
                    .with_label_values(&[self.group_id.as_str()])
                    .set(partitions.len() as i64);
                info!(
                    group = %self.group_id,
                    partitions = ?partitions.iter().map(|tp| tp.to_string()).collect::<Vec<_>>(),
                    "Partitions assigned"
                );
            }
            BrokerCode::RevokePartitions => {
                // Visible to `state()` until the target has let go.
                *self.state.lock().await = OwnershipState::Revoking;
                if let Err(e) = target.unassign().await {
                    warn!(group = %self.group_id, error = %e, "Unassign failed");
                }
                *self.state.lock().await = OwnershipState::Unassigned;
                metrics::record_rebalance(&self.group_id, "revoke");
                metrics::ASSIGNED_PARTITIONS
                    .with_label_values(&[self.group_id.as_str()])
                    .set(0);
                info!(group = %self.group_id, "Partitions revoked");
            }
            other => {
                let err = Error::Rebalance(other);
                let state = self.state.lock().await.clone();
                metrics::record_rebalance(&self.group_id, "error");
                error!(
                    group = %self.group_id,
                    code,
                    error = %err,
                    state = %state,
                    "Unexpected rebalance event, ownership unchanged"
                );
            }
        }

        self.state.lock().await.clone()
    }

    pub async fn state(&self) -> OwnershipState {
        self.state.lock().await.clone()
    }

    pub async fn membership(&self) -> ConsumerGroupMembership {
        ConsumerGroupMembership {
            group_id: self.group_id.clone(),
            partitions: self.state.lock().await.partitions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        fail_assign: bool,
    }

    #[async_trait]
    impl AssignmentTarget for Recorder {
        async fn assign(&self, partitions: &[TopicPartition]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("assign {}", partitions.len()));
            if self.fail_assign {
                Err(Error::Connection("down".into()))
            } else {
                Ok(())
            }
        }

        async fn unassign(&self) -> Result<()> {
            self.calls.lock().unwrap().push("unassign".into());
            Ok(())
        }
    }

    fn parts(ids: &[i32]) -> Vec<TopicPartition> {
        ids.iter().map(|&p| TopicPartition::new("t", p)).collect()
    }

    #[tokio::test]
    async fn test_assign_sets_membership() {
        let coordinator = RebalanceCoordinator::new("contribution-group");
        let target = Recorder::default();

        let state = coordinator
            .on_rebalance(&target, BrokerCode::AssignPartitions.as_i32(), &parts(&[0, 1]))
            .await;
        assert_eq!(state, OwnershipState::Assigned(parts(&[0, 1]).into_iter().collect()));

        let membership = coordinator.membership().await;
        assert_eq!(membership.group_id, "contribution-group");
        assert_eq!(membership.partition_ids("t"), vec![0, 1]);
        assert_eq!(*target.calls.lock().unwrap(), vec!["assign 2".to_string()]);
    }

    #[tokio::test]
    async fn test_revoke_clears_membership() {
        let coordinator = RebalanceCoordinator::new("g");
        let target = Recorder::default();
        coordinator.on_rebalance(&target, -175, &parts(&[0])).await;

        let state = coordinator.on_rebalance(&target, -174, &[]).await;
        assert_eq!(state, OwnershipState::Unassigned);
        assert!(coordinator.membership().await.partitions.is_empty());
        assert_eq!(
            *target.calls.lock().unwrap(),
            vec!["assign 1".to_string(), "unassign".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_code_leaves_ownership_stale() {
        let coordinator = RebalanceCoordinator::new("g");
        let target = Recorder::default();
        coordinator.on_rebalance(&target, -175, &parts(&[2])).await;

        let state = coordinator
            .on_rebalance(&target, BrokerCode::IllegalGeneration.as_i32(), &parts(&[5]))
            .await;
        assert_eq!(state, OwnershipState::Assigned(parts(&[2]).into_iter().collect()));
        assert_eq!(target.calls.lock().unwrap().len(), 1);
    }

    /// Holds `unassign` open until released.
    struct SlowRelease {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl AssignmentTarget for SlowRelease {
        async fn assign(&self, _: &[TopicPartition]) -> Result<()> {
            Ok(())
        }

        async fn unassign(&self) -> Result<()> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_revoking_is_observable() {
        let coordinator = std::sync::Arc::new(RebalanceCoordinator::new("g"));
        let target = std::sync::Arc::new(SlowRelease {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        coordinator.on_rebalance(&*target, -175, &parts(&[0])).await;

        let revoke = {
            let (coordinator, target) = (coordinator.clone(), target.clone());
            tokio::spawn(async move { coordinator.on_rebalance(&*target, -174, &[]).await })
        };
        target.entered.notified().await;

        assert_eq!(coordinator.state().await, OwnershipState::Revoking);
        assert!(coordinator.membership().await.partitions.is_empty());

        target.release.notify_one();
        assert_eq!(revoke.await.unwrap(), OwnershipState::Unassigned);
    }

    #[tokio::test]
    async fn test_failed_assign_is_non_fatal() {
        let coordinator = RebalanceCoordinator::new("g");
        let target = Recorder {
            fail_assign: true,
            ..Default::default()
        };
        let state = coordinator.on_rebalance(&target, -175, &parts(&[0, 1])).await;
        assert_eq!(state.partitions().len(), 2);
    }
}
