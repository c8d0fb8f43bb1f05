//! Hooks the write path calls after engagement changes commit.
//!
//! Every hook runs after the durable write, so the durable count already
//! includes the change. A cached counter gets the delta; a cold one is
//! initialized from the durable count and the delta is dropped, since any
//! number of committed changes may be waiting on their hooks.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::application::repos::{CountsRepo, RepoError};
use crate::cache::{CounterCache, InvalidationBus};
use crate::domain::entities::{FollowEdge, ObjectRef};
use crate::domain::types::{CounterKey, CounterTarget, MutationKind};

/// Count the related rows behind a counter.
pub(crate) async fn durable_count(
    counts: &dyn CountsRepo,
    key: &CounterKey,
) -> Result<i64, RepoError> {
    let count = counts.count_relations(key).await?;
    i64::try_from(count).map_err(|_| RepoError::Integrity {
        message: format!("relation count {count} overflows a counter"),
    })
}

pub struct EngagementHooks {
    counters: Arc<CounterCache>,
    counts: Arc<dyn CountsRepo>,
    bus: Arc<InvalidationBus>,
}

impl EngagementHooks {
    pub fn new(
        counters: Arc<CounterCache>,
        counts: Arc<dyn CountsRepo>,
        bus: Arc<InvalidationBus>,
    ) -> Self {
        Self {
            counters,
            counts,
            bus,
        }
    }

    pub async fn like_created(
        &self,
        target: CounterTarget,
        target_id: Uuid,
    ) -> Result<(), RepoError> {
        self.apply(CounterKey::likes(target, target_id), 1).await?;
        self.bus
            .on_mutation(ObjectRef::new(target.object_kind(), target_id), MutationKind::Updated);
        Ok(())
    }

    pub async fn like_deleted(
        &self,
        target: CounterTarget,
        target_id: Uuid,
    ) -> Result<(), RepoError> {
        self.apply(CounterKey::likes(target, target_id), -1).await?;
        self.bus
            .on_mutation(ObjectRef::new(target.object_kind(), target_id), MutationKind::Updated);
        Ok(())
    }

    pub async fn comment_created(&self, post_id: Uuid, comment_id: Uuid) -> Result<(), RepoError> {
        self.apply(CounterKey::comments(post_id), 1).await?;
        self.bus.on_mutation(ObjectRef::post(post_id), MutationKind::Updated);
        self.bus
            .on_mutation(ObjectRef::comment(comment_id), MutationKind::Created);
        Ok(())
    }

    pub async fn comment_deleted(&self, post_id: Uuid, comment_id: Uuid) -> Result<(), RepoError> {
        self.apply(CounterKey::comments(post_id), -1).await?;
        self.bus.on_mutation(ObjectRef::post(post_id), MutationKind::Updated);
        self.bus
            .on_mutation(ObjectRef::comment(comment_id), MutationKind::Deleted);
        // Likes of a deleted comment are gone with it.
        self.counters
            .forget(&CounterKey::likes(CounterTarget::Comment, comment_id));
        Ok(())
    }

    pub fn object_mutated(&self, object: ObjectRef, mutation: MutationKind) {
        self.bus.on_mutation(object, mutation);
    }

    pub fn follow_changed(&self, edge: FollowEdge) {
        self.bus.on_relationship_changed(edge);
    }

    async fn apply(&self, key: CounterKey, delta: i64) -> Result<(), RepoError> {
        let counts = Arc::clone(&self.counts);
        let value = self
            .counters
            .refresh_or_increment(&key, delta, || {
                let counts = Arc::clone(&counts);
                async move { durable_count(counts.as_ref(), &key).await }
            })
            .await?;

        debug!(
            target = "application::engagement",
            target_kind = key.target().as_str(),
            target_id = %key.target_id(),
            delta,
            value = ?value,
            "counter adjusted"
        );
        Ok(())
    }
}
