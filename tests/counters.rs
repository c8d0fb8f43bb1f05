mod support;

use std::sync::Arc;

use feedline::application::engagement::EngagementHooks;
use feedline::application::fanout::FanoutSettings;
use feedline::application::pagination::{FeedPage, FeedQuery};
use feedline::application::repos::CountsRepo;
use feedline::application::timeline::FeedItem;
use feedline::cache::{CacheConfig, MutationTarget};
use feedline::domain::entities::{FollowEdge, ObjectRef, ObjectSnapshot};
use feedline::domain::types::{CounterKey, CounterTarget, MutationKind, ObjectKind};
use serde_json::json;
use support::{Harness, at};
use tokio::task::JoinSet;
use uuid::Uuid;

fn followed(page: &FeedPage<FeedItem>) -> bool {
    page.entries[0].author_followed
}

fn shared_hooks(harness: &Harness) -> Arc<EngagementHooks> {
    Arc::new(EngagementHooks::new(
        harness.counters.clone(),
        harness.counts.clone(),
        harness.bus.clone(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_likes_on_a_warm_counter_all_land() {
    let harness = Harness::new();
    let post_id = Uuid::new_v4();
    let key = CounterKey::likes(CounterTarget::Post, post_id);
    harness.counts.set(key, 40);

    let warmed = harness
        .counters
        .get(&key, || async { Ok(40) })
        .await
        .expect("warm");
    assert_eq!(warmed, 40);

    let hooks = shared_hooks(&harness);
    let mut tasks = JoinSet::new();
    for _ in 0..64 {
        let hooks = Arc::clone(&hooks);
        tasks.spawn(async move { hooks.like_created(CounterTarget::Post, post_id).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("task").expect("like applied");
    }

    let value = harness
        .counters
        .get(&key, || async { Ok(0) })
        .await
        .expect("read");
    assert_eq!(value, 104);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_on_a_cold_counter_initialize_once() {
    let harness = Harness::new();
    let key = CounterKey::comments(Uuid::new_v4());

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let counters = harness.counters.clone();
        tasks.spawn(async move { counters.increment(&key, 1, || async { Ok(7) }).await });
    }
    while let Some(result) = tasks.join_next().await {
        let value = result.expect("task").expect("increment");
        assert!(value.is_some());
    }

    let value = harness
        .counters
        .get(&key, || async { Ok(0) })
        .await
        .expect("read");
    assert_eq!(value, 57);
}

#[tokio::test]
async fn hooks_track_durable_counts_from_a_cold_start() {
    let harness = Harness::new();
    let post_id = Uuid::new_v4();
    let likes = CounterKey::likes(CounterTarget::Post, post_id);
    harness.counts.set(likes, 3);

    // The durable write lands first, then the hook runs.
    harness.counts.add(likes, 1);
    harness
        .engagement
        .like_created(CounterTarget::Post, post_id)
        .await
        .expect("like");
    harness.counts.add(likes, 1);
    harness
        .engagement
        .like_created(CounterTarget::Post, post_id)
        .await
        .expect("like");
    harness.counts.add(likes, -1);
    harness
        .engagement
        .like_deleted(CounterTarget::Post, post_id)
        .await
        .expect("unlike");

    let cached = harness
        .counters
        .get(&likes, || async { Ok(-1) })
        .await
        .expect("read");
    assert_eq!(cached, 4);

    // After a flush the counter is recomputed and agrees.
    harness.kv.flush_all().expect("flush");
    let recomputed = harness
        .counters
        .get(&likes, || async {
            let count = harness.counts.count_relations(&likes).await?;
            Ok(count as i64)
        })
        .await
        .expect("read");
    assert_eq!(recomputed, cached);
}

#[tokio::test]
async fn likes_committed_before_their_hooks_are_not_double_counted() {
    let harness = Harness::new();
    let post_id = Uuid::new_v4();
    let likes = CounterKey::likes(CounterTarget::Post, post_id);
    harness.counts.set(likes, 5);

    // Both writes commit before either hook runs.
    harness.counts.add(likes, 1);
    harness.counts.add(likes, 1);
    for _ in 0..2 {
        harness
            .engagement
            .like_created(CounterTarget::Post, post_id)
            .await
            .expect("like");
    }

    let cached = harness
        .counters
        .get(&likes, || async { Ok(-1) })
        .await
        .expect("read");
    assert_eq!(cached, 7);
}

#[tokio::test]
async fn interleaved_commits_and_hooks_match_the_store() {
    let harness = Harness::new();
    let post_id = Uuid::new_v4();
    let comments = CounterKey::comments(post_id);
    harness.counts.set(comments, 5);

    for _ in 0..3 {
        harness.counts.add(comments, 1);
        harness
            .engagement
            .comment_created(post_id, Uuid::new_v4())
            .await
            .expect("comment");
    }
    harness.counts.add(comments, -1);
    harness
        .engagement
        .comment_deleted(post_id, Uuid::new_v4())
        .await
        .expect("delete");

    let cached = harness
        .counters
        .get(&comments, || async { Ok(-1) })
        .await
        .expect("read");
    assert_eq!(cached, 7);
    assert_eq!(
        harness.counts.count_relations(&comments).await.expect("count"),
        7
    );
}

#[tokio::test]
async fn counter_keys_are_evicted_at_capacity() {
    let harness = Harness::with_config(
        CacheConfig {
            max_keys: 100,
            ..CacheConfig::default()
        },
        FanoutSettings::default(),
    );
    let keys: Vec<CounterKey> = (0..5_000)
        .map(|_| CounterKey::comments(Uuid::new_v4()))
        .collect();
    for key in &keys {
        harness
            .counters
            .get(key, || async { Ok(1) })
            .await
            .expect("read");
    }

    // The oldest counter was dropped and is computed again.
    let recomputed = harness
        .counters
        .get(&keys[0], || async { Ok(2) })
        .await
        .expect("read");
    assert_eq!(recomputed, 2);
    let newest = harness
        .counters
        .get(&keys[4_999], || async { Ok(3) })
        .await
        .expect("read");
    assert_eq!(newest, 1);

    assert!(harness.kv.flush_all().expect("flush") <= 100);
}

#[tokio::test]
async fn deleting_a_comment_forgets_its_likes() {
    let harness = Harness::new();
    let post_id = Uuid::new_v4();
    let comment_id = Uuid::new_v4();
    let comments = CounterKey::comments(post_id);
    let comment_likes = CounterKey::likes(CounterTarget::Comment, comment_id);

    harness.counts.set(comments, 1);
    harness
        .engagement
        .comment_created(post_id, comment_id)
        .await
        .expect("comment created");
    harness
        .counters
        .get(&comment_likes, || async { Ok(6) })
        .await
        .expect("warm comment likes");

    harness.counts.set(comments, 0);
    harness
        .engagement
        .comment_deleted(post_id, comment_id)
        .await
        .expect("comment deleted");

    let remaining = harness
        .counters
        .get(&comments, || async { Ok(-1) })
        .await
        .expect("comments");
    assert_eq!(remaining, 0);

    let likes = harness
        .counters
        .get(&comment_likes, || async { Ok(0) })
        .await
        .expect("comment likes");
    assert_eq!(likes, 0);

    let events = harness.bus.recent_events(10);
    assert!(events.iter().any(|event| matches!(
        event.target,
        MutationTarget::Object {
            object,
            mutation: MutationKind::Deleted,
        } if object == ObjectRef::comment(comment_id)
    )));
}

#[tokio::test]
async fn mutated_objects_are_reloaded() {
    let harness = Harness::new();
    let author = Uuid::new_v4();
    let post_id = harness.publish(author, at(0)).await;

    let first = harness
        .timeline
        .page_hydrated(author, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    let loads = harness.objects.loads();
    assert_eq!(
        first.entries[0].post.as_ref().map(|post| post.body.clone()),
        Some(json!({ "body": format!("post {post_id}") }))
    );

    harness.objects.put(ObjectSnapshot {
        kind: ObjectKind::Post,
        id: post_id,
        owner_id: Some(author),
        created_at: at(0),
        body: json!({ "body": "edited" }),
    });

    // Still cached until the owner reports the mutation.
    let stale = harness
        .timeline
        .page_hydrated(author, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert_eq!(harness.objects.loads(), loads);
    assert_ne!(
        stale.entries[0].post.as_ref().map(|post| post.body.clone()),
        Some(json!({ "body": "edited" }))
    );

    harness
        .engagement
        .object_mutated(ObjectRef::post(post_id), MutationKind::Updated);
    let fresh = harness
        .timeline
        .page_hydrated(author, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert_eq!(harness.objects.loads(), loads + 1);
    assert_eq!(
        fresh.entries[0].post.as_ref().map(|post| post.body.clone()),
        Some(json!({ "body": "edited" }))
    );
}

#[tokio::test]
async fn deleted_posts_hydrate_as_missing() {
    let harness = Harness::new();
    let author = Uuid::new_v4();
    let post_id = harness.publish(author, at(0)).await;

    harness.objects.remove(ObjectRef::post(post_id));
    harness
        .engagement
        .object_mutated(ObjectRef::post(post_id), MutationKind::Deleted);

    let page = harness
        .timeline
        .page_hydrated(author, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert_eq!(page.entries.len(), 1);
    assert!(page.entries[0].post.is_none());
    assert!(!page.entries[0].author_followed);
}

#[tokio::test]
async fn follow_changes_refresh_the_followed_flag() {
    let harness = Harness::new();
    let author = Uuid::new_v4();
    let follower = harness.add_followers(author, 1)[0];
    harness.publish(author, at(0)).await;

    let page = harness
        .timeline
        .page_hydrated(follower, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert!(followed(&page));

    harness.directory.unfollow(follower, author);
    let cached = harness
        .timeline
        .page_hydrated(follower, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert!(followed(&cached));

    harness.engagement.follow_changed(FollowEdge {
        from_user_id: follower,
        to_user_id: author,
    });
    let refreshed = harness
        .timeline
        .page_hydrated(follower, FeedQuery::first(10), &harness.hydrator)
        .await
        .expect("page");
    assert!(!followed(&refreshed));
}
