//! Context resolution: formatting, ancestor lookup order, dedup and failure
//! signals.

use std::sync::Arc;
use std::time::Duration;

use tweetfilter_common::{MemoryStore, QuotedItem, Score, ThreadRelationship};

use super::*;
use crate::describer::DisabledDescriber;
use crate::testing::{CountingDescriber, MockFeedView};

struct Harness {
    cache: RatingCache,
    relationships: RelationshipTable,
    mapper: Arc<ThreadMapper>,
    view: Arc<MockFeedView>,
    resolver: ContextResolver,
}

fn harness_with(
    view: MockFeedView,
    describer: Arc<dyn MediaDescriber>,
    options: ContextOptions,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cache = RatingCache::new(store.clone(), Duration::from_millis(50));
    let relationships = RelationshipTable::new(store);
    let mapper = Arc::new(ThreadMapper::new(
        cache.clone(),
        relationships.clone(),
        Duration::from_secs(5),
        Duration::from_secs(10),
    ));
    let view = Arc::new(view);
    let resolver = ContextResolver::new(
        cache.clone(),
        relationships.clone(),
        mapper.clone(),
        view.clone(),
        describer,
        options,
    );
    Harness {
        cache,
        relationships,
        mapper,
        view,
        resolver,
    }
}

fn harness(view: MockFeedView) -> Harness {
    harness_with(view, Arc::new(DisabledDescriber), ContextOptions::default())
}

fn reply(to: &str, from_handle: &str, to_handle: &str) -> ThreadRelationship {
    ThreadRelationship {
        reply_to_id: Some(to.to_string()),
        from_handle: from_handle.to_string(),
        to_handle: Some(to_handle.to_string()),
        is_root: false,
        timestamp: 1,
    }
}

#[tokio::test]
async fn single_item_context() {
    let h = harness(MockFeedView::new().with_item(Item::new("42", "alice", "Hello")));

    let context = h.resolver.resolve("42").await.unwrap();
    assert_eq!(context, "[TWEET 42]\n@alice:\nHello");

    let entry = h.cache.get("42").unwrap();
    assert_eq!(entry.full_context.as_deref(), Some("[TWEET 42]\n@alice:\nHello"));
    assert!(entry.is_provisional());
    assert_eq!(h.view.context_fallback("42").as_deref(), Some(context.as_str()));
}

#[tokio::test]
async fn media_engagement_and_quoted_blocks() {
    let item = Item::new("1", "alice", "Look")
        .with_media(vec!["https://img/m1.jpg".into()])
        .with_engagement("10 likes")
        .with_quoted(QuotedItem {
            id: Some("7".into()),
            handle: "bob".into(),
            text: "quoted words".into(),
            media_urls: vec!["https://img/q1.jpg".into()],
        });
    let h = harness(MockFeedView::new().with_item(item));

    let context = h.resolver.resolve("1").await.unwrap();
    assert_eq!(
        context,
        "[TWEET 1]\n@alice:\nLook\n\
         [MEDIA_URLS]:\nhttps://img/m1.jpg\n\
         [ENGAGEMENT_STATS]:\n10 likes\n\
         [QUOTED_TWEET 7]:\n@bob:\nquoted words\n\
         [QUOTED_TWEET_MEDIA_URLS]:\nhttps://img/q1.jpg"
    );
}

#[tokio::test]
async fn descriptions_come_before_urls() {
    let item = Item::new("1", "alice", "Look").with_media(vec!["u1".into(), "u2".into()]);
    let describer = Arc::new(CountingDescriber::new());
    let h = harness_with(
        MockFeedView::new().with_item(item),
        describer.clone(),
        ContextOptions {
            describe_images: true,
            ..ContextOptions::default()
        },
    );

    let context = h.resolver.resolve("1").await.unwrap();
    assert!(context.contains(
        "[MEDIA_DESCRIPTION]:\n[IMAGE 1]: image of u1\n[IMAGE 2]: image of u2\n[MEDIA_URLS]:\nu1, u2"
    ));
    assert_eq!(describer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_calls_share_one_resolution() {
    let item = Item::new("1", "alice", "Look").with_media(vec!["u1".into()]);
    let describer = Arc::new(CountingDescriber::with_delay(Duration::from_millis(100)));
    let h = harness_with(
        MockFeedView::new().with_item(item),
        describer.clone(),
        ContextOptions {
            describe_images: true,
            ..ContextOptions::default()
        },
    );

    let results = futures::future::join_all((0..5).map(|_| h.resolver.resolve("1"))).await;

    assert_eq!(describer.calls(), 1);
    assert_eq!(h.view.lookups("1"), 1);
    let first = results[0].clone().unwrap();
    assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
    assert_eq!(h.resolver.pending(), 0);

    // Settled resolutions are not reused.
    h.resolver.resolve("1").await.unwrap();
    assert_eq!(describer.calls(), 2);
}

#[tokio::test]
async fn missing_media_is_an_extraction_failure_when_media_matters() {
    let item = Item::new("1", "alice", "Look").expecting_media();

    let h = harness_with(
        MockFeedView::new().with_item(item.clone()),
        Arc::new(DisabledDescriber),
        ContextOptions {
            model_supports_images: true,
            ..ContextOptions::default()
        },
    );
    assert_eq!(
        h.resolver.resolve("1").await,
        Err(ContextError::MediaExtraction("1".into()))
    );
    assert_eq!(h.resolver.pending(), 0);

    let h = harness(MockFeedView::new().with_item(item));
    assert!(h.resolver.resolve("1").await.is_ok());
}

#[tokio::test]
async fn unrendered_item_is_an_error() {
    let h = harness(MockFeedView::new());
    assert_eq!(
        h.resolver.resolve("99").await,
        Err(ContextError::NotRendered("99".into()))
    );
}

#[tokio::test]
async fn rendered_parent_is_resolved_recursively() {
    let h = harness(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "Root post"))
            .with_item(Item::new("2", "bob", "A reply")),
    );
    h.mapper.map(h.view.as_ref()).await;

    let context = h.resolver.resolve("2").await.unwrap();
    assert_eq!(
        context,
        "[TWEET 1]\n@alice:\nRoot post\n[REPLY]\n[TWEET 2]\n@bob:\nA reply"
    );
    assert_eq!(
        h.cache.get("1").unwrap().full_context.as_deref(),
        Some("[TWEET 1]\n@alice:\nRoot post")
    );
}

#[tokio::test]
async fn whole_chain_is_included() {
    let h = harness(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "one"))
            .with_item(Item::new("2", "bob", "two"))
            .with_item(Item::new("3", "carol", "three")),
    );
    h.mapper.map(h.view.as_ref()).await;

    let context = h.resolver.resolve("3").await.unwrap();
    assert_eq!(
        context,
        "[TWEET 1]\n@alice:\none\n[REPLY]\n[TWEET 2]\n@bob:\ntwo\n[REPLY]\n[TWEET 3]\n@carol:\nthree"
    );
}

#[tokio::test]
async fn cached_parent_context_wins() {
    let h = harness(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "Root post"))
            .with_item(Item::new("2", "bob", "A reply")),
    );
    h.mapper.map(h.view.as_ref()).await;
    h.cache.set(
        "1",
        CacheUpdate::new()
            .full_context("CACHED PARENT")
            .streaming(true),
    );
    h.view.set_context_fallback("1", "FALLBACK PARENT");

    let context = h.resolver.resolve("2").await.unwrap();
    assert!(context.starts_with("CACHED PARENT\n[REPLY]\n[TWEET 2]"));
}

#[tokio::test]
async fn element_fallback_beats_recursion() {
    let h = harness(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "Root post"))
            .with_item(Item::new("2", "bob", "A reply")),
    );
    h.mapper.map(h.view.as_ref()).await;
    h.view.set_context_fallback("1", "FALLBACK PARENT");

    let context = h.resolver.resolve("2").await.unwrap();
    assert!(context.starts_with("FALLBACK PARENT\n[REPLY]\n"));
    assert_eq!(h.view.lookups("1"), 0);
}

#[tokio::test]
async fn off_screen_parent_becomes_a_placeholder() {
    let h = harness(MockFeedView::new().with_item(Item::new("2", "bob", "A reply")));
    h.relationships
        .upsert_many([("2".to_string(), reply("1", "bob", "alice"))]);

    let context = h.resolver.resolve("2").await.unwrap();
    assert_eq!(
        context,
        "[REPLY TO TWEET 1]\n@alice:\n[CONTEXT UNAVAILABLE]\n[REPLY]\n[TWEET 2]\n@bob:\nA reply"
    );
}

#[tokio::test]
async fn reply_cycle_degrades_to_placeholder() {
    let h = harness(
        MockFeedView::new()
            .with_item(Item::new("1", "alice", "one"))
            .with_item(Item::new("2", "bob", "two")),
    );
    h.relationships.upsert_many([
        ("1".to_string(), reply("2", "alice", "bob")),
        ("2".to_string(), reply("1", "bob", "alice")),
    ]);

    let context = tokio::time::timeout(Duration::from_secs(1), h.resolver.resolve("2"))
        .await
        .expect("cyclic chain must not hang")
        .unwrap();
    assert!(context.starts_with("[REPLY TO TWEET 1]\n@alice:\n[CONTEXT UNAVAILABLE]"));
    assert_eq!(h.resolver.pending(), 0);
}

#[tokio::test]
async fn thread_media_from_earlier_items() {
    let h = harness(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "pic").with_media(vec!["m1".into()]))
            .with_item(Item::new("2", "bob", "nice")),
    );
    h.mapper.map(h.view.as_ref()).await;

    let context = h.resolver.resolve("2").await.unwrap();
    assert!(context.ends_with("[TWEET 2]\n@bob:\nnice\n[THREAD_MEDIA_URLS]:\nm1"));
}

#[tokio::test]
async fn write_back_keeps_a_finished_rating_final() {
    let h = harness(MockFeedView::new().with_item(Item::new("1", "alice", "Hello")));
    h.cache.set(
        "1",
        CacheUpdate::new()
            .score(Score::new(7).unwrap())
            .streaming(false),
    );

    h.resolver.resolve("1").await.unwrap();

    let entry = h.cache.get_final("1").unwrap();
    assert_eq!(entry.full_context.as_deref(), Some("[TWEET 1]\n@alice:\nHello"));
    assert_eq!(entry.individual_text.as_deref(), Some("Hello"));
}

#[tokio::test(start_paused = true)]
async fn abandoned_ancestor_still_settles_and_leaves_in_flight() {
    let h = harness_with(
        MockFeedView::new()
            .in_conversation("alice/status/1", Some("1"))
            .with_item(Item::new("1", "alice", "pic").with_media(vec!["m1".into()]))
            .with_item(Item::new("2", "bob", "nice")),
        Arc::new(CountingDescriber::with_delay(Duration::from_secs(60))),
        ContextOptions {
            describe_images: true,
            ancestor_timeout: Duration::from_secs(1),
            ..ContextOptions::default()
        },
    );
    h.mapper.map(h.view.as_ref()).await;

    let context = h.resolver.resolve("2").await.unwrap();
    assert!(context.starts_with("[REPLY TO TWEET 1]\n"));
    assert!(context.contains("[CONTEXT UNAVAILABLE]\n[REPLY]\n[TWEET 2]"));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.resolver.pending(), 0);

    // The parent finished in the background and its context is reused.
    let parent = h.cache.get("1").unwrap().full_context.unwrap();
    assert!(parent.starts_with("[TWEET 1]\n@alice:\npic"));
    let context = h.resolver.resolve("2").await.unwrap();
    assert!(context.starts_with(&format!("{parent}\n[REPLY]\n[TWEET 2]")));
}
