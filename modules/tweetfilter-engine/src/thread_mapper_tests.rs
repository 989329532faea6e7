//! Thread mapping: the cell walk, anchor handling, and the guarded pass.

use std::sync::Arc;
use std::time::Duration;

use tweetfilter_common::{CacheUpdate, Item, MemoryStore, Score};

use super::*;
use crate::testing::MockFeedView;

fn item(id: &str, author: &str) -> Item {
    Item::new(id, author, format!("text of {id}"))
}

fn anchor(id: &str, handle: &str) -> Anchor {
    Anchor {
        id: id.to_string(),
        handle: Some(handle.to_string()),
    }
}

fn by_id(mapped: &[MappedItem], id: &str) -> MappedItem {
    mapped
        .iter()
        .find(|m| m.id == id)
        .cloned()
        .unwrap_or_else(|| panic!("{id} not mapped"))
}

fn mapper_with(timeout: Duration) -> (ThreadMapper, RatingCache, RelationshipTable) {
    let store = Arc::new(MemoryStore::new());
    let cache = RatingCache::new(store.clone(), Duration::from_millis(1500));
    let relationships = RelationshipTable::new(store);
    let mapper = ThreadMapper::new(
        cache.clone(),
        relationships.clone(),
        timeout,
        Duration::from_secs(10),
    );
    (mapper, cache, relationships)
}

// ---------------------------------------------------------------------------
// map_cells
// ---------------------------------------------------------------------------

#[test]
fn consecutive_items_reply_to_the_one_above() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice")),
        Cell::item(10.0, item("2", "bob")),
        Cell::item(20.0, item("3", "carol")),
    ];
    let mapped = map_cells(&cells, None);

    assert!(by_id(&mapped, "1").is_root);
    assert_eq!(by_id(&mapped, "2").reply_to_id.as_deref(), Some("1"));
    assert_eq!(by_id(&mapped, "2").to_handle.as_deref(), Some("alice"));
    assert_eq!(by_id(&mapped, "3").reply_to_id.as_deref(), Some("2"));
}

#[test]
fn cells_are_ordered_by_vertical_position() {
    let cells = vec![
        Cell::item(20.0, item("3", "carol")),
        Cell::item(0.0, item("1", "alice")),
        Cell::item(10.0, item("2", "bob")),
    ];
    let mapped = map_cells(&cells, None);

    assert_eq!(
        mapped.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
        vec!["1", "2", "3"]
    );
    assert!(by_id(&mapped, "1").is_root);
}

#[test]
fn item_after_separator_replies_to_anchor() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice")),
        Cell::item(10.0, item("2", "bob")),
        Cell::separator(20.0),
        Cell::item(30.0, item("3", "carol")),
    ];
    let mapped = map_cells(&cells, Some(&anchor("1", "alice")));

    let third = by_id(&mapped, "3");
    assert_eq!(third.reply_to_id.as_deref(), Some("1"));
    assert_eq!(third.to_handle.as_deref(), Some("alice"));
    assert!(!third.is_root);
}

#[test]
fn item_after_separator_without_anchor_becomes_root() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice")),
        Cell::separator(10.0),
        Cell::item(20.0, item("2", "bob")),
        Cell::item(30.0, item("3", "carol")),
    ];
    let mapped = map_cells(&cells, None);

    assert!(by_id(&mapped, "2").is_root);
    assert_eq!(by_id(&mapped, "3").reply_to_id.as_deref(), Some("2"));
}

#[test]
fn anchor_after_separator_is_its_own_root() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice")),
        Cell::separator(10.0),
        Cell::item(20.0, item("9", "zed")),
    ];
    let mapped = map_cells(&cells, Some(&anchor("9", "zed")));
    assert!(by_id(&mapped, "9").is_root);
}

#[test]
fn first_item_is_root_even_behind_a_separator() {
    let cells = vec![
        Cell::separator(0.0),
        Cell::item(10.0, item("5", "eve")),
    ];
    let mapped = map_cells(&cells, Some(&anchor("1", "alice")));
    assert!(by_id(&mapped, "5").is_root);
}

#[test]
fn repeated_cells_for_one_item_are_mapped_once() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice")),
        Cell::item(10.0, item("1", "alice")),
        Cell::item(20.0, item("2", "bob")),
    ];
    let mapped = map_cells(&cells, None);
    assert_eq!(mapped.len(), 2);
    assert_eq!(by_id(&mapped, "2").reply_to_id.as_deref(), Some("1"));
}

#[test]
fn thread_media_flows_down_the_chain() {
    let cells = vec![
        Cell::item(0.0, item("1", "alice").with_media(vec!["m1".into()])),
        Cell::item(10.0, item("2", "bob").with_media(vec!["m2".into()])),
        Cell::item(20.0, item("3", "carol")),
        Cell::separator(30.0),
        Cell::item(40.0, item("4", "dan")),
    ];
    let mapped = map_cells(&cells, None);

    assert!(by_id(&mapped, "1").thread_media_urls.is_empty());
    assert_eq!(by_id(&mapped, "2").thread_media_urls, vec!["m1"]);
    assert_eq!(by_id(&mapped, "3").thread_media_urls, vec!["m1", "m2"]);
    assert!(by_id(&mapped, "4").thread_media_urls.is_empty());
}

// ---------------------------------------------------------------------------
// ThreadMapper
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn non_conversation_views_are_skipped() {
    let (mapper, _, _) = mapper_with(Duration::from_secs(5));
    let view = MockFeedView::new().with_item(item("1", "alice"));

    assert_eq!(
        mapper.map(&view).await,
        MappingOutcome::Skipped(SkipReason::NotAConversation)
    );
    assert!(!mapper.is_pending(&view));
}

#[tokio::test(start_paused = true)]
async fn successful_pass_records_relationships_and_releases_waiters() {
    let (mapper, _, relationships) = mapper_with(Duration::from_secs(5));
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"))
        .with_item(item("2", "bob"));

    assert!(mapper.is_pending(&view));
    mapper.wait("2");

    let outcome = mapper.map(&view).await;
    assert_eq!(
        outcome,
        MappingOutcome::Mapped {
            items: 2,
            released: vec!["2".to_string()]
        }
    );
    assert!(!mapper.is_pending(&view));
    assert!(!view.mapping_marker());

    let rel = relationships.get("2").unwrap();
    assert_eq!(rel.reply_to_id.as_deref(), Some("1"));
    assert_eq!(rel.from_handle, "bob");
    assert_eq!(
        mapper.thread_context("2").unwrap().reply_to.as_deref(),
        Some("alice")
    );
}

#[tokio::test(start_paused = true)]
async fn cooldown_suppresses_immediate_remapping() {
    let (mapper, _, _) = mapper_with(Duration::from_secs(5));
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"));

    assert!(matches!(mapper.map(&view).await, MappingOutcome::Mapped { .. }));
    assert_eq!(
        mapper.map(&view).await,
        MappingOutcome::Skipped(SkipReason::CoolingDown)
    );

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(matches!(mapper.map(&view).await, MappingOutcome::Mapped { .. }));
}

#[tokio::test(start_paused = true)]
async fn marker_on_the_conversation_blocks_reentry() {
    let (mapper, _, _) = mapper_with(Duration::from_secs(5));
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"));
    view.set_mapping_marker(true);

    assert_eq!(
        mapper.map(&view).await,
        MappingOutcome::Skipped(SkipReason::InProgress)
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_pass_keeps_previous_state_and_releases_waiters() {
    let (mapper, _, relationships) = mapper_with(Duration::ZERO);
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"))
        .with_item(item("2", "bob"));
    mapper.wait("2");

    let outcome = mapper.map(&view).await;
    assert_eq!(
        outcome,
        MappingOutcome::Failed {
            released: vec!["2".to_string()]
        }
    );
    assert!(relationships.is_empty());
    assert!(!mapper.is_running());
    assert!(!view.mapping_marker());
    assert!(!mapper.is_pending(&view));
}

#[tokio::test(start_paused = true)]
async fn anchor_off_screen_resolves_from_relationship_table() {
    let (mapper, _, relationships) = mapper_with(Duration::from_secs(5));
    relationships.upsert_many([(
        "1".to_string(),
        ThreadRelationship {
            reply_to_id: None,
            from_handle: "alice".to_string(),
            to_handle: None,
            is_root: true,
            timestamp: 1,
        },
    )]);
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("5", "eve"))
        .with_separator()
        .with_item(item("6", "finn"));

    mapper.map(&view).await;
    let rel = relationships.get("6").unwrap();
    assert_eq!(rel.reply_to_id.as_deref(), Some("1"));
    assert_eq!(rel.to_handle.as_deref(), Some("alice"));
}

#[tokio::test(start_paused = true)]
async fn mapped_items_with_cache_entries_get_thread_context() {
    let (mapper, cache, _) = mapper_with(Duration::from_secs(5));
    cache.set(
        "2",
        CacheUpdate::new()
            .score(Score::new(6).unwrap())
            .streaming(false),
    );
    let view = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"))
        .with_item(item("2", "bob"));

    mapper.map(&view).await;

    let context = cache.get("2").unwrap().thread_context.unwrap();
    assert_eq!(context.reply_to_id.as_deref(), Some("1"));
    assert!(!context.is_root);
    assert!(cache.get("1").is_none());
}

#[tokio::test(start_paused = true)]
async fn only_the_latest_conversation_counts_as_mapped() {
    let (mapper, _, _) = mapper_with(Duration::from_secs(5));
    let first = MockFeedView::new()
        .in_conversation("alice/status/1", Some("1"))
        .with_item(item("1", "alice"));
    let second = MockFeedView::new()
        .in_conversation("bob/status/5", Some("5"))
        .with_item(item("5", "bob"));

    mapper.map(&first).await;
    assert!(!mapper.is_pending(&first));

    mapper.map(&second).await;
    assert!(!mapper.is_pending(&second));
    assert!(mapper.is_pending(&first));
    assert_eq!(mapper.lock().attempted.as_deref(), Some("bob/status/5"));
}
