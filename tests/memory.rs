//! Tests for conversation memory — the message log over the TTL store.
//!
//! Test categories:
//! 1. Id resolution: minting, last-used pointer, explicit ids
//! 2. Append and render: ordering, summarized prefix, raw access
//! 3. Summarization: prefix replacement, tail retention, idempotence
//! 4. TTL expiry and degraded mode
//! 5. Context rendering round trips

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use drover::error::DroverError;
use drover::memory::{
    CURRENT_REQUEST_DELIMITER, ConversationMemory, InMemoryKv, KvStore, Role, SUMMARY_TAG,
    compose_prompt, render_messages,
};

// ===========================================================================
// Helpers
// ===========================================================================

fn memory() -> ConversationMemory {
    ConversationMemory::new(Arc::new(InMemoryKv::new()), Duration::from_secs(60))
}

fn memory_with_ttl(ttl: Duration) -> ConversationMemory {
    ConversationMemory::new(Arc::new(InMemoryKv::new()), ttl)
}

/// A backend that is always down, for degraded-mode tests.
struct UnreachableKv;

#[async_trait]
impl KvStore for UnreachableKv {
    async fn get(&self, _key: &str) -> Result<Option<String>, DroverError> {
        Err(DroverError::StoreUnavailable("connection refused".into()))
    }
    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), DroverError> {
        Err(DroverError::StoreUnavailable("connection refused".into()))
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), DroverError> {
        Err(DroverError::StoreUnavailable("connection refused".into()))
    }
}

// ===========================================================================
// Id resolution
// ===========================================================================

#[tokio::test]
async fn resolving_without_an_id_reuses_the_last_conversation() {
    let mem = memory();
    let first = mem.resolve_conversation_id(None).await;
    let second = mem.resolve_conversation_id(None).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn force_new_conversation_moves_the_last_pointer() {
    let mem = memory();
    let first = mem.resolve_conversation_id(None).await;
    let fresh = mem.force_new_conversation().await;
    assert_ne!(first, fresh);
    assert_eq!(mem.resolve_conversation_id(None).await, fresh);
}

#[tokio::test]
async fn explicit_id_is_used_without_moving_the_last_pointer() {
    let mem = memory();
    let implicit = mem.resolve_conversation_id(None).await;
    let explicit = uuid::Uuid::new_v4();
    let resolved = mem.resolve_conversation_id(Some(explicit)).await;
    assert_eq!(resolved, explicit);
    // The pointer still names the implicitly created conversation.
    assert_eq!(mem.resolve_conversation_id(None).await, implicit);
}

// ===========================================================================
// Append and render
// ===========================================================================

#[tokio::test]
async fn appends_are_rendered_in_order_with_role_prefixes() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    mem.append(id, Role::User, "rename foo to bar").await;
    mem.append(id, Role::Assistant, "renamed ok").await;

    let messages = mem.render_context(id).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);

    let text = render_messages(&messages);
    assert_eq!(text, "user: rename foo to bar\n\nassistant: renamed ok");
}

#[tokio::test]
async fn raw_messages_bypass_the_summarized_prefix() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    for i in 0..5 {
        mem.append(id, Role::User, &format!("message {i}")).await;
    }
    mem.summarize(id, |_| async { Ok("the gist".to_string()) })
        .await
        .unwrap();

    assert_eq!(mem.raw_messages(id).await.len(), 5);
    assert_eq!(mem.render_context(id).await.len(), 4);
}

// ===========================================================================
// Summarization
// ===========================================================================

#[tokio::test]
async fn summarize_replaces_prefix_with_summary_plus_last_three() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    for i in 0..6 {
        mem.append(id, Role::Assistant, &format!("turn {i}")).await;
    }

    mem.summarize(id, |context| async move {
        assert!(context.contains("turn 0"));
        assert!(context.contains("turn 5"));
        Ok("compressed".to_string())
    })
    .await
    .unwrap();

    let rendered = mem.render_context(id).await;
    assert_eq!(rendered.len(), 4);
    assert!(rendered[0].content.starts_with(SUMMARY_TAG));
    assert!(rendered[0].content.contains("compressed"));
    assert_eq!(rendered[1].content, "turn 3");
    assert_eq!(rendered[2].content, "turn 4");
    assert_eq!(rendered[3].content, "turn 5");
}

#[tokio::test]
async fn summarize_twice_replaces_the_previous_summary() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    for i in 0..6 {
        mem.append(id, Role::Assistant, &format!("turn {i}")).await;
    }

    mem.summarize(id, |_| async { Ok("first summary".to_string()) })
        .await
        .unwrap();
    mem.summarize(id, |_| async { Ok("second summary".to_string()) })
        .await
        .unwrap();

    let rendered = mem.render_context(id).await;
    // Bounded: the rendered context never grows past summary + kept tail.
    assert_eq!(rendered.len(), 4);
    assert!(rendered[0].content.contains("second summary"));
    assert!(!render_messages(&rendered).contains("first summary"));
}

#[tokio::test]
async fn summarizer_failure_leaves_the_conversation_untouched() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    mem.append(id, Role::User, "hello").await;

    let result = mem
        .summarize(id, |_| async { Err(DroverError::Other("model down".into())) })
        .await;
    assert!(result.is_err());
    assert_eq!(mem.render_context(id).await.len(), 1);
}

// ===========================================================================
// TTL expiry and degraded mode
// ===========================================================================

#[tokio::test]
async fn conversations_expire_after_the_ttl() {
    let mem = memory_with_ttl(Duration::from_millis(50));
    let id = mem.force_new_conversation().await;
    mem.append(id, Role::User, "ephemeral").await;

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(mem.render_context(id).await.is_empty());
}

#[tokio::test]
async fn appends_refresh_the_ttl() {
    let mem = memory_with_ttl(Duration::from_millis(120));
    let id = mem.force_new_conversation().await;
    mem.append(id, Role::User, "one").await;
    tokio::time::sleep(Duration::from_millis(70)).await;
    mem.append(id, Role::User, "two").await;
    tokio::time::sleep(Duration::from_millis(70)).await;
    // 140ms since creation, 70ms since last touch: still alive.
    assert_eq!(mem.render_context(id).await.len(), 2);
}

#[tokio::test]
async fn unreachable_store_degrades_silently() {
    let mem = ConversationMemory::new(Arc::new(UnreachableKv), Duration::from_secs(60));

    // Ids are still minted, nothing panics, context is just empty.
    let id = mem.resolve_conversation_id(None).await;
    mem.append(id, Role::User, "lost to the void").await;
    assert!(mem.render_context(id).await.is_empty());
    assert!(mem.raw_messages(id).await.is_empty());
    mem.summarize(id, |_| async { Ok("unused".to_string()) })
        .await
        .unwrap();
}

// ===========================================================================
// Context rendering round trips
// ===========================================================================

#[tokio::test]
async fn full_prompt_splits_back_into_context_and_request() {
    let mem = memory();
    let id = mem.force_new_conversation().await;
    mem.append(id, Role::User, "first ask").await;
    mem.append(id, Role::Assistant, "first answer").await;

    let context = render_messages(&mem.render_context(id).await);
    let full = compose_prompt(&context, "second ask");

    let (recovered_context, request) = full.split_once(CURRENT_REQUEST_DELIMITER).unwrap();
    assert_eq!(recovered_context.trim_end(), context);
    assert_eq!(request, "second ask");
}

#[test]
fn empty_context_composes_to_the_bare_request() {
    assert_eq!(compose_prompt("", "just do it"), "just do it");
}
