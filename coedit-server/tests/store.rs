//! Tests for the in-memory session store's CAS contract and expiry.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coedit_server::messages::UpdateSessionRequest;
use coedit_server::store::{MemorySessionStore, SessionId, SessionStore, StoreError};
use tokio::time;

fn edit(user_id: &str, base: &str, new: &str, cursor: i64) -> UpdateSessionRequest {
    UpdateSessionRequest {
        user_id: user_id.to_string(),
        base_text: base.to_string(),
        new_text: new.to_string(),
        cursor_pos: cursor,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_and_load() -> Result<()> {
    let store = MemorySessionStore::new();
    let id = store.create_session().await?;
    let session = store.load_session(&id).await?;
    assert_eq!(session.text, "");
    assert_eq!(session.language, "plaintext");
    assert!(session.users.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_key_fails_fast() -> Result<()> {
    let store = MemorySessionStore::new();
    let id = SessionId::from_str("missing").unwrap();
    assert!(matches!(
        store.load_session(&id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.update_session(&id, edit("u1", "", "x", 1)).await,
        Err(StoreError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_updates_linearize() -> Result<()> {
    let store = Arc::new(MemorySessionStore::new());
    let id = store.create_session().await?;

    let mut tasks = Vec::new();
    for letter in "abcdefghij".chars() {
        let store = Arc::clone(&store);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let user = format!("user-{letter}");
            store
                .update_session(&id, edit(&user, "", &letter.to_string(), 1))
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let session = store.load_session(&id).await?;

    // Every edit landed exactly once, in some serial order.
    let mut letters: Vec<char> = session.text.chars().collect();
    letters.sort_unstable();
    assert_eq!(letters, "abcdefghij".chars().collect::<Vec<_>>());

    // Join indices are unique and every position is in bounds.
    let mut indices: Vec<usize> = session.users.values().map(|u| u.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());
    for user in session.users.values() {
        assert!(user.position <= session.text.len());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expiry_is_refreshed_on_update() -> Result<()> {
    let store = MemorySessionStore::new();
    let id = store.create_session().await?;

    time::advance(Duration::from_secs(6 * 24 * 3600)).await;
    store.update_session(&id, edit("u1", "", "keepalive", 0)).await?;

    // Two more days: inside the refreshed window.
    time::advance(Duration::from_secs(2 * 24 * 3600)).await;
    assert_eq!(store.load_session(&id).await?.text, "keepalive");

    // Eight more days: past it.
    time::advance(Duration::from_secs(8 * 24 * 3600)).await;
    assert!(matches!(
        store.load_session(&id).await,
        Err(StoreError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_invalid_session_ids_are_rejected() {
    assert!(SessionId::from_str("").is_err());
    assert!(SessionId::from_str("has/slash").is_err());
    assert!(SessionId::from_str(&"x".repeat(65)).is_err());
    assert!(SessionId::from_str("ab54f2c9-11f0-4ac3-9f6a-72b5340a6df1").is_ok());
}
