//! Tests for the session HTTP API.

use std::sync::Arc;

use anyhow::Result;
use axum::http::StatusCode;
use common::*;
use coedit_server::{ServerState, server};
use serde_json::json;

pub mod common;

#[tokio::test]
async fn test_new_session_defaults() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    let id = client.new_session().await?;
    assert!(!id.is_empty());

    let session = client.get_json(&format!("api/{id}")).await?;
    assert_eq!(session["Text"], "");
    assert_eq!(session["Language"], "plaintext");
    assert_eq!(session["Users"], json!({}));
    assert_eq!(session["Running"], false);
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_independent() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    let first = client.new_session().await?;
    let second = client.new_session().await?;
    assert_ne!(first, second);

    client
        .post_form(
            &format!("api/{first}"),
            &[
                ("UserID", "u1"),
                ("BaseText", ""),
                ("NewText", "only in first"),
                ("CursorPos", "0"),
            ],
        )
        .await?;

    let session = client.get_json(&format!("api/{second}")).await?;
    assert_eq!(session["Text"], "");
    Ok(())
}

#[tokio::test]
async fn test_missing_session_is_404() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    assert_eq!(client.get_status("api/no-such-session").await?, StatusCode::NOT_FOUND);

    let (status, _) = client
        .post_form(
            "api/no-such-session",
            &[("UserID", "u1"), ("BaseText", ""), ("NewText", "x"), ("CursorPos", "1")],
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_one_shot_update() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    let id = client.new_session().await?;
    let (status, resp) = client
        .post_form(
            &format!("api/{id}"),
            &[
                ("UserID", "u1"),
                ("BaseText", ""),
                ("NewText", "abc"),
                ("CursorPos", "3"),
            ],
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["NewText"], "abc");
    assert_eq!(resp["Language"], "plaintext");
    assert_eq!(resp["Users"][0]["ID"], "u1");
    assert_eq!(resp["Users"][0]["Index"], 0);
    assert_eq!(resp["Users"][0]["Position"], 3);

    let session = client.get_json(&format!("api/{id}")).await?;
    assert_eq!(session["Text"], "abc");
    Ok(())
}

#[tokio::test]
async fn test_language_sticks_until_overwritten() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    let id = client.new_session().await?;
    client
        .post_form(
            &format!("api/{id}"),
            &[
                ("UserID", "u1"),
                ("BaseText", ""),
                ("NewText", "print(1)"),
                ("CursorPos", "0"),
                ("Language", "python"),
            ],
        )
        .await?;

    // An empty language in a later request leaves the session's alone.
    let (_, resp) = client
        .post_form(
            &format!("api/{id}"),
            &[
                ("UserID", "u1"),
                ("BaseText", "print(1)"),
                ("NewText", "print(1)"),
                ("CursorPos", "0"),
            ],
        )
        .await?;
    assert_eq!(resp["Language"], "python");
    Ok(())
}

#[tokio::test]
async fn test_side_channel_fields_are_scoped() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary()))).await?;

    let id = client.new_session().await?;
    client
        .post_form(
            &format!("api/{id}"),
            &[
                ("UserID", "u1"),
                ("BaseText", ""),
                ("NewText", ""),
                ("CursorPos", "0"),
                ("UpdateInputText", "true"),
                ("InputText", "42"),
            ],
        )
        .await?;

    // A request without the flag must not clobber the stored input.
    client
        .post_form(
            &format!("api/{id}"),
            &[
                ("UserID", "u1"),
                ("BaseText", ""),
                ("NewText", ""),
                ("CursorPos", "0"),
                ("InputText", "ignored"),
            ],
        )
        .await?;

    let session = client.get_json(&format!("api/{id}")).await?;
    assert_eq!(session["InputText"], "42");
    Ok(())
}
