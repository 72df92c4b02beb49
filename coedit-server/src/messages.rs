//! Wire types exchanged with editor clients.
//!
//! Field names keep the PascalCase spelling of the original protocol so
//! existing frontends keep working. Every field is defaulted because most
//! frames are partial: a ping carries nothing else, a form post has no peer
//! list, and peer overrides carry only an id and a position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One participant's caret and selection inside a session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct User {
    /// Opaque identifier, unique within a session.
    #[serde(rename = "ID")]
    pub id: String,
    /// Small integer assigned on first join, stable for the session lifetime.
    /// Marker glyphs are derived from it.
    pub index: usize,
    /// Byte offset of the caret into the session text.
    pub position: usize,
    /// Whether a selection range is active.
    pub has_selection: bool,
    /// Selection start, meaningful only when `has_selection`.
    pub selection_start: usize,
    /// Selection end, meaningful only when `has_selection`.
    pub selection_end: usize,
    /// Timestamp of this user's most recent request.
    pub last_edit: DateTime<Utc>,
}

/// A client's proposed edit, or a keep-alive ping.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateSessionRequest {
    /// Keep-alive; short-circuits in the read loop without touching the store.
    pub ping: bool,
    /// The text the client diffed against (its snapshot before the edit).
    pub base_text: String,
    /// The text the client holds after its local edit.
    pub new_text: String,
    /// Caret byte offset into `new_text`; out-of-range values are discarded.
    pub cursor_pos: i64,
    /// Whether the client has an active selection.
    pub has_selection: bool,
    /// Selection start in `new_text`.
    pub selection_start: i64,
    /// Selection end in `new_text`.
    pub selection_end: i64,
    /// Identity of the requesting user.
    #[serde(rename = "UserID")]
    pub user_id: String,
    /// Optional language change; empty means "keep".
    pub language: String,
    /// Peer cursor overrides observed by this client, honored on the
    /// non-conflicting fast path only.
    pub users: Vec<User>,
    /// Overwrite the executor input buffer with `input_text`.
    pub update_input_text: bool,
    /// Executor stdin contents.
    pub input_text: String,
    /// Overwrite the executor output buffers with `stdout`/`stderr`.
    pub update_output_text: bool,
    /// Executor stdout contents.
    pub stdout: String,
    /// Executor stderr contents.
    pub stderr: String,
    /// Overwrite the executor running flag with `running`.
    pub update_running_state: bool,
    /// Whether an execution is in flight.
    pub running: bool,
}

/// The merged session state broadcast back to every participant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateSessionResponse {
    /// Set on keep-alive replies; all other fields are empty then.
    pub ping: bool,
    /// The authoritative text after the merge.
    pub new_text: String,
    /// Current session language.
    pub language: String,
    /// Every participant with positions translated into `new_text`, ordered
    /// by join index.
    pub users: Vec<User>,
    /// Executor side-channel passthrough, mirroring the request flags.
    pub update_input_text: bool,
    /// Executor stdin contents.
    pub input_text: String,
    /// See `update_input_text`.
    pub update_output_text: bool,
    /// Executor stdout contents.
    pub stdout: String,
    /// Executor stderr contents.
    pub stderr: String,
    /// See `update_input_text`.
    pub update_running_state: bool,
    /// Whether an execution is in flight.
    pub running: bool,
}

impl UpdateSessionResponse {
    /// The reply to a keep-alive frame.
    pub fn pong() -> Self {
        Self {
            ping: true,
            ..Default::default()
        }
    }
}
