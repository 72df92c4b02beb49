//! Session state and the cursor-preserving merge engine.

use std::collections::HashMap;
use std::mem;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::{UpdateSessionRequest, UpdateSessionResponse, User};
use crate::patch::Patch;

/// Largest document accepted from a single edit.
const MAX_TEXT_LEN: usize = 256 * 1024;

/// Most participants a single session will admit. Each participant consumes
/// three glyphs of the reserved marker block.
pub const MAX_USERS_PER_SESSION: usize = 100;

/// First code point of the block reserved for cursor marker glyphs. Input
/// text is overwhelmingly unlikely to contain this range.
const MARKER_BASE: u32 = 0x1098;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Anchor {
    Cursor = 0,
    SelectionStart = 1,
    SelectionEnd = 2,
}

fn marker_glyph(index: usize, anchor: Anchor) -> char {
    let point = MARKER_BASE + 3 * index as u32 + anchor as u32;
    char::from_u32(point).expect("marker block lies within valid scalar values")
}

fn is_marker(c: char) -> bool {
    (MARKER_BASE..MARKER_BASE + 3 * MAX_USERS_PER_SESSION as u32).contains(&(c as u32))
}

/// The shared editable document plus participant metadata.
///
/// A session is mutated only inside the store's compare-and-swap closure;
/// everywhere else it is an immutable snapshot owned by its reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Session {
    /// Authoritative document content.
    pub text: String,
    /// Language tag for editor syntax highlighting.
    pub language: String,
    /// Executor stdin buffer (opaque side channel).
    pub input_text: String,
    /// Executor stdout buffer (opaque side channel).
    pub stdout: String,
    /// Executor stderr buffer (opaque side channel).
    pub stderr: String,
    /// Whether an execution is in flight (opaque side channel).
    pub running: bool,
    /// Timestamp of the most recent mutation.
    pub last_edit: DateTime<Utc>,
    /// Participants keyed by user id. Entries are never removed, so join
    /// indices stay unique for the session lifetime.
    pub users: HashMap<String, User>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            text: String::new(),
            language: "plaintext".to_string(),
            input_text: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            running: false,
            last_edit: DateTime::<Utc>::default(),
            users: HashMap::new(),
        }
    }
}

/// A marker glyph waiting to be spliced into one side of the merge.
struct MarkerSeq {
    user_id: String,
    position: usize,
    glyph: char,
}

/// Collects every marker for every user, ordered by position descending so
/// that earlier insertions do not invalidate later offsets.
fn markers_to_insert(users: &HashMap<String, User>) -> Vec<MarkerSeq> {
    let mut ordered: Vec<&User> = users.values().collect();
    ordered.sort_by_key(|u| u.index);

    let mut seqs = Vec::new();
    for user in ordered {
        seqs.push(MarkerSeq {
            user_id: user.id.clone(),
            position: user.position,
            glyph: marker_glyph(user.index, Anchor::Cursor),
        });
        if user.has_selection {
            seqs.push(MarkerSeq {
                user_id: user.id.clone(),
                position: user.selection_start,
                glyph: marker_glyph(user.index, Anchor::SelectionStart),
            });
            seqs.push(MarkerSeq {
                user_id: user.id.clone(),
                position: user.selection_end,
                glyph: marker_glyph(user.index, Anchor::SelectionEnd),
            });
        }
    }
    seqs.sort_by(|a, b| b.position.cmp(&a.position));
    seqs
}

/// Snaps a byte offset down to the nearest character boundary of `text`,
/// clamping past-the-end offsets to the length.
fn snap_boundary(text: &str, pos: usize) -> usize {
    let mut p = pos.min(text.len());
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

fn insert_glyph(text: &mut String, pos: usize, glyph: char) {
    let p = snap_boundary(text, pos);
    text.insert(p, glyph);
}

/// Byte offsets, in the stripped text, of every marker glyph present in
/// `marked`.
fn marker_offsets(marked: &str) -> HashMap<char, usize> {
    let mut offsets = HashMap::new();
    let mut stripped_len = 0usize;
    for c in marked.chars() {
        if is_marker(c) {
            offsets.insert(c, stripped_len);
        } else {
            stripped_len += c.len_utf8();
        }
    }
    offsets
}

/// Clamps the caret and selection of a request into `new_text`. Out-of-range
/// carets are discarded; selections are clamped, reordered, and zeroed when
/// inactive.
fn normalize(req: &mut UpdateSessionRequest) {
    let len = req.new_text.len() as i64;
    if req.cursor_pos < 0 || req.cursor_pos > len {
        req.cursor_pos = 0;
    }
    if req.has_selection {
        req.selection_start = req.selection_start.clamp(0, len);
        req.selection_end = req.selection_end.clamp(0, len);
        if req.selection_start > req.selection_end {
            mem::swap(&mut req.selection_start, &mut req.selection_end);
        }
    } else {
        req.selection_start = 0;
        req.selection_end = 0;
    }
}

impl Session {
    /// Merges a client's proposed edit into this session, repositioning every
    /// participant's caret and selection into the merged text, and composes
    /// the response to broadcast.
    ///
    /// Pure apart from mutating `self`; performs no I/O.
    pub fn update(&mut self, mut req: UpdateSessionRequest) -> Result<UpdateSessionResponse> {
        normalize(&mut req);
        if req.new_text.len() > MAX_TEXT_LEN {
            bail!(
                "proposed text length {} is greater than {} maximum",
                req.new_text.len(),
                MAX_TEXT_LEN
            );
        }
        self.upsert_requesting_user(&req)?;

        // No text change at all: metadata only.
        if self.text == req.base_text && req.base_text == req.new_text {
            return Ok(self.compose_response(&req));
        }

        // Non-conflicting fast path: the client's base matches the server, so
        // its text is adopted verbatim and its view of peer cursors is
        // trusted.
        if self.text == req.base_text {
            for peer in &req.users {
                if peer.id == req.user_id {
                    continue;
                }
                if let Some(user) = self.users.get_mut(&peer.id) {
                    user.position = peer.position;
                    user.has_selection = peer.has_selection;
                    user.selection_start = peer.selection_start;
                    user.selection_end = peer.selection_end;
                }
            }
            self.text = req.new_text.clone();
            self.clamp_users();
            return Ok(self.compose_response(&req));
        }

        self.merge(&req);
        Ok(self.compose_response(&req))
    }

    /// Three-way merge of the client's edit against diverged server text.
    fn merge(&mut self, req: &UpdateSessionRequest) {
        let mut server_text = mem::take(&mut self.text);
        let mut proposed = req.new_text.clone();

        for seq in markers_to_insert(&self.users) {
            if seq.user_id == req.user_id {
                insert_glyph(&mut proposed, seq.position, seq.glyph);
            } else {
                insert_glyph(&mut server_text, seq.position, seq.glyph);
            }
        }

        let patch = Patch::make(&req.base_text, &proposed);
        let merged = patch.apply(&server_text, is_marker);

        let offsets = marker_offsets(&merged);
        for user in self.users.values_mut() {
            user.position = offsets
                .get(&marker_glyph(user.index, Anchor::Cursor))
                .copied()
                .unwrap_or(0);
            if user.has_selection {
                user.selection_start = offsets
                    .get(&marker_glyph(user.index, Anchor::SelectionStart))
                    .copied()
                    .unwrap_or(0);
                user.selection_end = offsets
                    .get(&marker_glyph(user.index, Anchor::SelectionEnd))
                    .copied()
                    .unwrap_or(0);
                if user.selection_start > user.selection_end {
                    mem::swap(&mut user.selection_start, &mut user.selection_end);
                }
            }
        }

        self.text = merged.chars().filter(|c| !is_marker(*c)).collect();
    }

    /// Updates the requesting user in place, or admits it with the next join
    /// index. Positions refer to `req.new_text` until the merge relocates
    /// them.
    fn upsert_requesting_user(&mut self, req: &UpdateSessionRequest) -> Result<()> {
        let now = Utc::now();
        if let Some(user) = self.users.get_mut(&req.user_id) {
            user.position = req.cursor_pos as usize;
            user.has_selection = req.has_selection;
            user.selection_start = req.selection_start as usize;
            user.selection_end = req.selection_end as usize;
            user.last_edit = now;
        } else {
            if self.users.len() >= MAX_USERS_PER_SESSION {
                bail!(
                    "session is full: at most {} concurrent users",
                    MAX_USERS_PER_SESSION
                );
            }
            self.users.insert(
                req.user_id.clone(),
                User {
                    id: req.user_id.clone(),
                    index: self.users.len(),
                    position: req.cursor_pos as usize,
                    has_selection: req.has_selection,
                    selection_start: req.selection_start as usize,
                    selection_end: req.selection_end as usize,
                    last_edit: now,
                },
            );
        }
        Ok(())
    }

    /// Keeps every stored offset within `[0, len(text)]`.
    fn clamp_users(&mut self) {
        let len = self.text.len();
        for user in self.users.values_mut() {
            user.position = user.position.min(len);
            user.selection_start = user.selection_start.min(len);
            user.selection_end = user.selection_end.min(len);
        }
    }

    /// Applies the request's metadata (language, side-channel fields), stamps
    /// `last_edit`, and builds the broadcast response.
    fn compose_response(&mut self, req: &UpdateSessionRequest) -> UpdateSessionResponse {
        self.last_edit = Utc::now();
        if !req.language.is_empty() {
            self.language = req.language.clone();
        }
        if req.update_input_text {
            self.input_text = req.input_text.clone();
        }
        if req.update_output_text {
            self.stdout = req.stdout.clone();
            self.stderr = req.stderr.clone();
        }
        if req.update_running_state {
            self.running = req.running;
        }
        UpdateSessionResponse {
            ping: false,
            new_text: self.text.clone(),
            language: self.language.clone(),
            users: self.user_list(),
            update_input_text: req.update_input_text,
            input_text: self.input_text.clone(),
            update_output_text: req.update_output_text,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            update_running_state: req.update_running_state,
            running: self.running,
        }
    }

    /// The full session state as a broadcastable response, every side-channel
    /// flag set. The periodic sweep pushes these so late joiners converge
    /// without producing an edit.
    pub fn snapshot_response(&self) -> UpdateSessionResponse {
        UpdateSessionResponse {
            ping: false,
            new_text: self.text.clone(),
            language: self.language.clone(),
            users: self.user_list(),
            update_input_text: true,
            input_text: self.input_text.clone(),
            update_output_text: true,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            update_running_state: true,
            running: self.running,
        }
    }

    /// Participants ordered by join index, so encodings of the same state
    /// are byte-identical and broadcast dedup can fire.
    fn user_list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by_key(|u| u.index);
        users
    }

    /// Encodes the session for storage. The encoding round-trips exactly.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes a session previously encoded with [`Session::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
