//! Character-level diff and patch between text snapshots.
//!
//! A [`Patch`] captures the edits between two versions of a text as context
//! hunks and can replay them onto a third text that has diverged from the
//! base. Application is best-effort: each hunk is located by searching around
//! its expected offset, and hunks that cannot be located are skipped.
//!
//! Characters for which the `transparent` predicate holds are invisible to
//! hunk matching and are carried through to the output untouched. The merge
//! engine uses this to keep cursor marker glyphs anchored while patching
//! around them.

use similar::{ChangeTag, TextDiff};

/// Context characters kept on either side of a change run.
const CONTEXT_MARGIN: usize = 4;

/// How far from its expected offset a hunk may be found before it is
/// declared unlocatable.
const SEARCH_RADIUS: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Equal(Vec<char>),
    Delete(Vec<char>),
    Insert(Vec<char>),
}

#[derive(Clone, Debug)]
struct Hunk {
    /// Character offset into the base text where the hunk's ops begin.
    start: usize,
    ops: Vec<Op>,
}

/// An edit script from one text to another, grouped into context hunks.
#[derive(Clone, Debug)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

impl Patch {
    /// Computes the character-level (Myers) diff from `base` to `new`.
    pub fn make(base: &str, new: &str) -> Self {
        let diff = TextDiff::from_chars(base, new);
        let mut runs: Vec<(ChangeTag, Vec<char>)> = Vec::new();
        for change in diff.iter_all_changes() {
            let tag = change.tag();
            match runs.last_mut() {
                Some((last, buf)) if *last == tag => buf.extend(change.value().chars()),
                _ => runs.push((tag, change.value().chars().collect())),
            }
        }

        let mut hunks = Vec::new();
        let mut cur: Option<Hunk> = None;
        let mut old_pos = 0usize;
        for i in 0..runs.len() {
            let (tag, text) = &runs[i];
            match tag {
                ChangeTag::Equal => {
                    let mut close = false;
                    if let Some(hunk) = cur.as_mut() {
                        let bridges = text.len() <= 2 * CONTEXT_MARGIN
                            && runs[i + 1..].iter().any(|(t, _)| *t != ChangeTag::Equal);
                        if bridges {
                            hunk.ops.push(Op::Equal(text.clone()));
                        } else {
                            let tail = text[..text.len().min(CONTEXT_MARGIN)].to_vec();
                            if !tail.is_empty() {
                                hunk.ops.push(Op::Equal(tail));
                            }
                            close = true;
                        }
                    }
                    if close && let Some(hunk) = cur.take() {
                        hunks.push(hunk);
                    }
                    old_pos += text.len();
                }
                ChangeTag::Delete | ChangeTag::Insert => {
                    let hunk = cur.get_or_insert_with(|| {
                        let lead: Vec<char> = match i.checked_sub(1).map(|j| &runs[j]) {
                            Some((ChangeTag::Equal, prev)) => {
                                prev[prev.len() - prev.len().min(CONTEXT_MARGIN)..].to_vec()
                            }
                            _ => Vec::new(),
                        };
                        let start = old_pos - lead.len();
                        let mut ops = Vec::new();
                        if !lead.is_empty() {
                            ops.push(Op::Equal(lead));
                        }
                        Hunk { start, ops }
                    });
                    if *tag == ChangeTag::Delete {
                        hunk.ops.push(Op::Delete(text.clone()));
                        old_pos += text.len();
                    } else {
                        hunk.ops.push(Op::Insert(text.clone()));
                    }
                }
            }
        }
        if let Some(hunk) = cur {
            hunks.push(hunk);
        }
        Patch { hunks }
    }

    /// Replays the patch onto `target`, which may have diverged from the base
    /// text. Characters matching `transparent` never participate in matching
    /// and are preserved in place; when a matched region is deleted, the
    /// transparent characters inside it survive at the deletion point.
    pub fn apply<F>(&self, target: &str, transparent: F) -> String
    where
        F: Fn(char) -> bool,
    {
        let chars: Vec<char> = target.chars().collect();
        let mut out: Vec<char> = Vec::with_capacity(chars.len());
        let mut pos = 0usize;
        let mut drift = 0isize;
        for hunk in &self.hunks {
            let expected =
                (hunk.start as isize + drift).clamp(pos as isize, chars.len() as isize) as usize;
            let Some(at) = locate(&chars, pos, expected, hunk, &transparent) else {
                continue;
            };
            out.extend_from_slice(&chars[pos..at]);
            pos = at;
            drift = at as isize - hunk.start as isize;
            for op in &hunk.ops {
                match op {
                    Op::Equal(run) => {
                        for _ in run.iter() {
                            while pos < chars.len() && transparent(chars[pos]) {
                                out.push(chars[pos]);
                                pos += 1;
                            }
                            if pos < chars.len() {
                                out.push(chars[pos]);
                                pos += 1;
                            }
                        }
                    }
                    Op::Delete(run) => {
                        for _ in run.iter() {
                            while pos < chars.len() && transparent(chars[pos]) {
                                out.push(chars[pos]);
                                pos += 1;
                            }
                            if pos < chars.len() {
                                pos += 1;
                            }
                        }
                    }
                    Op::Insert(run) => out.extend_from_slice(run),
                }
            }
        }
        out.extend_from_slice(&chars[pos..]);
        out.into_iter().collect()
    }
}

/// Finds the position nearest to `expected` (never before `min`) where the
/// hunk's non-transparent pre-image matches `chars`.
fn locate<F>(chars: &[char], min: usize, expected: usize, hunk: &Hunk, transparent: &F) -> Option<usize>
where
    F: Fn(char) -> bool,
{
    let limit = chars.len();
    for radius in 0..=SEARCH_RADIUS {
        let fwd = expected + radius;
        if fwd <= limit && matches_at(chars, fwd, hunk, transparent) {
            return Some(fwd);
        }
        if radius > 0
            && let Some(back) = expected.checked_sub(radius)
            && back >= min
            && matches_at(chars, back, hunk, transparent)
        {
            return Some(back);
        }
        let back_exhausted = expected.checked_sub(radius).map_or(true, |b| b < min);
        if fwd > limit && back_exhausted {
            break;
        }
    }
    None
}

fn matches_at<F>(chars: &[char], mut p: usize, hunk: &Hunk, transparent: &F) -> bool
where
    F: Fn(char) -> bool,
{
    for op in &hunk.ops {
        let run = match op {
            Op::Equal(run) | Op::Delete(run) => run,
            Op::Insert(_) => continue,
        };
        for &c in run {
            while p < chars.len() && transparent(chars[p]) {
                p += 1;
            }
            if p >= chars.len() || chars[p] != c {
                return false;
            }
            p += 1;
        }
    }
    true
}
