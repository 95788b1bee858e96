//! Snapshot descriptor parsing.
//!
//! The descriptor is a flat text file of `snapshot<N>.<field> = "<value>"`
//! lines with no guaranteed ordering; fields for one snapshot may be split
//! across non-adjacent lines. Entries are accumulated per index and checked
//! for a match after every line, so parsing stops as soon as the requested
//! snapshot's backing file is known.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{RetrievalError, RetrievalResult};

static FILE_NAME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"snapshot([0-9]+)\.filename[ ]*=[ ]*"(.*)""#).expect("filename pattern is valid")
});
static DISPLAY_NAME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"snapshot([0-9]+)\.displayName[ ]*=[ ]*"(.*)""#)
        .expect("display name pattern is valid")
});
static UID_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"snapshot([0-9]+)\.uid[ ]*=[ ]*"(.*)""#).expect("uid pattern is valid")
});

/// One snapshot's metadata, accumulated across unordered descriptor lines.
/// Fields are only ever added, never removed; later duplicates overwrite.
#[derive(Debug, Clone, Default)]
struct DescriptorEntry {
    display_name: Option<String>,
    file_name: Option<String>,
    uid: Option<String>,
}

impl DescriptorEntry {
    /// Backing file name if this entry satisfies the query, `None` while it
    /// is still incomplete or targets a different snapshot.
    fn matching_file(&self, name: &str, uid: Option<&str>) -> Option<&str> {
        if self.display_name.as_deref() != Some(name) {
            return None;
        }
        let file_name = self.file_name.as_deref()?;
        match uid {
            None => Some(file_name),
            Some(wanted) => (self.uid.as_deref() == Some(wanted)).then_some(file_name),
        }
    }
}

/// Resolve the backing file name for a snapshot display name, optionally
/// narrowed by the snapshot's unique id.
///
/// The first entry to become match-complete in line order wins; for name-only
/// queries the uid field is never consulted.
///
/// # Errors
///
/// Returns [`RetrievalError::SnapshotNotFound`] when no entry satisfies the
/// query.
pub fn resolve_snapshot_file(
    descriptor: &str,
    name: &str,
    uid: Option<&str>,
) -> RetrievalResult<String> {
    let mut entries: HashMap<String, DescriptorEntry> = HashMap::new();

    for line in descriptor.lines() {
        let Some(index) = apply_line(line, uid.is_some(), &mut entries) else {
            continue;
        };
        if let Some(file_name) = entries[&index].matching_file(name, uid) {
            return Ok(file_name.to_string());
        }
    }

    Err(RetrievalError::SnapshotNotFound {
        name: name.to_string(),
    })
}

/// Fold one line into the entry map, returning the index it updated.
/// Uid lines are only consulted when the query filters by uid.
fn apply_line(
    line: &str,
    want_uid: bool,
    entries: &mut HashMap<String, DescriptorEntry>,
) -> Option<String> {
    if let Some(captures) = FILE_NAME_LINE.captures(line) {
        let index = captures[1].to_string();
        entries.entry(index.clone()).or_default().file_name = Some(captures[2].to_string());
        return Some(index);
    }
    if let Some(captures) = DISPLAY_NAME_LINE.captures(line) {
        let index = captures[1].to_string();
        entries.entry(index.clone()).or_default().display_name = Some(captures[2].to_string());
        return Some(index);
    }
    if want_uid {
        if let Some(captures) = UID_LINE.captures(line) {
            let index = captures[1].to_string();
            entries.entry(index.clone()).or_default().uid = Some(captures[2].to_string());
            return Some(index);
        }
    }
    None
}
