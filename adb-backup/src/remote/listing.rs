//! Parsing of the device-side `find -printf` listing.
//!
//! Each object is printed as five NUL-terminated fields:
//! `%y` (type letter), `%T@` (mtime as `seconds.fraction`), `%s` (size),
//! `%p` (absolute path) and `%l` (link target, empty for non-links).
//! NUL separation keeps names containing newlines or `|` intact.

use super::{EntryKind, RemoteEntry};
use crate::{BackupError, Result};

/// Printf format handed to `find` on the device.
pub const FIND_PRINTF: &str = r"%y\0%T@\0%s\0%p\0%l\0";

const FIELDS_PER_RECORD: usize = 5;

/// Parse raw `find` output into entries relative to `root`.
///
/// Unknown object types (sockets, fifos, devices) are skipped.
pub fn parse_listing(raw: &[u8], root: &str) -> Result<Vec<RemoteEntry>> {
    let mut fields: Vec<&[u8]> = raw.split(|b| *b == 0).collect();

    // Output ends with a terminator, leaving one empty trailing field
    if fields.last().is_some_and(|f| f.is_empty()) {
        fields.pop();
    }

    if fields.len() % FIELDS_PER_RECORD != 0 {
        return Err(BackupError::TransportUnavailable(format!(
            "truncated listing: {} fields is not a multiple of {}",
            fields.len(),
            FIELDS_PER_RECORD
        )));
    }

    let mut entries = Vec::with_capacity(fields.len() / FIELDS_PER_RECORD);

    for record in fields.chunks(FIELDS_PER_RECORD) {
        let kind = match record[0] {
            b"f" => EntryKind::File,
            b"d" => EntryKind::Directory,
            b"l" => EntryKind::Symlink,
            other => {
                tracing::debug!(
                    "Skipping remote object of type {:?}: {}",
                    String::from_utf8_lossy(other),
                    String::from_utf8_lossy(record[3])
                );
                continue;
            }
        };

        let mtime_text = String::from_utf8_lossy(record[1]);
        let mtime_ns = parse_timestamp_ns(&mtime_text).ok_or_else(|| {
            BackupError::TransportUnavailable(format!("bad timestamp in listing: {}", mtime_text))
        })?;

        let size_text = String::from_utf8_lossy(record[2]);
        let size: u64 = size_text.trim().parse().map_err(|_| {
            BackupError::TransportUnavailable(format!("bad size in listing: {}", size_text))
        })?;

        let absolute = String::from_utf8_lossy(record[3]);
        let Some(path) = relative_to_root(&absolute, root) else {
            continue;
        };

        let link_target = match kind {
            EntryKind::Symlink => Some(String::from_utf8_lossy(record[4]).into_owned()),
            _ => None,
        };

        entries.push(RemoteEntry {
            path,
            kind,
            size: if kind == EntryKind::Directory { 0 } else { size },
            mtime_ns,
            created_ns: None,
            link_target,
        });
    }

    Ok(entries)
}

/// Parse a decimal `seconds[.fraction]` timestamp into nanoseconds.
///
/// Digits beyond nanosecond precision are truncated, so the same text
/// always yields the same value.
pub fn parse_timestamp_ns(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let (secs_text, frac_text) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if secs_text.is_empty() || !secs_text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac_text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let secs: i64 = secs_text.parse().ok()?;
    let mut nanos: i64 = 0;
    for (i, digit) in frac_text.bytes().take(9).enumerate() {
        nanos += i64::from(digit - b'0') * 10_i64.pow(8 - i as u32);
    }

    let total = secs.checked_mul(1_000_000_000)?.checked_add(nanos)?;
    Some(if negative { -total } else { total })
}

/// Strip `root` from an absolute device path and normalise separators.
///
/// Returns `None` for the root itself or paths outside it.
pub fn relative_to_root(absolute: &str, root: &str) -> Option<String> {
    let root = root.trim_end_matches('/');
    let rest = absolute.strip_prefix(root)?;
    if !rest.is_empty() && !rest.starts_with('/') {
        // `/sdcard2/x` is not below `/sdcard`
        return None;
    }

    let normalised: Vec<&str> = rest
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    if normalised.is_empty() {
        None
    } else {
        Some(normalised.join("/"))
    }
}
