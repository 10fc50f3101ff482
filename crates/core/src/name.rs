//! Deterministic shortening of over-long object names.

use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Maximum object name length in bytes before shortening kicks in.
///
/// Names longer than this cannot be used as an indexed key in the metadata
/// store, so they are replaced by a fixed-width surrogate. Every name that
/// touches the metadata store must go through [`to_short_name`]; the repo
/// layer applies it on all paths so read and write always agree.
pub const MAX_NAME_BYTES: usize = 255;

/// Shorten a long object name to a deterministic 255-byte surrogate.
///
/// Names at or under the limit are returned unchanged. Longer names become
/// `{prefix}~{sha256-hex}${remainder-length}`, where the prefix is the
/// longest UTF-8-boundary-aligned truncation that keeps the whole surrogate
/// within the limit. Collision resistance rides on SHA-256, which the rest
/// of the system already depends on for stronger guarantees.
pub fn to_short_name(name: &str) -> Cow<'_, str> {
    if name.len() <= MAX_NAME_BYTES {
        return Cow::Borrowed(name);
    }
    let remainder = name.len() - MAX_NAME_BYTES;
    let remainder_str = remainder.to_string();
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    // prefix + '~' + 64 hex chars + '$' + remainder digits == MAX_NAME_BYTES
    let mut cut = MAX_NAME_BYTES - 1 - digest.len() - 1 - remainder_str.len();
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    Cow::Owned(format!("{}~{}${}", &name[..cut], digest, remainder_str))
}
