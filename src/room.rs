use std::fmt;

use sha2::{Digest, Sha256};

/// Grouping key for the live connections of one participant pair.
/// Derived, never stored; maps 1:1 to a conversation's pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey(String);

impl RoomKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two ids in lexicographic order, smallest first.
pub fn normalized_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// `resolve_room(a, b) == resolve_room(b, a)` for all a, b.
/// Pure, no I/O, callable from any task without synchronization.
pub fn resolve_room(a: &str, b: &str) -> RoomKey {
    let (lo, hi) = normalized_pair(a, b);

    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(b"_");
    hasher.update(hi.as_bytes());

    RoomKey(hex::encode(hasher.finalize()))
}
