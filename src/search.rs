//! Signed encoding of node search results.
//!
//! A search over a node's slots yields a single `i32`: a match is the
//! non negative slot index; a miss is `-(insertion_point + 1)` where
//! `insertion_point` is the slot at which the key would be inserted to
//! preserve order. The tree walker relies on this encoding, so the
//! helpers below are part of the public contract.

/// True iff `r` encodes a miss (an insertion point).
#[inline]
pub fn is_insertion_point(r: i32) -> bool {
    r < 0
}

/// The insertion point encoded in a miss.
#[inline]
pub fn to_index(r: i32) -> i32 {
    -r - 1
}

/// Encodes the insertion point `i` as a miss.
#[inline]
pub fn to_insertion_point(i: i32) -> i32 {
    -(i + 1)
}

/// The index of the greatest key less than or equal to the searched
/// key, or -1 if every key is greater.
#[inline]
pub fn to_minus_one_based_index(r: i32) -> i32 {
    if is_insertion_point(r) {
        (to_index(r) - 1).max(-1)
    } else {
        r
    }
}

/// True iff the position denoted by `l` immediately precedes the one
/// denoted by `r`.
#[inline]
pub fn is_preceding(l: i32, r: i32) -> bool {
    to_minus_one_based_index(r) - to_minus_one_based_index(l) == 1
}
