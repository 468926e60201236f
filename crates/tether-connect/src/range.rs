//! Byte ranges over the keyspace.

use bytes::Bytes;
use std::cmp::Ordering;

/// The range end meaning "and everything after the start key".
fn zero_key() -> Bytes {
    Bytes::from_static(&[0])
}

/// Compares keys with the etcd convention that an empty key sorts *after*
/// everything (an empty range end means "no upper bound").
fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    if a.is_empty() {
        return if b.is_empty() {
            Ordering::Equal
        } else {
            Ordering::Greater
        };
    }
    if b.is_empty() {
        return Ordering::Less;
    }
    a.cmp(b)
}

/// A `[start, end)` byte range in the keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub start: Bytes,
    pub end: Bytes,
}

impl Range {
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The range containing exactly one key.
    pub fn single(key: impl Into<Bytes>) -> Self {
        let start: Bytes = key.into();
        let mut end = start.to_vec();
        end.push(0);
        Self {
            start,
            end: Bytes::from(end),
        }
    }

    /// The range of all keys prefixed with `prefix`. An empty prefix covers
    /// the entire keyspace.
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let prefix: Bytes = prefix.into();
        if prefix.is_empty() {
            return Self {
                start: zero_key(),
                end: zero_key(),
            };
        }
        let end = end_range_for_prefix(&prefix);
        Self { start: prefix, end }
    }

    /// Whether the range includes the given key.
    pub fn includes(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        compare_keys(&self.start, key) != Ordering::Greater
            && compare_keys(&self.end, key) == Ordering::Greater
    }

    /// Compares the other range to this one: `Less` if this range comes
    /// entirely before the other, `Greater` if entirely after, `Equal` when
    /// they overlap.
    pub fn compare(&self, other: &Range) -> Ordering {
        let start_vs_start = compare_keys(&self.start, &other.start);
        let start_vs_end = compare_keys(&self.start, &other.end);
        let end_vs_start = compare_keys(&self.end, &other.start);

        if start_vs_start == Ordering::Less && end_vs_start != Ordering::Greater {
            return Ordering::Less;
        }
        if start_vs_end != Ordering::Less {
            return Ordering::Greater;
        }
        Ordering::Equal
    }
}

/// Computes the exclusive upper bound of a prefix range: the prefix with its
/// last non-0xff byte incremented and the tail dropped. A prefix of all 0xff
/// bytes has no upper bound.
fn end_range_for_prefix(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return Bytes::from(end);
        }
    }
    zero_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_includes_prefixed_keys() {
        for prefix in ["foo/", "a", "\u{00ff}before"] {
            let range = Range::prefix(prefix.as_bytes().to_vec());
            for suffix in ["", "a", "zzz", "\u{00ff}"] {
                let key = format!("{prefix}{suffix}");
                assert!(range.includes(key.as_bytes()), "{prefix} + {suffix}");
            }
        }
    }

    #[test]
    fn test_prefix_excludes_unprefixed_keys() {
        let range = Range::prefix(&b"foo/"[..]);
        assert!(!range.includes(b"fon"));
        assert!(!range.includes(b"foo"));
        assert!(!range.includes(b"fop"));
        assert!(!range.includes(b"zzz"));
    }

    #[test]
    fn test_empty_prefix_covers_everything() {
        let range = Range::prefix(Bytes::new());
        assert!(range.includes(b"anything"));
        assert!(range.includes(&[0x01][..]));
        assert!(range.includes(&[0xff, 0xff][..]));
    }

    #[test]
    fn test_prefix_carry_on_trailing_ff() {
        let range = Range::prefix(Bytes::from_static(&[b'a', 0xff]));
        assert_eq!(&range.end[..], &[b'b']);
        assert!(range.includes(&[b'a', 0xff, 0x01][..]));
        assert!(!range.includes(&[b'b'][..]));
    }

    #[test]
    fn test_all_ff_prefix_is_unbounded() {
        let range = Range::prefix(Bytes::from_static(&[0xff, 0xff]));
        assert_eq!(&range.end[..], &[0x00]);
        assert!(range.includes(&[0xff, 0xff, 0x07][..]));
    }

    #[test]
    fn test_single_key_range() {
        let range = Range::single(&b"k"[..]);
        assert!(range.includes(b"k"));
        assert!(!range.includes(b"k\x01"));
    }

    #[test]
    fn test_range_ordering() {
        let a = Range::new(&b"a"[..], &b"c"[..]);
        let b = Range::new(&b"c"[..], &b"e"[..]);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
        let overlapping = Range::new(&b"b"[..], &b"d"[..]);
        assert_eq!(a.compare(&overlapping), Ordering::Equal);
    }
}
