//! Division of one logical transfer over several streams.
//!
//! Both ends of an exchange compute their per-stream shares with the same
//! rule, so it must not change: every stream gets `total / n` bytes and the
//! first `total % n` streams carry one extra byte.

use std::ops::Range;

/// Size of the share carried by stream `id` out of `n`.
pub fn share(total: usize, n: usize, id: usize) -> usize {
    total / n + usize::from(id < total % n)
}

/// Byte offset at which the share of stream `id` out of `n` starts.
pub fn share_offset(total: usize, n: usize, id: usize) -> usize {
    (total / n) * id + id.min(total % n)
}

/// Splits `total` bytes into `n` consecutive ranges following the share rule.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn split_buf(total: usize, n: usize) -> Vec<Range<usize>> {
    assert!(n > 0, "split_buf: cannot split a buffer into 0 chunks");
    (0..n)
        .map(|id| {
            let start = share_offset(total, n, id);
            start..start + share(total, n, id)
        })
        .collect()
}

/// Cuts `buf` into the `n` disjoint mutable slices given by [`split_buf`].
pub(crate) fn split_mut(buf: &mut [u8], n: usize) -> Vec<&mut [u8]> {
    let mut parts = Vec::with_capacity(n);
    let mut rest = buf;
    for range in split_buf(rest.len(), n) {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
        parts.push(head);
        rest = tail;
    }
    parts
}

/// Cuts `buf` into the `n` shared slices given by [`split_buf`].
pub(crate) fn split_ref(buf: &[u8], n: usize) -> Vec<&[u8]> {
    split_buf(buf.len(), n).into_iter().map(|range| &buf[range]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_letters_evenly() {
        let buf = b"aaabbbcccdddeeefff";
        let chunks = split_buf(buf.len(), 6);
        assert_eq!(chunks[5], 15..18);
        assert_eq!(&buf[chunks[5].clone()], b"fff");
    }

    #[test]
    fn remainder_goes_to_leading_chunks() {
        assert_eq!(split_buf(10, 4), vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(split_buf(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(split_buf(0, 3), vec![0..0, 0..0, 0..0]);
    }

    #[test]
    #[should_panic(expected = "0 chunks")]
    fn zero_chunks_is_rejected() {
        split_buf(10, 0);
    }

    #[test]
    fn mutable_split_matches_ranges() {
        let mut buf: Vec<u8> = (0..11).collect();
        let parts = split_mut(&mut buf, 3);
        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![4, 4, 3]);
        assert_eq!(parts[2], &[8, 9, 10]);
    }

    proptest! {
        #[test]
        fn shares_cover_total(total in 0usize..1_000_000, n in 1usize..64) {
            let chunks = split_buf(total, n);
            prop_assert_eq!(chunks.len(), n);
            prop_assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), total);

            let base = total / n;
            let larger = total % n;
            let mut expected_start = 0;
            for (id, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.start, expected_start);
                let expected_len = if id < larger { base + 1 } else { base };
                prop_assert_eq!(chunk.len(), expected_len);
                prop_assert_eq!(share(total, n, id), expected_len);
                expected_start = chunk.end;
            }
        }
    }
}
