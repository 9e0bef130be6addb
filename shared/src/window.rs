//! Sliding bitmap window over a 64-bit sequence space.
//!
//! A window tracks which of the last `WND_LEN` sequence numbers below `head`
//! are "marked" (e.g. sent-but-unacked, or received). It supports O(1)
//! earliest-mark queries via a one-word summary bitmap, one bit per word of
//! the underlying marked array.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("seqno {seqno} is outside the window [{edge}, {head}]")]
    OutOfRange { seqno: u64, edge: u64, head: u64 },
    #[error("seqno {seqno} is already marked")]
    AlreadyMarked { seqno: u64 },
    #[error("seqno {seqno} is not marked")]
    NotMarked { seqno: u64 },
    #[error("advancing by {amount} would shift a still-marked seqno off the window")]
    WouldDropMarked { amount: u64 },
}

/// A sliding window of `wnd_len = (1 << wnd_log) - 64` marked bits.
///
/// `wnd_log` must be at least 6 (one word). The window always keeps at least
/// one full word of slack between the newest marked bit and `head`, which is
/// what makes `get_mask` safe to call for any `pos` near `head`.
#[derive(Debug, Clone)]
pub struct Window {
    marked: Vec<u64>,
    summary: u64,
    head: u64,
    head_word: usize,
    num_marked: u32,
    wnd_log: u32,
}

impl Window {
    /// `wnd_log` is the log2 of the nominal window length; actual capacity
    /// for marks is `(1 << wnd_log) - 64`. `head` starts as `initial_head`,
    /// with nothing marked.
    pub fn new(wnd_log: u32, initial_head: u64) -> Self {
        assert!(wnd_log >= 6, "wnd_log must cover at least one word");
        let nwords = 1usize << (wnd_log - 6);
        let mut w = Window {
            marked: vec![0u64; nwords],
            summary: 0,
            head: 0,
            head_word: 0,
            num_marked: 0,
            wnd_log,
        };
        w.reset(initial_head);
        w
    }

    pub fn wnd_len(&self) -> u64 {
        (1u64 << self.wnd_log) - 64
    }

    fn nwords(&self) -> usize {
        self.marked.len()
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Oldest seqno still inside the window.
    pub fn edge(&self) -> u64 {
        self.head.wrapping_sub(self.wnd_len()).wrapping_add(1)
    }

    pub fn num_marked(&self) -> u32 {
        self.num_marked
    }

    pub fn is_empty(&self) -> bool {
        self.num_marked == 0
    }

    pub fn seq_before(&self, seqno: u64) -> bool {
        (seqno.wrapping_sub(self.edge()) as i64) < 0
    }

    pub fn seq_after(&self, seqno: u64) -> bool {
        (seqno.wrapping_sub(self.head) as i64) > 0
    }

    fn pos(&self, seqno: u64) -> u64 {
        seqno & ((1u64 << self.wnd_log) - 1)
    }

    /// Index into a parallel `[T; wnd_len + 64]`-shaped storage array that a
    /// caller keeps alongside this window (e.g. an outgoing window's packet
    /// descriptors).
    pub fn slot_index(&self, seqno: u64) -> usize {
        self.pos(seqno) as usize
    }

    fn bit_word(&self, index: u64) -> usize {
        (index / 64) as usize
    }

    fn summary_pos(&self, word: usize) -> u32 {
        let n = self.nwords();
        ((self.head_word + n - word) % n) as u32
    }

    pub fn is_marked(&self, seqno: u64) -> bool {
        let index = self.pos(seqno);
        let word = self.bit_word(index);
        let bit = index % 64;
        (self.marked[word] >> bit) & 1 != 0
    }

    pub fn mark(&mut self, seqno: u64) -> Result<(), WindowError> {
        if self.seq_before(seqno) || self.seq_after(seqno) {
            return Err(WindowError::OutOfRange {
                seqno,
                edge: self.edge(),
                head: self.head,
            });
        }
        if self.is_marked(seqno) {
            return Err(WindowError::AlreadyMarked { seqno });
        }
        let index = self.pos(seqno);
        let word = self.bit_word(index);
        let bit = index % 64;
        let was_zero = self.marked[word] == 0;
        self.marked[word] |= 1u64 << bit;
        if was_zero {
            self.summary |= 1u64 << self.summary_pos(word);
        }
        self.num_marked += 1;
        Ok(())
    }

    /// Marks `amount` consecutive seqnos starting at `seqno`, word at a time.
    pub fn mark_bulk(&mut self, seqno: u64, amount: u64) -> Result<(), WindowError> {
        if amount == 0 {
            return Ok(());
        }
        if self.seq_before(seqno) || self.seq_after(seqno.wrapping_add(amount - 1)) {
            return Err(WindowError::OutOfRange {
                seqno,
                edge: self.edge(),
                head: self.head,
            });
        }
        let start_index = self.pos(seqno);
        let end_index = self.pos(seqno.wrapping_add(amount - 1));
        let start_word = self.bit_word(start_index);
        let end_word = self.bit_word(end_index);
        let start_offset = start_index % 64;
        let end_offset = end_index % 64;
        let n = self.nwords();

        if start_word == end_word {
            let mask = mask_range(start_offset, end_offset);
            self.marked[start_word] |= mask;
        } else {
            self.marked[start_word] |= !0u64 << start_offset;
            let mut cur = (start_word + 1) % n;
            while cur != end_word {
                self.marked[cur] = !0u64;
                cur = (cur + 1) % n;
            }
            self.marked[end_word] |= !0u64 >> (63 - end_offset);
        }

        let start_summary = self.summary_pos(start_word);
        let end_summary = self.summary_pos(end_word);
        let summary_mask = mask_range(end_summary, start_summary);
        self.summary |= summary_mask;

        self.num_marked += amount as u32;
        Ok(())
    }

    pub fn clear(&mut self, seqno: u64) -> Result<(), WindowError> {
        if !self.is_marked(seqno) {
            return Err(WindowError::NotMarked { seqno });
        }
        let index = self.pos(seqno);
        let word = self.bit_word(index);
        let bit = index % 64;
        self.marked[word] &= !(1u64 << bit);
        if self.marked[word] == 0 {
            self.summary &= !(1u64 << self.summary_pos(word));
        }
        self.num_marked -= 1;
        Ok(())
    }

    /// Returns `seqno - t` where `t` is the latest marked seqno `<= seqno`,
    /// or `None` if no such mark exists within the window.
    pub fn at_or_before(&self, seqno: u64) -> Option<u64> {
        if self.seq_before(seqno) {
            return None;
        }
        debug_assert!(!self.seq_after(seqno));

        let index = self.pos(seqno);
        let word = self.bit_word(index);
        let offset = index % 64;

        let tmp = if offset == 63 {
            self.marked[word]
        } else {
            self.marked[word] << (63 - offset)
        };
        if tmp != 0 {
            return Some((63 - fls(tmp)) as u64);
        }

        let mut summary_tail = self.summary >> self.summary_pos(word);
        summary_tail &= !1u64;
        if summary_tail == 0 {
            return None;
        }
        let word_offset = ffs(summary_tail);
        let n = self.nwords();
        let src_word = (word + n - word_offset as usize % n) % n;
        let tmp = self.marked[src_word];
        Some(64 * word_offset as u64 + offset as u64 - fls(tmp) as u64)
    }

    /// Returns `t - seqno` where `t` is the earliest marked seqno `>=
    /// seqno`, or `None` if none exists in the window. Mirrors
    /// `at_or_before`'s summary-then-word scan, searching towards `head`
    /// instead of towards `edge`.
    pub fn at_or_after(&self, seqno: u64) -> Option<u64> {
        if self.seq_after(seqno) {
            return None;
        }
        debug_assert!(!self.seq_before(seqno));

        let index = self.pos(seqno);
        let word = self.bit_word(index);
        let offset = index % 64;

        let tmp = self.marked[word] >> offset;
        if tmp != 0 {
            return Some(ffs(tmp) as u64);
        }

        let k = self.summary_pos(word);
        if k == 0 {
            return None;
        }
        let newer = self.summary & ((1u64 << k) - 1);
        if newer == 0 {
            return None;
        }
        let k2 = fls(newer);
        let m = k - k2;
        let n = self.nwords();
        let src_word = (word + m as usize) % n;
        let tmp2 = self.marked[src_word];
        Some(64 * m as u64 + ffs(tmp2) as u64 - offset as u64)
    }

    /// Returns the earliest (smallest) marked seqno, or `None` if empty.
    pub fn earliest_marked(&self) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let word_offset = fls(self.summary) as u64;
        let n = self.nwords() as u64;
        let src_word = ((self.head_word as u64 + n - word_offset % n) % n) as usize;
        let tmp = self.marked[src_word];
        let result = (self.head & !63u64)
            .wrapping_sub(word_offset * 64)
            .wrapping_add(ffs(tmp) as u64);
        Some(result)
    }

    /// Returns a 64-bit mask whose bit `i` is `is_marked(pos - 63 + i)`.
    pub fn get_mask(&self, pos: u64) -> u64 {
        if (pos.wrapping_sub(self.edge()) as i64) < 0 {
            return 0;
        }
        if (pos.wrapping_sub(self.head.wrapping_add(64)) as i64) >= 0 {
            return 0;
        }
        self.get_mask_unsafe(pos)
    }

    /// Same as `get_mask` but assumes `pos` is within
    /// `[head - wnd_len, head + 63]`.
    pub fn get_mask_unsafe(&self, pos: u64) -> u64 {
        let index = self.pos(pos);
        let word = self.bit_word(index);
        let offset = index % 64;
        let n = self.nwords();

        if offset == 63 {
            return self.marked[word];
        }

        let mut res = self.marked[word] << (63 - offset);
        let prev_word = (word + n - 1) % n;
        res |= self.marked[prev_word] >> (offset + 1);
        res
    }

    /// Resets the window to empty with a new head.
    pub fn reset(&mut self, head: u64) {
        self.marked.iter_mut().for_each(|w| *w = 0);
        self.head = head;
        self.head_word = self.bit_word(self.pos(head));
        self.summary = 0;
        self.num_marked = 0;
    }

    /// Moves `head` forward by `amount`. Caller must ensure no marked seqno
    /// would fall off the back, or this returns an error.
    pub fn advance(&mut self, amount: u64) -> Result<(), WindowError> {
        let n = self.nwords() as u64;
        let word_shift = self.bit_word(self.head.wrapping_add(amount)) as u64
            - self.bit_word(self.head) as u64;
        if word_shift >= n {
            if self.num_marked != 0 {
                return Err(WindowError::WouldDropMarked { amount });
            }
            self.marked.iter_mut().for_each(|w| *w = 0);
            self.summary = 0;
        } else {
            if !self.is_empty() {
                let earliest = self.earliest_marked().unwrap();
                let new_edge = self.head.wrapping_add(amount).wrapping_sub(self.wnd_len());
                if (earliest.wrapping_sub(new_edge) as i64) <= 0 {
                    return Err(WindowError::WouldDropMarked { amount });
                }
            }
            self.summary <<= word_shift;
        }
        self.head = self.head.wrapping_add(amount);
        self.head_word = ((self.head_word as u64 + word_shift) % n) as usize;
        Ok(())
    }
}

/// Highest set bit index of a nonzero word (`__fls`).
fn fls(x: u64) -> u32 {
    debug_assert!(x != 0);
    63 - x.leading_zeros()
}

/// Lowest set bit index of a nonzero word (`__ffs`).
fn ffs(x: u64) -> u32 {
    debug_assert!(x != 0);
    x.trailing_zeros()
}

/// Bitmask with bits `[lo, hi]` (inclusive) set, for `lo <= hi <= 63`.
fn mask_range(lo: u32, hi: u32) -> u64 {
    let full = if hi == 63 { !0u64 } else { (1u64 << (hi + 1)) - 1 };
    full & (!0u64 << lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_mark_clear_earliest() {
        const BASE: u64 = 10071;
        let mut w = Window::new(8, BASE.wrapping_sub(1));
        w.advance(w.wnd_len()).unwrap();
        for s in BASE..=w.head() {
            w.mark(s).unwrap();
        }
        assert_eq!(w.earliest_marked(), Some(BASE));

        w.clear(BASE).unwrap();
        assert_eq!(w.earliest_marked(), Some(BASE + 1));

        w.clear(BASE + 2).unwrap();
        assert_eq!(w.at_or_before(BASE + 2), Some(1));
    }

    #[test]
    fn at_or_after_finds_next_marked_seqno() {
        const BASE: u64 = 10071;
        let mut w = Window::new(8, BASE.wrapping_sub(1));
        w.advance(w.wnd_len()).unwrap();
        for s in BASE..=w.head() {
            w.mark(s).unwrap();
        }
        assert_eq!(w.at_or_after(BASE), Some(0));

        w.clear(BASE).unwrap();
        assert_eq!(w.at_or_after(BASE), Some(1));

        w.clear(BASE + 1).unwrap();
        assert_eq!(w.at_or_after(BASE), Some(2));
    }

    #[test]
    fn at_or_after_crosses_word_boundary() {
        let mut w = Window::new(8, 2000);
        w.mark(1860).unwrap();
        assert_eq!(w.at_or_after(1800), Some(60));
        assert_eq!(w.at_or_after(1860), Some(0));
    }

    #[test]
    fn at_or_after_is_none_when_nothing_marked_ahead() {
        let mut w = Window::new(8, 2000);
        w.mark(1750).unwrap();
        assert_eq!(w.at_or_after(1751), None);
    }

    #[test]
    fn at_or_after_is_none_past_head() {
        let w = Window::new(8, 2000);
        assert_eq!(w.at_or_after(2001), None);
    }

    #[test]
    fn mark_out_of_range_rejected() {
        let w = Window::new(8, 100);
        let mut w = w;
        assert!(w.mark(1000).is_err());
    }

    #[test]
    fn get_mask_matches_is_marked() {
        let mut w = Window::new(8, 1000);
        w.mark(998).unwrap();
        w.mark(995).unwrap();
        let mask = w.get_mask(1000);
        for i in 0..64u64 {
            let seqno = 1000 - 63 + i;
            let expect = w.is_marked(seqno) && !w.seq_before(seqno);
            assert_eq!((mask >> i) & 1 == 1, expect, "bit {i} seqno {seqno}");
        }
    }

    #[test]
    fn mark_bulk_matches_one_by_one() {
        let mut a = Window::new(8, 2000);
        let mut b = Window::new(8, 2000);
        a.mark_bulk(1950, 40).unwrap();
        for s in 1950..1990 {
            b.mark(s).unwrap();
        }
        for s in 1900..=2000 {
            assert_eq!(a.is_marked(s), b.is_marked(s), "seqno {s}");
        }
        assert_eq!(a.num_marked(), b.num_marked());
    }

    #[test]
    fn advance_shifts_summary_without_dropping() {
        let mut w = Window::new(8, 500);
        w.mark(500).unwrap();
        w.advance(10).unwrap();
        assert_eq!(w.head(), 510);
        assert!(w.is_marked(500));
        assert_eq!(w.earliest_marked(), Some(500));
    }

    #[test]
    fn advance_refuses_to_drop_marked() {
        let mut w = Window::new(6, 100);
        w.mark(100 - w.wnd_len() + 1).unwrap();
        assert!(w.advance(1).is_err());
    }
}
