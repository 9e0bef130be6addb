//! The reliability connection state machine: one instance per peer.
//! Structurally symmetric, payload-asymmetric (endpoints send A-REQ,
//! arbiters send ALLOC); see `pktdesc::OutgoingPayload`.

use crate::config::{
    ProtocolConfig, BAD_PKT_RESET_THRESHOLD, EGRESS_OFFSET, INGRESS_OFFSET, RESET_WINDOW_NS,
};
use crate::jhash::jhash_1word;
use crate::window::Window;

use super::callbacks::ConnectionCallbacks;
use super::checksum;
use super::error::ProtocolError;
use super::packet::{self, Header, Payload, HEADER_LEN};
use super::pktdesc::{OutgoingPayload, PacketDescriptor};
use super::reconstruct::nearest;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnStats {
    pub reset_from_bad_pkts: u64,
    pub redundant_reset: u64,
    pub rx_checksum_error: u64,
    pub rx_duplicate: u64,
    pub rx_out_of_window: u64,
    pub rx_ack_out_of_window: u64,
    pub fall_off_outwnd: u64,
}

/// Derives the base sequence number for a reset timestamp: `t + h(t) +
/// (h(t) << 32)` where `h` is a 32-bit jhash of `t`'s low/high words.
pub fn base_seqno(t: u64) -> u64 {
    let h = jhash_1word(t as u32, (t >> 32) as u32);
    t.wrapping_add(u64::from(h)).wrapping_add(u64::from(h) << 32)
}

fn within_window(a: u64, b: u64, w: u64) -> bool {
    let diff = (a as i128) - (b as i128);
    diff.abs() <= w as i128
}

pub struct Connection<C: ConnectionCallbacks> {
    is_arbiter: bool,
    config: ProtocolConfig,
    saddr: u32,
    daddr: u32,

    last_reset_time: u64,
    in_sync: bool,
    consecutive_bad_pkts: u32,
    last_forced_reset_at: Option<u64>,

    outwnd: Window,
    out_descs: Vec<Option<PacketDescriptor>>,
    next_timeout_seqno: u64,

    in_max_seqno: u64,
    inwnd: u64,

    pub stats: ConnStats,
    pub callbacks: C,
}

impl<C: ConnectionCallbacks> Connection<C> {
    pub fn new(
        is_arbiter: bool,
        config: ProtocolConfig,
        saddr: u32,
        daddr: u32,
        initial_reset_time: u64,
        callbacks: C,
    ) -> Self {
        let wnd_len = (1u64 << crate::config::WND_LOG) - 64;
        let mut conn = Connection {
            is_arbiter,
            config,
            saddr,
            daddr,
            last_reset_time: 0,
            in_sync: false,
            consecutive_bad_pkts: 0,
            last_forced_reset_at: None,
            outwnd: Window::new(crate::config::WND_LOG, 0),
            out_descs: vec![None; (wnd_len + 64) as usize],
            next_timeout_seqno: 0,
            in_max_seqno: 0,
            inwnd: 0,
            stats: ConnStats::default(),
            callbacks,
        };
        conn.accept_reset(initial_reset_time);
        conn
    }

    fn my_offset(&self) -> u64 {
        if self.is_arbiter { INGRESS_OFFSET } else { EGRESS_OFFSET }
    }

    fn peer_offset(&self) -> u64 {
        if self.is_arbiter { EGRESS_OFFSET } else { INGRESS_OFFSET }
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn last_reset_time(&self) -> u64 {
        self.last_reset_time
    }

    /// Accepts `t` as the new shared reset timestamp: frees all outwnd
    /// descriptors (NACKing them), rebases both windows, and notifies the
    /// host.
    fn accept_reset(&mut self, t: u64) {
        let descs: Vec<PacketDescriptor> = self.out_descs.iter_mut().filter_map(|d| d.take()).collect();
        for pd in &descs {
            self.callbacks.handle_neg_ack(pd);
        }

        let base = base_seqno(t);
        self.last_reset_time = t;
        self.outwnd.reset(base.wrapping_add(self.my_offset()).wrapping_sub(1));
        self.in_max_seqno = base.wrapping_add(self.peer_offset()).wrapping_sub(1);
        self.inwnd = !0u64;
        self.consecutive_bad_pkts = 0;
        self.next_timeout_seqno = self.outwnd.head().wrapping_add(1);
        self.callbacks.cancel_timer();
        self.callbacks.handle_reset();
    }

    /// Implements the §4.2.2 reset-acceptance table.
    fn on_reset_payload(&mut self, t: u64, now: u64) {
        let l_recent = within_window(self.last_reset_time, now, self.config.rst_win_ns);
        let t_recent = within_window(t, now, self.config.rst_win_ns);

        match (l_recent, t_recent) {
            (true, true) => {
                if t > self.last_reset_time {
                    self.accept_reset(t);
                    self.in_sync = !self.is_arbiter;
                } else {
                    self.stats.redundant_reset += 1;
                    if t == self.last_reset_time {
                        self.in_sync = true;
                    }
                }
            }
            (true, false) => {
                // keep L, reject T
            }
            (false, true) => {
                self.accept_reset(t);
                self.in_sync = !self.is_arbiter;
            }
            (false, false) => {
                self.accept_reset(now);
                self.in_sync = false;
            }
        }
    }

    fn force_reset(&mut self, now: u64) {
        self.accept_reset(now);
        self.in_sync = false;
        self.callbacks.trigger_request();
        self.last_forced_reset_at = Some(now);
    }

    fn got_bad_packet(&mut self, now: u64) {
        self.stats.rx_checksum_error += 1;
        self.consecutive_bad_pkts += 1;
        if self.consecutive_bad_pkts >= BAD_PKT_RESET_THRESHOLD {
            let recent_reset = self
                .last_forced_reset_at
                .map(|t| now.saturating_sub(t) < RESET_WINDOW_NS)
                .unwrap_or(false);
            if !recent_reset {
                self.stats.reset_from_bad_pkts += 1;
                self.force_reset(now);
            }
        }
    }

    /// Main receive path (§4.2.3).
    pub fn handle_rx_packet(&mut self, pkt: &[u8], now: u64) -> Result<(), ProtocolError> {
        if pkt.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooShort { len: pkt.len() });
        }

        let reset_candidate = if packet::peek_payload_type(&pkt[HEADER_LEN..]) == Some(1) {
            let (t56, _) = packet::decode_reset(&pkt[HEADER_LEN..])?;
            let hint = now.wrapping_sub(1u64 << 55);
            Some(nearest(hint, t56, 56))
        } else {
            None
        };

        let header = Header::read(pkt)?;

        let seqno = if let Some(t) = reset_candidate {
            base_seqno(t).wrapping_add(self.peer_offset())
        } else {
            nearest(self.in_max_seqno.wrapping_sub(1 << 14), header.seq as u64, 16)
        };

        let ack_seq = nearest(
            self.outwnd.head().wrapping_sub((1u64 << 16) - 1),
            header.ack_seq as u64,
            16,
        );

        if !checksum::verify(pkt, self.saddr, self.daddr, seqno, ack_seq) {
            self.got_bad_packet(now);
            return Ok(());
        }
        self.consecutive_bad_pkts = 0;

        if let Some(t) = reset_candidate {
            self.on_reset_payload(t, now);
            if self.is_arbiter {
                self.callbacks.trigger_request();
            }
        }

        if self.seq_before_window(seqno) || self.inwnd_bit_set(seqno) {
            self.stats.rx_duplicate += 1;
            return Ok(());
        }

        self.process_ack_vec(ack_seq, header.ack_vec, None);

        let mut off = HEADER_LEN;
        while off < pkt.len() {
            match packet::decode_next_payload(&pkt[off..])? {
                None => break,
                Some((Payload::Reset { .. }, n)) => off += n,
                Some((Payload::AReq(entries), n)) => {
                    self.callbacks.handle_areq(&entries);
                    off += n;
                }
                Some((Payload::Alloc(alloc), n)) => {
                    self.callbacks.handle_alloc(&alloc);
                    off += n;
                }
                Some((Payload::AckExt(ext), n)) => {
                    self.process_ack_vec(ack_seq, header.ack_vec, Some(ext));
                    off += n;
                }
            }
        }

        self.update_inwnd(seqno);
        Ok(())
    }

    fn seq_before_window(&self, seqno: u64) -> bool {
        (seqno.wrapping_sub(self.in_max_seqno.wrapping_sub(63)) as i64) < 0
    }

    fn inwnd_bit_set(&self, seqno: u64) -> bool {
        if seqno > self.in_max_seqno {
            return false;
        }
        let gap = self.in_max_seqno - seqno;
        gap < 64 && (self.inwnd >> gap) & 1 != 0
    }

    fn update_inwnd(&mut self, seqno: u64) {
        if seqno > self.in_max_seqno.wrapping_add(63) {
            self.inwnd = 1u64 << 63;
            self.in_max_seqno = seqno;
        } else if seqno > self.in_max_seqno {
            let gap = seqno - self.in_max_seqno;
            self.inwnd = (self.inwnd >> gap) | (1u64 << 63);
            self.in_max_seqno = seqno;
        } else {
            let gap = self.in_max_seqno - seqno;
            self.inwnd |= 1u64 << (63 - gap);
        }
    }

    fn process_ack_vec(&mut self, ack_seq: u64, ack_vec: u16, ext: Option<super::packet::AckExtPayload>) {
        let tail = (ack_vec >> 15) & 1 == 1;
        let low15 = u64::from(ack_vec & 0x7FFF);
        let mut mask: u64 = 1 | (low15 << 1);
        if tail {
            mask |= ((1u64 << 33) - 1) << 16;
        }
        if let Some(ext) = ext {
            mask &= !(((1u64 << 44) - 1) << 16);
            mask |= (u64::from(ext.extra_low28) & ((1 << 28) - 1)) << 16;
            mask |= u64::from(ext.extra_high16) << 44;
        }

        if self.seq_before_window(ack_seq) {
            self.stats.rx_ack_out_of_window += 1;
            return;
        }

        // `get_mask` bit i is `is_marked(ack_seq-63+i)`; reversing turns
        // that into bit j = `is_marked(ack_seq-j)`, matching our mask's
        // offset-from-ack_seq convention.
        let marked = self.outwnd.get_mask(ack_seq).reverse_bits();
        let mut to_ack = mask & marked;
        while to_ack != 0 {
            let j = to_ack.trailing_zeros() as u64;
            to_ack &= to_ack - 1;
            self.do_ack_seqno(ack_seq.wrapping_sub(j));
        }
    }

    fn do_ack_seqno(&mut self, seqno: u64) {
        let idx = self.outwnd.slot_index(seqno);
        if let Some(pd) = self.out_descs[idx].take() {
            self.outwnd.clear(seqno).ok();
            self.callbacks.handle_ack(pd);
        }
    }

    /// Makes room for the next commit by NACKing the slot that would
    /// otherwise fall off the back of the window.
    pub fn prepare_to_send(&mut self) {
        let edge = self.outwnd.edge();
        let idx = self.outwnd.slot_index(edge);
        if self.outwnd.is_marked(edge) {
            if let Some(pd) = self.out_descs[idx].take() {
                self.stats.fall_off_outwnd += 1;
                self.callbacks.handle_neg_ack(&pd);
            }
            self.outwnd.clear(edge).ok();
            if self.next_timeout_seqno == edge {
                self.next_timeout_seqno = edge.wrapping_add(1);
            }
        }
    }

    /// Commits `payload` as the next outgoing packet, filling in seqno,
    /// ack piggyback, and reset fields.
    pub fn commit_packet(&mut self, payload: OutgoingPayload, now: u64) -> PacketDescriptor {
        let seqno = self.outwnd.head().wrapping_add(1);
        let tail_ones = (self.inwnd & (!0u64 << 16)) == (!0u64 << 16);
        let pd = PacketDescriptor {
            seqno,
            sent_timestamp: now,
            ack_seq: self.in_max_seqno,
            ack_vec: (((self.inwnd >> 1) & 0x7FFF) as u16) | ((tail_ones as u16) << 15),
            send_reset: !self.in_sync,
            reset_timestamp: self.last_reset_time,
            payload,
        };
        self.outwnd.advance(1).expect("outwnd full after prepare_to_send");
        self.outwnd.mark(seqno).expect("seqno already marked");
        let idx = self.outwnd.slot_index(seqno);
        self.out_descs[idx] = Some(pd.clone());

        self.rearm_timer();
        pd
    }

    fn rearm_timer(&mut self) {
        if let Some(earliest) = self.outwnd.earliest_marked() {
            let idx = self.outwnd.slot_index(earliest);
            if let Some(pd) = &self.out_descs[idx] {
                self.callbacks.set_timer(pd.sent_timestamp + self.config.send_timeout_ns);
                return;
            }
        }
        self.callbacks.cancel_timer();
    }

    /// Encodes `pd` into `buf`, zero-padding to `min_size`. Returns the
    /// number of bytes written.
    pub fn encode_packet(
        &self,
        pd: &PacketDescriptor,
        buf: &mut [u8],
        min_size: usize,
    ) -> Result<usize, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::BufferTooSmall { need: HEADER_LEN, have: buf.len() });
        }
        let header = Header {
            seq: pd.seqno as u16,
            ack_seq: pd.ack_seq as u16,
            ack_vec: pd.ack_vec,
            checksum: 0,
        };
        header.write(&mut buf[0..HEADER_LEN]);
        let mut off = HEADER_LEN;

        if pd.send_reset {
            if buf.len() < off + 8 {
                return Err(ProtocolError::BufferTooSmall { need: off + 8, have: buf.len() });
            }
            off += packet::encode_reset(&mut buf[off..], pd.reset_timestamp);
        }

        match &pd.payload {
            OutgoingPayload::Alloc(alloc) => {
                off += packet::encode_alloc(&mut buf[off..], alloc)?;
            }
            OutgoingPayload::AReq(entries) => {
                let need = off + 2 + 4 * entries.len();
                if buf.len() < need {
                    return Err(ProtocolError::BufferTooSmall { need, have: buf.len() });
                }
                off += packet::encode_areq(&mut buf[off..], entries);
            }
        }

        if off < min_size {
            if buf.len() < min_size {
                return Err(ProtocolError::BufferTooSmall { need: min_size, have: buf.len() });
            }
            buf[off..min_size].iter_mut().for_each(|b| *b = 0);
            off = min_size;
        }

        let c = checksum::checksum(&buf[0..off], self.saddr, self.daddr, pd.seqno, pd.ack_seq);
        buf[6..8].copy_from_slice(&c.to_be_bytes());
        Ok(off)
    }

    /// Timer callback (§4.2.5): NACK everything that has timed out, rearm
    /// for whatever is next.
    pub fn handle_timeout(&mut self, now: u64) {
        let mut seqno = self.next_timeout_seqno;
        while (seqno.wrapping_sub(self.outwnd.head()) as i64) <= 0 {
            if self.outwnd.is_marked(seqno) {
                let idx = self.outwnd.slot_index(seqno);
                let timed_out = self.out_descs[idx]
                    .as_ref()
                    .map(|pd| pd.sent_timestamp + self.config.send_timeout_ns <= now)
                    .unwrap_or(false);
                if !timed_out {
                    break;
                }
                if let Some(pd) = &self.out_descs[idx] {
                    self.callbacks.handle_neg_ack(pd);
                }
            }
            seqno = seqno.wrapping_add(1);
        }
        self.next_timeout_seqno = seqno;
        self.rearm_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::AreqEntry;

    #[derive(Default)]
    struct TestCallbacks {
        resets: u32,
        acked: Vec<u64>,
        nacked: Vec<u64>,
        areqs: u32,
        triggers: u32,
    }

    impl ConnectionCallbacks for TestCallbacks {
        fn handle_reset(&mut self) {
            self.resets += 1;
        }
        fn handle_ack(&mut self, pd: PacketDescriptor) {
            self.acked.push(pd.seqno);
        }
        fn handle_neg_ack(&mut self, pd: &PacketDescriptor) {
            self.nacked.push(pd.seqno);
        }
        fn handle_alloc(&mut self, _alloc: &super::super::packet::AllocPayload) {}
        fn handle_areq(&mut self, _entries: &[AreqEntry]) {
            self.areqs += 1;
        }
        fn trigger_request(&mut self) {
            self.triggers += 1;
        }
        fn set_timer(&mut self, _deadline_ns: u64) {}
        fn cancel_timer(&mut self) {}
    }

    fn make_pair() -> (Connection<TestCallbacks>, Connection<TestCallbacks>) {
        let cfg = ProtocolConfig::default();
        let endpoint = Connection::new(false, cfg, 1, 2, 1000, TestCallbacks::default());
        let arbiter = Connection::new(true, cfg, 2, 1, 1000, TestCallbacks::default());
        (endpoint, arbiter)
    }

    #[test]
    fn commit_then_ack_frees_descriptor() {
        let (mut endpoint, _arbiter) = make_pair();
        endpoint.prepare_to_send();
        let pd = endpoint.commit_packet(
            OutgoingPayload::AReq(vec![AreqEntry { dst: 5, cumulative_tslots: 1 }]),
            0,
        );
        assert!(endpoint.outwnd.is_marked(pd.seqno));
        endpoint.do_ack_seqno(pd.seqno);
        assert!(!endpoint.outwnd.is_marked(pd.seqno));
        assert_eq!(endpoint.callbacks.acked, vec![pd.seqno]);
    }

    #[test]
    fn bad_checksum_increments_counter_and_is_dropped() {
        let (mut endpoint, _arbiter) = make_pair();
        let mut buf = [0u8; HEADER_LEN];
        endpoint.handle_rx_packet(&mut buf, 0).unwrap();
        assert_eq!(endpoint.stats.rx_checksum_error, 1);
    }

    #[test]
    fn ten_bad_packets_force_a_reset() {
        let (mut endpoint, _arbiter) = make_pair();
        let mut buf = [0u8; HEADER_LEN];
        for i in 0..10u64 {
            endpoint.handle_rx_packet(&mut buf, i).unwrap();
        }
        assert_eq!(endpoint.stats.reset_from_bad_pkts, 1);
        assert!(!endpoint.in_sync());
        assert_eq!(endpoint.callbacks.triggers, 1);
    }
}
