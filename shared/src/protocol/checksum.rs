//! Internet-style checksum over the packet body, mixed with a pseudo-header
//! that binds the checksum to the full 64-bit sequence number and full
//! `ack_seq` (and, optionally, the endpoint addresses) so that a 16-bit wire
//! seqno or ack_seq collision can't forge a valid packet. Ported from
//! `fpproto_checksum` / `csum_tcpudp_magic`.

use crate::jhash::jhash_3words;

/// Ones'-complement sum of `data` as big-endian 16-bit words, seeded with
/// `initial` (mirrors `csum_partial`).
fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(pair[0]) << 8 | u32::from(pair[1]);
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold_to_u16(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Computes the 16-bit checksum for `pkt`, which must have its checksum
/// field already zeroed. `saddr`/`daddr` are the endpoint's and arbiter's
/// addresses (participation is mandatory here; see `DESIGN.md`). The
/// pseudo-header mixes the low 32 bits of `seqno` with the full 64 bits of
/// `ack_seq` via a 3-word jhash, so packets differing only in `ack_seq`
/// still checksum differently.
pub fn checksum(pkt: &[u8], saddr: u32, daddr: u32, seqno: u64, ack_seq: u64) -> u16 {
    let seq_hash = jhash_3words(
        seqno as u32,
        ack_seq as u32,
        (ack_seq >> 32) as u32,
        (seqno >> 32) as u32,
    );
    let body_sum = ones_complement_sum(pkt, seq_hash);

    let mut pseudo = body_sum;
    pseudo += saddr >> 16;
    pseudo += saddr & 0xFFFF;
    pseudo += daddr >> 16;
    pseudo += daddr & 0xFFFF;
    pseudo += pkt.len() as u32;
    pseudo += u32::from(super::packet::IPPROTO_FASTPASS);

    !fold_to_u16(pseudo)
}

/// Verifies `pkt`'s checksum field (assumed to be stored at bytes `[6, 8)`
/// big-endian, as written by `checksum`) against a freshly computed value.
pub fn verify(pkt: &[u8], saddr: u32, daddr: u32, seqno: u64, ack_seq: u64) -> bool {
    let mut scratch = pkt.to_vec();
    scratch[6] = 0;
    scratch[7] = 0;
    let computed = checksum(&scratch, saddr, daddr, seqno, ack_seq);
    let stored = u16::from_be_bytes([pkt[6], pkt[7]]);
    computed == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let pkt = vec![0u8; 16];
        let c1 = checksum(&pkt, 1, 2, 1000, 7);
        let c2 = checksum(&pkt, 1, 2, 1000, 7);
        assert_eq!(c1, c2);
    }

    #[test]
    fn checksum_changes_with_seqno() {
        let pkt = vec![0u8; 16];
        assert_ne!(checksum(&pkt, 1, 2, 1000, 7), checksum(&pkt, 1, 2, 1001, 7));
    }

    #[test]
    fn checksum_changes_with_ack_seq() {
        let pkt = vec![0u8; 16];
        assert_ne!(checksum(&pkt, 1, 2, 1000, 7), checksum(&pkt, 1, 2, 1000, 8));
    }

    #[test]
    fn verify_round_trips_through_encode() {
        let mut pkt = vec![0u8; 16];
        pkt[5] = 0x42;
        let c = checksum(&pkt, 10, 20, 555, 321);
        pkt[6..8].copy_from_slice(&c.to_be_bytes());
        assert!(verify(&pkt, 10, 20, 555, 321));
        pkt[8] ^= 0xFF;
        assert!(!verify(&pkt, 10, 20, 555, 321));
    }
}
