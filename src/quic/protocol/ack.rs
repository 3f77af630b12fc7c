// src/quic/protocol/ack.rs
//! ACK block structures, range coalescing and the ACK frame body codec.

use crate::quic::protocol::PacketNumber;
use crate::utils::binary::*;
use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Maximum number of ACK blocks accepted in a single frame. Prevents
/// excessively large allocations if a peer sends malicious data.
const MAX_ACK_BLOCKS: u64 = 256;

/// A closed interval `[smallest, largest]` of acknowledged packet numbers,
/// both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub smallest: PacketNumber,
    pub largest: PacketNumber,
}

impl AckBlock {
    /// Creates a block, validating `smallest <= largest`.
    pub fn new(smallest: PacketNumber, largest: PacketNumber) -> Result<Self> {
        if smallest > largest {
            return Err(BinaryError::InvalidData(format!(
                "Invalid ACK block: smallest ({}) > largest ({})",
                smallest, largest
            )));
        }
        Ok(Self { smallest, largest })
    }

    /// Returns `true` if the block covers the given packet number.
    pub fn contains(&self, number: PacketNumber) -> bool {
        self.smallest <= number && number <= self.largest
    }
}

/// Coalesces a set of received packet numbers into a minimal list of
/// disjoint, ascending ACK blocks.
///
/// Input is sorted ascending; duplicates are skipped. The wire encoding
/// reverses the list (largest block first) per the QUIC format.
pub fn coalesce_blocks(mut numbers: Vec<PacketNumber>) -> Vec<AckBlock> {
    if numbers.is_empty() {
        return Vec::new();
    }
    numbers.sort_unstable();

    let mut blocks = Vec::new();
    let mut lower = numbers[0];
    let mut upper = numbers[0];

    for &n in numbers.iter().skip(1) {
        if n == upper {
            // Duplicate, skip.
            continue;
        }
        if n == upper.next() {
            // Part of the current run.
            upper = n;
        } else {
            // Gap found, close out the current run.
            blocks.push(AckBlock { smallest: lower, largest: upper });
            lower = n;
            upper = n;
        }
    }

    blocks.push(AckBlock { smallest: lower, largest: upper });
    blocks
}

/// Encodes an ACK frame body (everything after the type byte).
///
/// `blocks` must be disjoint and ascending; the wire wants them largest
/// first, so the list is walked in reverse.
pub fn encode_ack_body(delay: u64, blocks: &[AckBlock], writer: &mut BytesMut) -> Result<()> {
    let first = blocks.last().ok_or_else(|| {
        BinaryError::InvalidData("ACK frame must carry at least one block".to_string())
    })?;

    writer.write_varint(first.largest.value())?;
    writer.write_varint(delay)?;
    writer.write_varint(blocks.len() as u64 - 1)?;
    writer.write_varint(first.largest.value() - first.smallest.value())?;

    let mut prev_smallest = first.smallest.value();
    for block in blocks.iter().rev().skip(1) {
        // Gap encodes the unacknowledged run between two blocks, minus two.
        let gap = prev_smallest - block.largest.value() - 2;
        writer.write_varint(gap)?;
        writer.write_varint(block.largest.value() - block.smallest.value())?;
        prev_smallest = block.smallest.value();
    }
    Ok(())
}

/// Decodes an ACK frame body (everything after the type byte).
///
/// Returns the encoded delay and the blocks in ascending order. Malformed
/// block arithmetic (a range underflowing below zero) is a decode error.
pub fn decode_ack_body(reader: &mut Bytes) -> Result<(u64, Vec<AckBlock>)> {
    let largest = reader.read_varint()?;
    let delay = reader.read_varint()?;
    let block_count = reader.read_varint()?;
    if block_count >= MAX_ACK_BLOCKS {
        warn!("ACK frame declares {} blocks, rejecting. Potential DoS.", block_count + 1);
        return Err(BinaryError::InvalidData(format!(
            "Too many ACK blocks: {}",
            block_count + 1
        )));
    }

    let first_range = reader.read_varint()?;
    let smallest = largest.checked_sub(first_range).ok_or_else(|| {
        BinaryError::InvalidData(format!(
            "Invalid first ACK range: {} below largest {}",
            first_range, largest
        ))
    })?;

    let mut blocks = vec![AckBlock {
        smallest: PacketNumber::new(smallest),
        largest: PacketNumber::new(largest),
    }];

    let mut prev_smallest = smallest;
    for _ in 0..block_count {
        let gap = reader.read_varint()?;
        let range = reader.read_varint()?;
        let block_largest = prev_smallest
            .checked_sub(gap)
            .and_then(|v| v.checked_sub(2))
            .ok_or_else(|| {
                BinaryError::InvalidData(format!("Invalid ACK gap {} underflows", gap))
            })?;
        let block_smallest = block_largest.checked_sub(range).ok_or_else(|| {
            BinaryError::InvalidData(format!("Invalid ACK range {} underflows", range))
        })?;
        blocks.push(AckBlock {
            smallest: PacketNumber::new(block_smallest),
            largest: PacketNumber::new(block_largest),
        });
        prev_smallest = block_smallest;
    }

    // Wire order is largest first; callers work with ascending blocks.
    blocks.reverse();
    Ok((delay, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pn(v: u64) -> PacketNumber {
        PacketNumber::new(v)
    }

    fn block(smallest: u64, largest: u64) -> AckBlock {
        AckBlock::new(pn(smallest), pn(largest)).unwrap()
    }

    #[test]
    fn test_block_validation() {
        assert!(AckBlock::new(pn(5), pn(3)).is_err());
        let b = block(3, 5);
        assert!(b.contains(pn(3)));
        assert!(b.contains(pn(5)));
        assert!(!b.contains(pn(6)));
    }

    #[test]
    fn test_coalesce_empty() {
        assert_eq!(coalesce_blocks(vec![]), vec![]);
    }

    #[test]
    fn test_coalesce_single() {
        assert_eq!(coalesce_blocks(vec![pn(5)]), vec![block(5, 5)]);
    }

    #[test]
    fn test_coalesce_contiguous_run() {
        assert_eq!(
            coalesce_blocks(vec![pn(10), pn(11), pn(12), pn(13)]),
            vec![block(10, 13)]
        );
    }

    #[test]
    fn test_coalesce_mixed() {
        // The end-to-end coalescing example: {1,2,3,5,6,9} -> [[1,3],[5,6],[9,9]].
        assert_eq!(
            coalesce_blocks(vec![pn(1), pn(2), pn(3), pn(5), pn(6), pn(9)]),
            vec![block(1, 3), block(5, 6), block(9, 9)]
        );
    }

    #[test]
    fn test_coalesce_unsorted_with_duplicates() {
        assert_eq!(
            coalesce_blocks(vec![pn(9), pn(2), pn(1), pn(2), pn(5), pn(3), pn(6), pn(6)]),
            vec![block(1, 3), block(5, 6), block(9, 9)]
        );
    }

    #[test]
    fn test_coalesce_minimality() {
        // Block count must equal the number of maximal contiguous runs.
        let numbers: Vec<PacketNumber> =
            [1u64, 2, 4, 7, 8, 9, 11, 20, 21].iter().map(|&v| pn(v)).collect();
        let blocks = coalesce_blocks(numbers);
        assert_eq!(blocks.len(), 5);
        assert_eq!(
            blocks,
            vec![block(1, 2), block(4, 4), block(7, 9), block(11, 11), block(20, 21)]
        );
    }

    #[test]
    fn test_encode_decode_single_block() {
        let blocks = vec![block(2, 2)];
        let mut writer = BytesMut::new();
        encode_ack_body(67, &blocks, &mut writer).unwrap();

        // largest=2, delay=67 (2-byte varint), count=0, first range=0
        assert_eq!(writer.as_ref(), &[0x02, 0x40, 0x43, 0x00, 0x00]);

        let mut reader = writer.freeze();
        let (delay, decoded) = decode_ack_body(&mut reader).unwrap();
        assert_eq!(delay, 67);
        assert_eq!(decoded, blocks);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_encode_decode_multiple_blocks() {
        let blocks = vec![block(1, 3), block(5, 6), block(9, 9)];
        let mut writer = BytesMut::new();
        encode_ack_body(0, &blocks, &mut writer).unwrap();

        // largest=9, delay=0, count=2, first range=0 (9-9),
        // gap=9-6-2=1, range=1 (6-5), gap=5-3-2=0, range=2 (3-1)
        assert_eq!(writer.as_ref(), &[0x09, 0x00, 0x02, 0x00, 0x01, 0x01, 0x00, 0x02]);

        let mut reader = writer.freeze();
        let (delay, decoded) = decode_ack_body(&mut reader).unwrap();
        assert_eq!(delay, 0);
        assert_eq!(decoded, blocks);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_encode_empty_block_list() {
        let mut writer = BytesMut::new();
        assert!(matches!(
            encode_ack_body(0, &[], &mut writer),
            Err(BinaryError::InvalidData(_))
        ));
    }

    #[test]
    fn test_decode_underflowing_range() {
        // largest=3, delay=0, count=0, first range=5 -> smallest would be negative.
        let mut reader = Bytes::from_static(&[0x03, 0x00, 0x00, 0x05]);
        assert!(matches!(decode_ack_body(&mut reader), Err(BinaryError::InvalidData(_))));
    }

    #[test]
    fn test_decode_underflowing_gap() {
        // largest=5, delay=0, count=1, first range=0, gap=10 -> underflow.
        let mut reader = Bytes::from_static(&[0x05, 0x00, 0x01, 0x00, 0x0A, 0x00]);
        assert!(matches!(decode_ack_body(&mut reader), Err(BinaryError::InvalidData(_))));
    }

    #[test]
    fn test_decode_rejects_block_flood() {
        let mut writer = BytesMut::new();
        writer.write_varint(1000).unwrap(); // largest
        writer.write_varint(0).unwrap(); // delay
        writer.write_varint(100_000).unwrap(); // block count
        writer.write_varint(0).unwrap();
        let mut reader = writer.freeze();
        assert!(matches!(decode_ack_body(&mut reader), Err(BinaryError::InvalidData(_))));
    }
}
