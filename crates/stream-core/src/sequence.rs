//! Wrap-aware tracking of 16-bit packet sequence numbers.

use crate::PacketSequence;

/// Half the sequence space; differences above this are read as "behind"
const HALF_RANGE: u16 = 0x8000;

/// Extended cycle of the first sequence number seen
const FIRST_CYCLE: u64 = 1;

/// Extends 16-bit sequence numbers into a monotonic 64-bit space.
///
/// A number that is less than half the space ahead of the highest seen is
/// "forward"; crossing 65535 → 0 on a forward step starts a new cycle. Anything
/// else is a late packet and is placed in the cycle it came from.
///
/// The first number seen lands in cycle 1 of the extended space, so a late
/// packet from before the first wrap still has a real cycle 0 to fall into.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: Option<PacketSequence>,
    cycles: u64,
    gaps: u64,
    reordered: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `seq` into the extended space, updating gap and reorder counts
    pub fn extend(&mut self, seq: PacketSequence) -> u64 {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return self.extended(self.cycles, seq);
        };

        let ahead = seq.wrapping_sub(highest);
        if ahead == 0 {
            return self.extended(self.cycles, seq);
        }

        if ahead < HALF_RANGE {
            if seq < highest {
                self.cycles += 1;
            }
            if ahead > 1 {
                self.gaps += (ahead - 1) as u64;
            }
            self.highest = Some(seq);
            self.extended(self.cycles, seq)
        } else {
            self.reordered += 1;
            if seq > highest {
                // from the cycle before the current one
                ((self.cycles + FIRST_CYCLE - 1) << 16) | seq as u64
            } else {
                self.extended(self.cycles, seq)
            }
        }
    }

    fn extended(&self, cycle: u64, seq: PacketSequence) -> u64 {
        ((cycle + FIRST_CYCLE) << 16) | seq as u64
    }

    /// Sequence numbers skipped by forward jumps. Late arrivals do not reduce it.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn reordered(&self) -> u64 {
        self.reordered
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_no_gaps() {
        let mut tracker = SequenceTracker::new();
        let base = tracker.extend(99);
        for seq in 100..200u16 {
            assert_eq!(tracker.extend(seq), base + (seq - 99) as u64);
        }
        assert_eq!(tracker.gaps(), 0);
        assert_eq!(tracker.reordered(), 0);
    }

    #[test]
    fn test_wraparound_is_not_loss() {
        let mut tracker = SequenceTracker::new();
        let ext: Vec<u64> = [65534u16, 65535, 0, 1]
            .iter()
            .map(|&seq| tracker.extend(seq))
            .collect();
        assert_eq!(ext, vec![0x1_fffe, 0x1_ffff, 0x2_0000, 0x2_0001]);
        assert_eq!(tracker.gaps(), 0);
        assert_eq!(tracker.cycles(), 1);
    }

    #[test]
    fn test_late_packet_across_wrap_stays_in_old_cycle() {
        let mut tracker = SequenceTracker::new();
        tracker.extend(65534);
        tracker.extend(0);
        assert_eq!(tracker.gaps(), 1);
        assert_eq!(tracker.extend(65535), 0x1_ffff);
        assert_eq!(tracker.reordered(), 1);
        assert_eq!(tracker.extend(1), 0x2_0001);
    }

    #[test]
    fn test_late_packet_before_first_wrap() {
        let mut tracker = SequenceTracker::new();
        let last = tracker.extend(1);
        let middle = tracker.extend(0);
        let first = tracker.extend(65535);
        assert!(first < middle && middle < last);
        assert_eq!(last - first, 2);
        assert_eq!(tracker.cycles(), 0);
        assert_eq!(tracker.gaps(), 0);
    }

    #[test]
    fn test_forward_jump_counts_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.extend(10);
        tracker.extend(15);
        assert_eq!(tracker.gaps(), 4);
    }
}
