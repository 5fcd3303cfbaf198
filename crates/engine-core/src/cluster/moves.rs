//! End-of-search move selection
//!
//! Each rank reports the best root move it found together with how hard
//! it worked for it; the root tallies a weighted vote and the winner's
//! principal variation is shipped back for output.

use std::collections::HashMap;

/// Field offsets of the wire record. Fixed explicitly so peers agree on
/// marshalling without padding surprises; homogeneous clusters only.
const OFF_MV: usize = 0;
const OFF_PONDER: usize = 4;
const OFF_DEPTH: usize = 8;
const OFF_SCORE: usize = 12;
const OFF_RANK: usize = 16;

/// Bytes one MoveInfo occupies on the wire: five 32-bit words.
pub const MOVE_INFO_WIRE_SIZE: usize = 20;

/// A rank's candidate answer: best move, ponder move, achieved depth,
/// score in centipawns, and the reporting rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveInfo {
    pub mv: i32,
    pub ponder: i32,
    pub depth: i32,
    pub score: i32,
    pub rank: i32,
}

impl MoveInfo {
    pub fn to_wire(&self) -> [u8; MOVE_INFO_WIRE_SIZE] {
        let mut out = [0u8; MOVE_INFO_WIRE_SIZE];
        out[OFF_MV..OFF_MV + 4].copy_from_slice(&self.mv.to_le_bytes());
        out[OFF_PONDER..OFF_PONDER + 4].copy_from_slice(&self.ponder.to_le_bytes());
        out[OFF_DEPTH..OFF_DEPTH + 4].copy_from_slice(&self.depth.to_le_bytes());
        out[OFF_SCORE..OFF_SCORE + 4].copy_from_slice(&self.score.to_le_bytes());
        out[OFF_RANK..OFF_RANK + 4].copy_from_slice(&self.rank.to_le_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), MOVE_INFO_WIRE_SIZE);
        let field = |off: usize| i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        MoveInfo {
            mv: field(OFF_MV),
            ponder: field(OFF_PONDER),
            depth: field(OFF_DEPTH),
            score: field(OFF_SCORE),
            rank: field(OFF_RANK),
        }
    }
}

/// Weighted vote over the gathered candidates. Each rank contributes
/// `(score - minScore) + depth` to its move; offsetting by the minimum
/// score makes the vote translation-invariant, and adding depth rewards
/// search effort. Ties go to the earliest-gathered candidate.
pub(crate) fn tally_votes(infos: &[MoveInfo]) -> MoveInfo {
    debug_assert!(!infos.is_empty());
    let min_score = infos.iter().map(|mi| mi.score).min().unwrap_or(0);

    let mut votes: HashMap<i32, i64> = HashMap::new();
    for mi in infos {
        *votes.entry(mi.mv).or_insert(0) += (mi.score - min_score) as i64 + mi.depth as i64;
    }

    let mut winner = infos[0];
    let mut best_vote = votes[&winner.mv];
    for mi in infos {
        if votes[&mi.mv] > best_vote {
            best_vote = votes[&mi.mv];
            winner = *mi;
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mi(mv: i32, score: i32, depth: i32, rank: i32) -> MoveInfo {
        MoveInfo {
            mv,
            ponder: 0,
            depth,
            score,
            rank,
        }
    }

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let original = MoveInfo {
            mv: 0x1e24,
            ponder: -7,
            depth: 31,
            score: -125,
            rank: 3,
        };
        assert_eq!(MoveInfo::from_wire(&original.to_wire()), original);
    }

    #[test]
    fn split_vote_with_depth_tiebreak() {
        // Four ranks: A at (100,20) twice, B at (100,21) and (95,22).
        // minScore 95, so A polls (5+20)+(5+20)=50 and B (5+21)+(0+22)=48.
        let infos = [
            mi(1, 100, 20, 0),
            mi(1, 100, 20, 1),
            mi(2, 100, 21, 2),
            mi(2, 95, 22, 3),
        ];
        let winner = tally_votes(&infos);
        assert_eq!(winner.mv, 1);
        assert_eq!(winner.rank, 0);
    }

    #[test]
    fn exact_tie_goes_to_first_gathered() {
        let infos = [mi(5, 50, 10, 0), mi(6, 50, 10, 1)];
        let winner = tally_votes(&infos);
        assert_eq!(winner.mv, 5);
        assert_eq!(winner.rank, 0);
    }

    #[test]
    fn deeper_lone_rank_can_outvote_agreement() {
        // Two ranks agree on a shallow move, one rank searched far deeper
        // with a far better score.
        let infos = [mi(1, 10, 8, 0), mi(1, 10, 8, 1), mi(2, 80, 20, 2)];
        let winner = tally_votes(&infos);
        assert_eq!(winner.mv, 2);
        assert_eq!(winner.rank, 2);
    }

    #[test]
    fn single_candidate_wins_unchanged() {
        let only = mi(9, -30, 14, 0);
        assert_eq!(tally_votes(&[only]), only);
    }
}
