use std::fmt;

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::error::PackerErr;
use crate::pieces::{PaddedPieceSize, UnpaddedPieceSize};

pub type ActorId = u64;
pub type SectorNumber = u64;
pub type DealId = u64;
pub type ChainEpoch = i64;

/// Sector identity: the owning miner actor plus the sector number. Stable
/// for a sector's lifetime.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorId {
    pub miner: ActorId,
    pub number: SectorNumber,
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{t0{}, {}}}", self.miner, self.number)
    }
}

/// Sector capacity in padded bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorSize(pub u64);

impl From<SectorSize> for PaddedPieceSize {
    fn from(size: SectorSize) -> PaddedPieceSize {
        PaddedPieceSize(size.0)
    }
}

impl fmt::Display for SectorSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registered seal proof, which fixes the sector size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorType {
    StackedDrg2KiBV1,
    StackedDrg8MiBV1,
    StackedDrg512MiBV1,
    StackedDrg32GiBV1,
    StackedDrg64GiBV1,
}

impl SectorType {
    pub fn sector_size(self) -> SectorSize {
        match self {
            SectorType::StackedDrg2KiBV1 => SectorSize(2 << 10),
            SectorType::StackedDrg8MiBV1 => SectorSize(8 << 20),
            SectorType::StackedDrg512MiBV1 => SectorSize(512 << 20),
            SectorType::StackedDrg32GiBV1 => SectorSize(32 << 30),
            SectorType::StackedDrg64GiBV1 => SectorSize(64 << 30),
        }
    }
}

/// Per-sector cap on deal count.
pub fn deal_per_sector_limit(size: SectorSize) -> Result<usize, PackerErr> {
    match size.0 {
        s if s == 2 << 10 || s == 8 << 20 || s == 512 << 20 || s == 32 << 30 => Ok(256),
        s if s == 64 << 30 => Ok(512),
        other => Err(PackerErr::UnsupportedSectorSize(other)),
    }
}

/// On-chain schedule of the deal; propagated opaquely by the packing core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealSchedule {
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
}

/// Everything the packing core needs to know about a published deal. The
/// publish CID doubles as the unique fingerprint of the submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealInfo {
    pub publish_cid: Cid,
    pub deal_id: DealId,
    pub deal_schedule: DealSchedule,
    pub keep_unsealed: bool,
}

/// What the sealer reports back after writing a piece.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub size: PaddedPieceSize,
    pub cid: Cid,
}

/// A piece committed into a sector. Pieces with no deal info are alignment
/// pads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub piece: PieceInfo,
    pub deal_info: Option<DealInfo>,
}

/// Sector-local metadata owned by the state machine. `pieces` is append-only
/// while the sector accepts deals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SectorInfo {
    pub sector_number: SectorNumber,
    pub sector_type: SectorType,
    /// Unix millis at creation; 0 when unknown (restored sectors).
    pub creation_time: i64,
    pub pieces: Vec<Piece>,
}

impl SectorInfo {
    pub(crate) fn new(sector_number: SectorNumber, sector_type: SectorType, creation_time: i64) -> SectorInfo {
        SectorInfo {
            sector_number,
            sector_type,
            creation_time,
            pieces: Vec::new(),
        }
    }

    /// Number of pieces carrying deal data.
    pub fn deal_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.deal_info.is_some()).count()
    }

    /// Total unpadded bytes written so far, pads included.
    pub fn used(&self) -> UnpaddedPieceSize {
        self.pieces
            .iter()
            .fold(UnpaddedPieceSize(0), |acc, p| acc + p.piece.size.unpadded())
    }

    pub fn existing_piece_sizes(&self) -> Vec<UnpaddedPieceSize> {
        self.pieces.iter().map(|p| p.piece.size.unpadded()).collect()
    }
}

#[cfg(test)]
mod tests {
    use multihash_codetable::{Code, MultihashDigest};

    use super::*;

    const RAW: u64 = 0x55;

    #[test]
    fn deal_limits_by_size() {
        assert_eq!(deal_per_sector_limit(SectorSize(2 << 10)).unwrap(), 256);
        assert_eq!(deal_per_sector_limit(SectorSize(32 << 30)).unwrap(), 256);
        assert_eq!(deal_per_sector_limit(SectorSize(64 << 30)).unwrap(), 512);

        match deal_per_sector_limit(SectorSize(4 << 10)) {
            Err(PackerErr::UnsupportedSectorSize(4096)) => {}
            other => panic!("expected UnsupportedSectorSize, got {:?}", other),
        }
    }

    #[test]
    fn used_counts_pads_too() {
        let mut info = SectorInfo::new(1, SectorType::StackedDrg2KiBV1, 0);
        assert_eq!(info.used(), UnpaddedPieceSize(0));
        assert_eq!(info.deal_count(), 0);

        let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(b"piece"));
        info.pieces.push(Piece {
            piece: PieceInfo {
                size: PaddedPieceSize(512),
                cid,
            },
            deal_info: Some(DealInfo {
                publish_cid: cid,
                deal_id: 1,
                deal_schedule: DealSchedule::default(),
                keep_unsealed: false,
            }),
        });
        info.pieces.push(Piece {
            piece: PieceInfo {
                size: PaddedPieceSize(512),
                cid,
            },
            deal_info: None,
        });

        assert_eq!(info.used(), UnpaddedPieceSize(1016));
        assert_eq!(info.deal_count(), 1);
        assert_eq!(
            info.existing_piece_sizes(),
            vec![UnpaddedPieceSize(508), UnpaddedPieceSize(508)]
        );
    }
}
