use cid::Cid;
use thiserror::Error;

pub use anyhow::{Error, Result};

use crate::metadata::SectorNumber;

/// Failures surfaced to deal submitters and sector handlers. Cloneable so a
/// single sealer failure can be delivered to every deal in an aborted batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PackerErr {
    #[error("cannot allocate unpadded piece of {0} bytes")]
    UnpaddedPieceSize(u64),

    #[error("piece of {0} bytes cannot fit into a sector")]
    PieceTooLarge(u64),

    #[error("piece for deal {0} already pending")]
    DuplicatePublishCid(Cid),

    #[error("too many deals assigned to sector {0}, dropping deal")]
    TooManyDealsForSector(SectorNumber),

    #[error("piece {piece} assigned to sector {sector} with not enough space")]
    NotEnoughSpace { piece: Cid, sector: SectorNumber },

    #[error("sector {sector}: {message}")]
    SealerIo { sector: SectorNumber, message: String },

    #[error("piece {piece} assigned to sector {sector} not found")]
    PieceLost { piece: Cid, sector: SectorNumber },

    #[error("sector {0} is no longer accepting pieces")]
    SectorNotAccepting(SectorNumber),

    #[error("unsupported sector size {0}")]
    UnsupportedSectorSize(u64),
}
