use std::io::{self, Read};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::metadata::{PieceInfo, SectorId, SectorNumber, SectorType};
use crate::pieces::UnpaddedPieceSize;

/// Opaque scheduling priority propagated to the sealer with every call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskPriority(pub u64);

/// Piece payload handed to the sealer. Consumed exactly once.
pub type PieceData = Box<dyn Read + Send>;

/// External interface to the process that owns sector storage. The packing
/// core routes pieces through it and otherwise treats it as a black box.
#[async_trait]
pub trait SealerGateway: Send + Sync + 'static {
    /// Initializes backing storage for a fresh sector. Idempotent.
    async fn new_sector(&self, sector: SectorId, sector_type: SectorType) -> Result<()>;

    /// Writes `size` unpadded bytes from `data` at the end of the sector,
    /// returning the computed piece commitment.
    async fn add_piece(
        &self,
        priority: TaskPriority,
        sector: SectorId,
        existing_pieces: Vec<UnpaddedPieceSize>,
        size: UnpaddedPieceSize,
        data: PieceData,
    ) -> Result<PieceInfo>;

    /// Monotonically increasing sector number allocator.
    async fn next_sector_number(&self) -> Result<SectorNumber>;
}

#[async_trait]
impl<S: SealerGateway> SealerGateway for Arc<S> {
    async fn new_sector(&self, sector: SectorId, sector_type: SectorType) -> Result<()> {
        (**self).new_sector(sector, sector_type).await
    }

    async fn add_piece(
        &self,
        priority: TaskPriority,
        sector: SectorId,
        existing_pieces: Vec<UnpaddedPieceSize>,
        size: UnpaddedPieceSize,
        data: PieceData,
    ) -> Result<PieceInfo> {
        (**self)
            .add_piece(priority, sector, existing_pieces, size, data)
            .await
    }

    async fn next_sector_number(&self) -> Result<SectorNumber> {
        (**self).next_sector_number().await
    }
}

/// Reader yielding a fixed number of zero bytes; the payload of alignment
/// pads.
pub struct NullReader {
    remaining: u64,
}

impl NullReader {
    pub fn new(size: UnpaddedPieceSize) -> NullReader {
        NullReader { remaining: size.0 }
    }
}

impl Read for NullReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = (self.remaining as usize).min(buf.len());
        for b in buf[..n].iter_mut() {
            *b = 0;
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reader_yields_exactly_its_size() {
        let mut r = NullReader::new(UnpaddedPieceSize(300));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 300);
        assert!(out.iter().all(|&b| b == 0));
    }
}
