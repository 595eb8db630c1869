use crate::error::PackerErr;
use crate::metadata::{Piece, SectorInfo};

/// Packing-relevant subset of the sector lifecycle. `Packing` is the exit
/// point into the sealing pipeline; `AddPieceFailed` is terminal here and
/// left to a supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectorState {
    WaitDeals,
    AddPiece,
    AddPieceFailed,
    Packing,
}

/// Events on the wire between the packing core and the sector state
/// machine. Handlers return the next event; the per-sector runner applies
/// it and re-enters the handler for the resulting state.
#[derive(Debug)]
pub enum SectorEvent {
    StartPacking,
    AddPiece,
    PieceAdded(Vec<Piece>),
    AddPieceFailed(PackerErr),
}

impl SectorEvent {
    /// Applies this event to the sector, returning the next state, or
    /// `None` when the event does not apply in the current state (stale
    /// timers, duplicate sends).
    pub(crate) fn apply(self, state: SectorState, info: &mut SectorInfo) -> Option<SectorState> {
        match (state, self) {
            (SectorState::WaitDeals, SectorEvent::AddPiece) => Some(SectorState::AddPiece),
            (SectorState::WaitDeals, SectorEvent::StartPacking) => Some(SectorState::Packing),
            (SectorState::AddPiece, SectorEvent::PieceAdded(new_pieces)) => {
                info.pieces.extend(new_pieces);
                Some(SectorState::WaitDeals)
            }
            (SectorState::AddPiece, SectorEvent::AddPieceFailed(_)) => {
                Some(SectorState::AddPieceFailed)
            }
            // a timer racing its own cancellation may deliver a duplicate
            (SectorState::Packing, SectorEvent::StartPacking) => Some(SectorState::Packing),
            _ => None,
        }
    }
}
