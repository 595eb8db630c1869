use crate::sealer::TaskPriority;

/// Smallest unpadded piece size the sealer accepts.
pub const MIN_PIECE_SIZE: u64 = 127;

/// Smallest padded piece size (one quad of 32-byte nodes).
pub const MIN_PADDED_PIECE_SIZE: u64 = 128;

/// Priority tag attached to every sealer call made on behalf of a deal
/// sector, letting the sealer preempt background work.
pub const DEAL_SECTOR_PRIORITY: TaskPriority = TaskPriority(1024);
