use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_std::channel::{bounded, unbounded, Receiver, Sender};
use async_std::sync::Mutex;
use async_std::task;
use cid::Cid;

use crate::config::GetPackingConfigFunc;
use crate::constants::DEAL_SECTOR_PRIORITY;
use crate::error::{PackerErr, Result};
use crate::metadata::{
    deal_per_sector_limit, ActorId, DealInfo, Piece, SectorId, SectorInfo, SectorNumber,
    SectorType,
};
use crate::pieces::{padded_size, required_padding, PaddedPieceSize, UnpaddedPieceSize};
use crate::runner;
use crate::sealer::{NullReader, PieceData, SealerGateway};
use crate::state::SectorEvent;

pub(crate) type PieceAcceptance = std::result::Result<(SectorNumber, UnpaddedPieceSize), PackerErr>;

/// A deal piece waiting to be routed into an open sector.
pub(crate) struct PendingPiece {
    pub size: UnpaddedPieceSize,
    pub deal: DealInfo,
    /// Consumed exactly once, by the sealer call that writes the piece.
    pub data: Option<PieceData>,
    pub assigned: bool,
    accepted: Sender<PieceAcceptance>,
}

impl PendingPiece {
    /// Completes the submitter. Consuming `self` makes a second delivery
    /// impossible; a dropped receiver means the submitter went away and the
    /// result is discarded.
    pub fn accepted(self, res: PieceAcceptance) {
        if self.accepted.try_send(res).is_err() {
            warn!(
                "deal {}: submitter gone before completion",
                self.deal.deal_id
            );
        }
    }
}

/// Accounting entry for a sector currently able to accept deals.
pub(crate) struct OpenSector {
    pub used: UnpaddedPieceSize,
    pub number: SectorNumber,
    event_tx: Sender<SectorEvent>,
}

impl OpenSector {
    fn maybe_accept(&self) -> std::result::Result<(), PackerErr> {
        self.event_tx
            .try_send(SectorEvent::AddPiece)
            .map_err(|_| PackerErr::SectorNotAccepting(self.number))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SectorPhase {
    Staging,
    Sealing,
    Failed,
}

/// Where each deal sector sits in its lifecycle, for backpressure decisions.
#[derive(Default)]
pub(crate) struct SectorStats {
    phases: HashMap<SectorNumber, SectorPhase>,
}

impl SectorStats {
    pub fn put(&mut self, sector: SectorNumber, phase: SectorPhase) {
        self.phases.insert(sector, phase);
    }

    pub fn cur_staging(&self) -> u64 {
        self.phases
            .values()
            .filter(|p| **p == SectorPhase::Staging)
            .count() as u64
    }

    pub fn cur_sealing(&self) -> u64 {
        self.phases
            .values()
            .filter(|p| **p == SectorPhase::Sealing)
            .count() as u64
    }
}

/// Everything guarded by the input gate. Plain maps; the packer supplies
/// the business logic.
#[derive(Default)]
pub(crate) struct InputState {
    pub open_sectors: HashMap<SectorId, OpenSector>,
    pub pending_pieces: HashMap<Cid, PendingPiece>,
    /// Transient routing table: fingerprints routed to a sector between the
    /// `AddPiece` event send and its handler draining them.
    pub assigned_pieces: HashMap<SectorId, Vec<Cid>>,
    pub sector_timers: HashMap<SectorId, task::JoinHandle<()>>,
    pub stats: SectorStats,
}

pub(crate) struct PackerInner<S: SealerGateway> {
    pub sealer: S,
    pub miner_id: ActorId,
    pub seal_proof: SectorType,
    pub get_config: GetPackingConfigFunc,
    /// The input gate: the single critical section ordering all mutations
    /// of the packing state. Kept free of sealer piece writes.
    pub input: Mutex<InputState>,
    pub sectors: Mutex<HashMap<SectorNumber, Sender<SectorEvent>>>,
    pub packed_tx: Sender<SectorInfo>,
}

/// The deal-to-sector packing core. Cheap to clone; all clones share one
/// input gate.
pub struct Packer<S: SealerGateway> {
    pub(crate) inner: Arc<PackerInner<S>>,
}

impl<S: SealerGateway> Clone for Packer<S> {
    fn clone(&self) -> Self {
        Packer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SealerGateway> Packer<S> {
    /// Returns the packer and the stream of sectors that finished packing
    /// and are ready for the sealing pipeline.
    pub fn new(
        sealer: S,
        miner_id: ActorId,
        seal_proof: SectorType,
        get_config: GetPackingConfigFunc,
    ) -> (Packer<S>, Receiver<SectorInfo>) {
        let (packed_tx, packed_rx) = unbounded();

        let packer = Packer {
            inner: Arc::new(PackerInner {
                sealer,
                miner_id,
                seal_proof,
                get_config,
                input: Mutex::new(InputState::default()),
                sectors: Mutex::new(HashMap::new()),
                packed_tx,
            }),
        };

        (packer, packed_rx)
    }

    /// Submits a deal piece and blocks until it is written into some sector
    /// or definitively rejected. Returns the sector number and the padded
    /// offset of the piece within it.
    pub async fn add_piece_to_any_sector(
        &self,
        size: UnpaddedPieceSize,
        data: PieceData,
        deal: DealInfo,
    ) -> Result<(SectorNumber, PaddedPieceSize)> {
        info!(
            "adding piece for deal {} (publish msg: {})",
            deal.deal_id, deal.publish_cid
        );

        if padded_size(size.0) != size {
            return Err(PackerErr::UnpaddedPieceSize(size.0).into());
        }

        let ssize = self.inner.seal_proof.sector_size();
        if size > PaddedPieceSize::from(ssize).unpadded() {
            return Err(PackerErr::PieceTooLarge(size.0).into());
        }

        let (res_tx, res_rx) = bounded(1);
        {
            let mut input = self.inner.input.lock().await;
            if input.pending_pieces.contains_key(&deal.publish_cid) {
                return Err(PackerErr::DuplicatePublishCid(deal.publish_cid).into());
            }

            let publish_cid = deal.publish_cid;
            input.pending_pieces.insert(
                publish_cid,
                PendingPiece {
                    size,
                    deal,
                    data: Some(data),
                    assigned: false,
                    accepted: res_tx,
                },
            );

            self.update_input(&mut input).await;
        }

        let (sector, offset) = res_rx
            .recv()
            .await
            .map_err(|_| anyhow::anyhow!("piece completion channel dropped"))??;

        Ok((sector, offset.padded()))
    }

    /// Administrative force-start. Unknown or already-packed sectors are a
    /// no-op, which makes repeated calls idempotent.
    pub async fn start_packing(&self, sector: SectorNumber) {
        let sectors = self.inner.sectors.lock().await;
        if let Some(event_tx) = sectors.get(&sector) {
            let _ = event_tx.try_send(SectorEvent::StartPacking);
        }
    }

    /// Number of sectors currently able to accept deals.
    pub async fn open_sector_count(&self) -> usize {
        self.inner.input.lock().await.open_sectors.len()
    }

    /// Number of submitted deals not yet written or rejected.
    pub async fn pending_piece_count(&self) -> usize {
        self.inner.input.lock().await.pending_pieces.len()
    }

    pub(crate) fn sector_id(&self, number: SectorNumber) -> SectorId {
        SectorId {
            miner: self.inner.miner_id,
            number,
        }
    }

    /// The matcher: routes every routable pending piece to the open sector
    /// wasting the least alignment padding. Must be called with the input
    /// gate held.
    //
    // O(|pending| * |open|); fine at current deal rates.
    pub(crate) async fn update_input(&self, input: &mut InputState) {
        let sector_max = PaddedPieceSize::from(self.inner.seal_proof.sector_size()).unpadded();

        struct Match {
            sector: SectorId,
            deal: Cid,
            size: UnpaddedPieceSize,
            padding: UnpaddedPieceSize,
        }

        let mut matches: Vec<Match> = Vec::new();
        let mut to_assign: HashSet<Cid> = HashSet::new();

        for (fingerprint, piece) in &input.pending_pieces {
            if piece.assigned {
                continue;
            }

            to_assign.insert(*fingerprint);

            for (id, sector) in &input.open_sectors {
                let avail = sector_max - sector.used;

                // Enough raw space implies enough space with alignment
                // pads included.
                if piece.size <= avail {
                    matches.push(Match {
                        sector: *id,
                        deal: *fingerprint,
                        size: piece.size,
                        padding: avail % piece.size,
                    });
                }
            }
        }

        // Least wasted padding first, then larger pieces, then older
        // sectors to drain them.
        matches.sort_by(|a, b| {
            a.padding
                .cmp(&b.padding)
                .then(b.size.cmp(&a.size))
                .then(a.sector.number.cmp(&b.sector.number))
        });

        for mt in matches {
            let routable = input
                .pending_pieces
                .get(&mt.deal)
                .map(|p| !p.assigned)
                .unwrap_or(false);
            if !routable {
                continue;
            }

            let accept = match input.open_sectors.get(&mt.sector) {
                Some(sector) => {
                    input
                        .assigned_pieces
                        .entry(mt.sector)
                        .or_default()
                        .push(mt.deal);
                    sector.maybe_accept()
                }
                None => continue,
            };

            to_assign.remove(&mt.deal);

            match accept {
                Ok(()) => {
                    if let Some(piece) = input.pending_pieces.get_mut(&mt.deal) {
                        piece.assigned = true;
                    }
                    // One AddPiece event per round; its handler drains the
                    // whole routing entry.
                    input.open_sectors.remove(&mt.sector);
                }
                Err(err) => {
                    error!("sector {} rejected deal {}: {}", mt.sector, mt.deal, err);

                    // The sector's event queue is gone for good: retract
                    // the routing entry, drop the dead sector and fail the
                    // submission.
                    if let Some(assigned) = input.assigned_pieces.get_mut(&mt.sector) {
                        assigned.pop();
                        if assigned.is_empty() {
                            input.assigned_pieces.remove(&mt.sector);
                        }
                    }
                    input.open_sectors.remove(&mt.sector);
                    if let Some(piece) = input.pending_pieces.remove(&mt.deal) {
                        piece.accepted(Err(err));
                    }
                }
            }
        }

        if !to_assign.is_empty() {
            if let Err(err) = self.try_create_deal_sector(input).await {
                error!("failed to create a new sector for deals: {:?}", err);
            }
        }
    }

    /// Allocates and starts a fresh deal sector unless the staging or
    /// sealing caps say otherwise.
    async fn try_create_deal_sector(&self, input: &mut InputState) -> Result<()> {
        let cfg = (self.inner.get_config)();

        if cfg.max_sealing_sectors_for_deals > 0
            && input.stats.cur_sealing() >= cfg.max_sealing_sectors_for_deals
        {
            return Ok(());
        }

        if cfg.max_wait_deals_sectors > 0 && input.stats.cur_staging() >= cfg.max_wait_deals_sectors
        {
            return Ok(());
        }

        let sp = self.inner.seal_proof;
        let number = self.inner.sealer.next_sector_number().await?;
        self.inner.sealer.new_sector(self.sector_id(number), sp).await?;

        info!("creating deal sector {} (proof type {:?})", number, sp);
        input.stats.put(number, SectorPhase::Staging);

        let event_tx = runner::spawn_sector(self.clone(), SectorInfo::new(number, sp, unix_millis()));
        self.inner.sectors.lock().await.insert(number, event_tx);

        Ok(())
    }

    /// WaitDeals entry, evaluated on every (re-)entry. Returns the event
    /// that takes the sector out of waiting, or registers it as open.
    pub(crate) async fn handle_wait_deals(
        &self,
        info: &SectorInfo,
        event_tx: &Sender<SectorEvent>,
    ) -> Result<Option<SectorEvent>> {
        let mut input = self.inner.input.lock().await;
        let sid = self.sector_id(info.sector_number);
        let now = unix_millis();

        if let Some(timer) = input.sector_timers.remove(&sid) {
            if timer.cancel().await.is_some() {
                // The timer beat us to it and already queued a
                // SectorStartPacking; sending another is idempotent.
                info!(
                    "starting to seal deal sector {} (trigger: wait-timeout)",
                    info.sector_number
                );
                return Ok(Some(SectorEvent::StartPacking));
            }
        }

        let ssize = info.sector_type.sector_size();
        let max_deals = deal_per_sector_limit(ssize)?;

        if info.deal_count() >= max_deals {
            info!(
                "starting to seal deal sector {} (trigger: maxdeals)",
                info.sector_number
            );
            return Ok(Some(SectorEvent::StartPacking));
        }

        let used = info.used();
        if used.padded() == PaddedPieceSize::from(ssize) {
            info!(
                "starting to seal deal sector {} (trigger: filled)",
                info.sector_number
            );
            return Ok(Some(SectorEvent::StartPacking));
        }

        if info.creation_time != 0 {
            let cfg = (self.inner.get_config)();
            let seal_time = info.creation_time + cfg.wait_deals_delay.as_millis() as i64;

            if now >= seal_time {
                info!(
                    "starting to seal deal sector {} (trigger: wait-timeout)",
                    info.sector_number
                );
                return Ok(Some(SectorEvent::StartPacking));
            }

            let delay = Duration::from_millis((seal_time - now) as u64);
            let timer_tx = event_tx.clone();
            let number = info.sector_number;

            let timer = task::spawn(async move {
                task::sleep(delay).await;
                info!(
                    "starting to seal deal sector {} (trigger: wait-timer)",
                    number
                );
                if timer_tx.try_send(SectorEvent::StartPacking).is_err() {
                    warn!("sector {}: wait-deals timer fired after shutdown", number);
                }
            });
            input.sector_timers.insert(sid, timer);
        }

        input.open_sectors.insert(
            sid,
            OpenSector {
                used,
                number: info.sector_number,
                event_tx: event_tx.clone(),
            },
        );

        // Run the matcher before releasing the gate, so pieces waiting for
        // space land here immediately.
        self.update_input(&mut input).await;

        Ok(None)
    }

    /// SectorAddPiece entry. Drains the routing table for this sector under
    /// the gate and performs every sealer write with the gate released.
    pub(crate) async fn handle_add_piece(&self, info: &SectorInfo) -> SectorEvent {
        let sid = self.sector_id(info.sector_number);
        let ssize = info.sector_type.sector_size();
        let sector_limit = PaddedPieceSize::from(ssize);

        let batch: Vec<(Cid, Option<PendingPiece>)> = {
            let mut input = self.inner.input.lock().await;
            let fingerprints = input.assigned_pieces.remove(&sid).unwrap_or_default();
            fingerprints
                .into_iter()
                .map(|fp| {
                    let piece = input.pending_pieces.remove(&fp);
                    (fp, piece)
                })
                .collect()
        };

        let mut new_pieces: Vec<Piece> = Vec::new();

        if batch.is_empty() {
            // Nothing routed here; happens when re-entering AddPiece after
            // a restart.
            return SectorEvent::PieceAdded(new_pieces);
        }

        let max_deals = match deal_per_sector_limit(ssize) {
            Ok(n) => n,
            Err(err) => {
                for (_, piece) in batch {
                    if let Some(piece) = piece {
                        piece.accepted(Err(err.clone()));
                    }
                }
                return SectorEvent::AddPieceFailed(err);
            }
        };

        let mut offset = info.used();
        let mut piece_sizes = info.existing_piece_sizes();
        let mut abort: Option<PackerErr> = None;

        for (i, (fingerprint, piece)) in batch.into_iter().enumerate() {
            if let Some(err) = &abort {
                // Deals queued behind a failed write get the same error.
                if let Some(piece) = piece {
                    piece.accepted(Err(err.clone()));
                }
                continue;
            }

            let mut piece = match piece {
                Some(piece) => piece,
                None => {
                    abort = Some(PackerErr::PieceLost {
                        piece: fingerprint,
                        sector: info.sector_number,
                    });
                    continue;
                }
            };

            if info.deal_count() + i + 1 > max_deals {
                piece.accepted(Err(PackerErr::TooManyDealsForSector(info.sector_number)));
                continue;
            }

            let (pads, pad_total) = required_padding(offset.padded(), piece.size.padded());

            if offset.padded() + pad_total + piece.size.padded() > sector_limit {
                piece.accepted(Err(PackerErr::NotEnoughSpace {
                    piece: fingerprint,
                    sector: info.sector_number,
                }));
                continue;
            }

            let mut pad_failed: Option<PackerErr> = None;
            for pad in pads {
                let write = self
                    .inner
                    .sealer
                    .add_piece(
                        DEAL_SECTOR_PRIORITY,
                        sid,
                        piece_sizes.clone(),
                        pad.unpadded(),
                        Box::new(NullReader::new(pad.unpadded())),
                    )
                    .await;

                match write {
                    Ok(written) => {
                        piece_sizes.push(pad.unpadded());
                        new_pieces.push(Piece {
                            piece: written,
                            deal_info: None,
                        });
                    }
                    Err(err) => {
                        pad_failed = Some(PackerErr::SealerIo {
                            sector: info.sector_number,
                            message: format!("writing padding piece: {}", err),
                        });
                        break;
                    }
                }
            }

            if let Some(err) = pad_failed {
                piece.accepted(Err(err.clone()));
                abort = Some(err);
                continue;
            }

            offset += pad_total.unpadded();

            let data = piece.data.take().expect("piece data consumed once");
            let write = self
                .inner
                .sealer
                .add_piece(
                    DEAL_SECTOR_PRIORITY,
                    sid,
                    piece_sizes.clone(),
                    piece.size,
                    data,
                )
                .await;

            match write {
                Ok(written) => {
                    info!(
                        "deal {} added to sector {} (piece {})",
                        piece.deal.deal_id, info.sector_number, written.cid
                    );

                    let size = piece.size;
                    let deal = piece.deal.clone();
                    piece.accepted(Ok((info.sector_number, offset)));

                    offset += size;
                    piece_sizes.push(size);
                    new_pieces.push(Piece {
                        piece: written,
                        deal_info: Some(deal),
                    });
                }
                Err(err) => {
                    let err = PackerErr::SealerIo {
                        sector: info.sector_number,
                        message: format!("writing piece: {}", err),
                    };
                    piece.accepted(Err(err.clone()));
                    abort = Some(err);
                }
            }
        }

        match abort {
            Some(err) => SectorEvent::AddPieceFailed(err),
            None => SectorEvent::PieceAdded(new_pieces),
        }
    }

    /// Takes the sector out of the packing core and hands it to the sealing
    /// pipeline. Pieces routed here but not yet written return to the
    /// pending pool and are matched again on the spot.
    pub(crate) async fn handle_start_packing(&self, info: SectorInfo) {
        let number = info.sector_number;
        let sid = self.sector_id(number);

        {
            let mut input = self.inner.input.lock().await;

            input.open_sectors.remove(&sid);
            if let Some(timer) = input.sector_timers.remove(&sid) {
                let _ = timer.cancel().await;
            }

            let assigned = input.assigned_pieces.remove(&sid).unwrap_or_default();
            for fingerprint in assigned {
                if let Some(piece) = input.pending_pieces.get_mut(&fingerprint) {
                    piece.assigned = false;
                }
            }

            input.stats.put(number, SectorPhase::Sealing);
            self.update_input(&mut input).await;
        }

        self.inner.sectors.lock().await.remove(&number);

        info!(
            "sector {}: handed off for sealing with {} pieces",
            number,
            info.pieces.len()
        );
        if self.inner.packed_tx.try_send(info).is_err() {
            warn!("sector {}: packed-sector receiver dropped", number);
        }
    }

    /// Terminal within the core; cleanup of the sector is a supervisor
    /// concern.
    pub(crate) async fn handle_add_piece_failed(&self, info: &SectorInfo) {
        error!(
            "sector {}: no recovery plan for a failed piece write",
            info.sector_number
        );

        let sid = self.sector_id(info.sector_number);
        {
            let mut input = self.inner.input.lock().await;
            input.open_sectors.remove(&sid);
            if let Some(timer) = input.sector_timers.remove(&sid) {
                let _ = timer.cancel().await;
            }
            input.stats.put(info.sector_number, SectorPhase::Failed);
        }

        self.inner.sectors.lock().await.remove(&info.sector_number);
    }
}

pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
