use async_std::channel::{unbounded, Receiver, Sender};
use async_std::task;

use crate::input::Packer;
use crate::metadata::SectorInfo;
use crate::sealer::SealerGateway;
use crate::state::{SectorEvent, SectorState};

/// Spawns the event loop owning one sector's metadata and returns the
/// sender feeding its queue. Events from the packer, timers and the
/// administrative API all arrive through that sender; the loop serializes
/// them.
pub(crate) fn spawn_sector<S: SealerGateway>(
    packer: Packer<S>,
    info: SectorInfo,
) -> Sender<SectorEvent> {
    let (event_tx, event_rx) = unbounded();
    let tx = event_tx.clone();

    task::spawn(async move {
        run_sector(packer, info, tx, event_rx).await;
    });

    event_tx
}

async fn run_sector<S: SealerGateway>(
    packer: Packer<S>,
    mut info: SectorInfo,
    event_tx: Sender<SectorEvent>,
    event_rx: Receiver<SectorEvent>,
) {
    info!("sector {}: created, waiting for deals", info.sector_number);

    let mut state = SectorState::WaitDeals;

    loop {
        // Handlers return the event to apply next; a sector idling in
        // WaitDeals takes the next one off its queue instead.
        let event = match state {
            SectorState::WaitDeals => match packer.handle_wait_deals(&info, &event_tx).await {
                Ok(Some(event)) => event,
                Ok(None) => match event_rx.recv().await {
                    Ok(event) => event,
                    Err(_) => return,
                },
                Err(err) => {
                    error!(
                        "sector {}: entering wait-deals: {:?}",
                        info.sector_number, err
                    );
                    return;
                }
            },
            SectorState::AddPiece => packer.handle_add_piece(&info).await,
            SectorState::Packing => {
                packer.handle_start_packing(info).await;
                return;
            }
            SectorState::AddPieceFailed => {
                packer.handle_add_piece_failed(&info).await;
                return;
            }
        };

        if let SectorEvent::AddPieceFailed(err) = &event {
            error!("sector {}: adding piece failed: {}", info.sector_number, err);
        }

        match event.apply(state, &mut info) {
            Some(next) => state = next,
            None => warn!(
                "sector {}: ignoring stale event in state {:?}",
                info.sector_number, state
            ),
        }
    }
}
