use std::sync::Arc;
use std::time::Duration;

/// Knobs controlling when sectors stop waiting for deals and how many may
/// be staged or sealing at once.
#[derive(Clone, Debug)]
pub struct PackingConfig {
    /// Maximum time a sector waits for more deals before it is packed.
    pub wait_deals_delay: Duration,

    /// Cap on sectors concurrently sealing deal data. 0 means unlimited.
    pub max_sealing_sectors_for_deals: u64,

    /// Cap on sectors concurrently waiting for deals. 0 means unlimited.
    pub max_wait_deals_sectors: u64,
}

impl Default for PackingConfig {
    fn default() -> PackingConfig {
        PackingConfig {
            wait_deals_delay: Duration::from_secs(6 * 60 * 60),
            max_sealing_sectors_for_deals: 0,
            max_wait_deals_sectors: 2,
        }
    }
}

/// Configuration accessor invoked on every read, so reconfiguration is
/// picked up by the next decision that needs it.
pub type GetPackingConfigFunc = Arc<dyn Fn() -> PackingConfig + Send + Sync>;
