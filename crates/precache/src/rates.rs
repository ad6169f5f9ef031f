//! Production-rate tracking for the fetch and checksum channels.

use irobot_index::{IndexResult, ProductionRate, ProductionRates, TrackingIndex};
use std::sync::Mutex;

/// The two production channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Fetch,
    Checksum,
}

#[derive(Default)]
struct Rates {
    fetch: Option<ProductionRate>,
    checksum: Option<ProductionRate>,
}

/// In-memory cache of the channel rates derived from the status log.
///
/// When the log empties (e.g. after a full eviction) the last known values
/// are retained, so the estimator keeps working between refreshes.
#[derive(Default)]
pub struct RateTracker {
    inner: Mutex<Rates>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current estimate for a channel, if one has ever been observed.
    pub fn get(&self, channel: Channel) -> Option<ProductionRate> {
        let rates = self.inner.lock().expect("rate tracker lock");
        match channel {
            Channel::Fetch => rates.fetch,
            Channel::Checksum => rates.checksum,
        }
    }

    /// Fold in freshly derived rates, keeping prior values where the log no
    /// longer has samples.
    pub fn update(&self, fresh: ProductionRates) {
        let mut rates = self.inner.lock().expect("rate tracker lock");
        if fresh.fetch.is_some() {
            rates.fetch = fresh.fetch;
        }
        if fresh.checksum.is_some() {
            rates.checksum = fresh.checksum;
        }
    }

    /// Re-derive rates from the tracking index.
    pub async fn refresh(&self, index: &TrackingIndex) -> IndexResult<()> {
        self.update(index.production_rates().await?);
        Ok(())
    }

    /// Both channels' current estimates.
    pub fn snapshot(&self) -> ProductionRates {
        let rates = self.inner.lock().expect("rate tracker lock");
        ProductionRates {
            fetch: rates.fetch,
            checksum: rates.checksum,
        }
    }
}
