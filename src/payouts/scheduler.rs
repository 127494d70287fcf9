// Payout scheduler - periodic discovery and retry cycles
//
// Interval strategy:
// - Discovery groups newly eligible entries into batches
// - The retry sweep re-dispatches failed entries below the ceiling
// - Both are idempotent, so an overlapping or repeated cycle is harmless

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::ledger::models::Provider;
use crate::payouts::discovery::BatchDiscoveryService;
use crate::payouts::retry::RetryService;

/// Payout schedule configuration
#[derive(Debug, Clone)]
pub struct PayoutScheduleConfig {
    /// Minutes between cycles
    pub interval_minutes: u64,
    /// Provider discovery batches are created for
    pub discovery_provider: Provider,
    pub discovery_enabled: bool,
    pub retry_enabled: bool,
}

impl PayoutScheduleConfig {
    pub fn tick_duration(&self) -> Duration {
        // Zero would make tokio's interval spin; clamp to one minute
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }
}

/// Background scheduler driving discovery and the retry sweep
pub struct PayoutScheduler {
    config: PayoutScheduleConfig,
    discovery: Arc<BatchDiscoveryService>,
    retry: Arc<RetryService>,
}

impl PayoutScheduler {
    pub fn new(
        config: PayoutScheduleConfig,
        discovery: Arc<BatchDiscoveryService>,
        retry: Arc<RetryService>,
    ) -> Self {
        Self {
            config,
            discovery,
            retry,
        }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let discovery = self.discovery.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.tick_duration());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Payout scheduler started | every {}m discovery={} retry={}",
                config.interval_minutes, config.discovery_enabled, config.retry_enabled
            );

            loop {
                ticker.tick().await;

                if config.discovery_enabled {
                    match discovery.auto_discover(config.discovery_provider, None).await {
                        Ok(found) if !found.is_empty() => {
                            info!("Scheduled discovery created/updated {} batches", found.len())
                        }
                        Ok(_) => {}
                        Err(e) => error!("Scheduled discovery failed: {:?}", e),
                    }
                }

                if config.retry_enabled {
                    if let Err(e) = retry.sweep().await {
                        error!("Scheduled retry sweep failed: {:?}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration_clamps_zero_interval() {
        let config = PayoutScheduleConfig {
            interval_minutes: 0,
            discovery_provider: Provider::Paystack,
            discovery_enabled: true,
            retry_enabled: true,
        };
        assert_eq!(config.tick_duration(), Duration::from_secs(60));

        let config = PayoutScheduleConfig {
            interval_minutes: 30,
            ..config
        };
        assert_eq!(config.tick_duration(), Duration::from_secs(1800));
    }
}
