use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppResult, GatewayError};
use crate::gateways::traits::PayoutGateway;
use crate::ledger::models::Provider;

/// Closed registry of payout gateways keyed by provider enum
pub struct GatewayRegistry {
    gateways: HashMap<Provider, Arc<dyn PayoutGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    pub fn register(&mut self, gateway: Arc<dyn PayoutGateway>) {
        info!("Registering payout gateway: {}", gateway.provider());
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn get(&self, provider: Provider) -> AppResult<Arc<dyn PayoutGateway>> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownProvider(provider.as_str().to_string()).into())
    }

    pub fn registered_providers(&self) -> Vec<Provider> {
        self.gateways.keys().copied().collect()
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
