use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{KisClient, PaperBroker};
use crate::auth::CredentialCache;
use crate::config::{AppConfig, BrokerConfig};
use crate::error::Result;
use crate::throttle::RateLimiterRegistry;

use super::{parse_broker_kind, BrokerClient, BrokerKind};

/// Create one broker client from its config entry, registering its rate
/// limiter and token issuer along the way.
pub fn build_broker(
    broker_id: &str,
    config: &BrokerConfig,
    cache: Arc<CredentialCache>,
    limiters: &RateLimiterRegistry,
) -> Result<Arc<dyn BrokerClient>> {
    let kind = parse_broker_kind(&config.kind)?;
    limiters.register(broker_id, &config.rate_limit);
    let limiter = limiters.get(broker_id)?;

    match kind {
        BrokerKind::Kis => {
            let client = KisClient::new(broker_id, config, cache.clone(), limiter)?;
            cache.register(broker_id, &config.account_id, client.token_issuer());
            Ok(Arc::new(client))
        }
        BrokerKind::Paper => Ok(Arc::new(PaperBroker::new(
            broker_id,
            &config.account_id,
            limiter,
        ))),
    }
}

/// Create the runtime broker set from `AppConfig`.
pub fn build_brokers(
    app_config: &AppConfig,
    cache: Arc<CredentialCache>,
    limiters: &RateLimiterRegistry,
) -> Result<HashMap<String, Arc<dyn BrokerClient>>> {
    let mut brokers = HashMap::new();
    for (broker_id, broker_config) in &app_config.brokers {
        let client = build_broker(broker_id, broker_config, cache.clone(), limiters)?;
        brokers.insert(broker_id.clone(), client);
    }
    Ok(brokers)
}
