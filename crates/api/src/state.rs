//! Shared application state

use std::sync::Arc;

use classbook_billing::{BillingService, OrderIdAllocator, PaymentGatewayClient};
use classbook_shared::{DocumentStore, MemoryDocumentStore};

use crate::config::Config;
use crate::tts::{HttpSpeechSynthesizer, SpeechSynthesizer, TtsError, TtsService};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub billing: Arc<BillingService>,
    pub tts: Arc<TtsService>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to configure payment gateway: {0}")]
    Billing(#[from] classbook_billing::BillingError),
    #[error("Failed to configure speech synthesis: {0}")]
    Tts(#[from] TtsError),
}

impl AppState {
    /// Wire services from configuration
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Result<Self, StateError> {
        let gateway = config
            .gateway_config()
            .map(PaymentGatewayClient::new)
            .transpose()?;
        if gateway.is_none() {
            tracing::warn!("Payments disabled: link generation and confirmation will return 503");
        }
        let billing = BillingService::new(
            store.clone(),
            gateway,
            OrderIdAllocator::new(config.order_id_strategy),
            config.billing_tz_offset_hours,
        )
        .with_webhook_secret(config.payment_webhook_secret.clone());

        let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = match &config.tts_api_url {
            Some(url) => Some(Arc::new(HttpSpeechSynthesizer::new(
                url.clone(),
                config.tts_api_key.clone(),
            )?)),
            None => None,
        };
        let tts = TtsService::new(synthesizer, config.tts_cache_capacity);

        Ok(Self {
            config: Arc::new(config),
            store,
            billing: Arc::new(billing),
            tts: Arc::new(tts),
        })
    }

    /// State over a fresh in-memory store
    pub fn in_memory(config: Config) -> Result<Self, StateError> {
        Self::new(config, Arc::new(MemoryDocumentStore::new()))
    }

    /// Replace the speech backend
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.tts = Arc::new(TtsService::new(Some(synthesizer), self.config.tts_cache_capacity));
        self
    }
}
