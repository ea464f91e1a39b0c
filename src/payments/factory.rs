use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{PhonePeProvider, RazorpayProvider};
use crate::payments::types::ProviderName;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PaymentFactoryConfig {
    pub default_provider: ProviderName,
    pub enabled_providers: Vec<ProviderName>,
}

impl PaymentFactoryConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let default_provider =
            std::env::var("DEFAULT_PAYMENT_PROVIDER").unwrap_or_else(|_| "phonepe".to_string());
        let default_provider = ProviderName::from_str(&default_provider)?;

        let enabled_raw = std::env::var("ENABLED_PAYMENT_PROVIDERS")
            .unwrap_or_else(|_| "phonepe,razorpay".to_string());
        let mut enabled_providers = Vec::new();
        for part in enabled_raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            enabled_providers.push(ProviderName::from_str(value)?);
        }

        if !enabled_providers.contains(&default_provider) {
            return Err(PaymentError::ValidationError {
                message: "default provider must be enabled".to_string(),
                field: Some("DEFAULT_PAYMENT_PROVIDER".to_string()),
            });
        }

        Ok(Self {
            default_provider,
            enabled_providers,
        })
    }
}

pub struct PaymentProviderFactory {
    config: PaymentFactoryConfig,
}

impl PaymentProviderFactory {
    pub fn from_env() -> PaymentResult<Self> {
        let config = PaymentFactoryConfig::from_env()?;
        Ok(Self { config })
    }

    pub fn with_config(config: PaymentFactoryConfig) -> Self {
        Self { config }
    }

    pub fn get_provider(&self, provider: ProviderName) -> PaymentResult<Box<dyn PaymentProvider>> {
        if !self.config.enabled_providers.contains(&provider) {
            return Err(PaymentError::ValidationError {
                message: format!("provider {} is disabled", provider),
                field: Some("provider".to_string()),
            });
        }

        match provider {
            ProviderName::PhonePe => Ok(Box::new(PhonePeProvider::from_env()?)),
            ProviderName::Razorpay => Ok(Box::new(RazorpayProvider::from_env()?)),
        }
    }

    pub fn get_default_provider(&self) -> PaymentResult<Box<dyn PaymentProvider>> {
        self.get_provider(self.config.default_provider.clone())
    }

    pub fn default_provider_name(&self) -> ProviderName {
        self.config.default_provider.clone()
    }

    /// Construct every enabled provider once, at startup. A missing or
    /// malformed credential surfaces here, before the server accepts
    /// traffic, instead of on the first live payment.
    pub fn build_enabled(
        &self,
    ) -> PaymentResult<HashMap<ProviderName, Arc<dyn PaymentProvider>>> {
        let mut providers: HashMap<ProviderName, Arc<dyn PaymentProvider>> = HashMap::new();
        for name in &self.config.enabled_providers {
            let provider: Arc<dyn PaymentProvider> = match name {
                ProviderName::PhonePe => Arc::new(PhonePeProvider::from_env()?),
                ProviderName::Razorpay => Arc::new(RazorpayProvider::from_env()?),
            };
            providers.insert(name.clone(), provider);
        }
        Ok(providers)
    }

    pub fn list_available_providers(&self) -> Vec<ProviderName> {
        self.config.enabled_providers.clone()
    }
}
