//! LLM Provider implementations for toolweave.
//!
//! All providers implement the `toolweave_core::Provider` trait.
//! [`build_from_config`] turns the `[provider]` config section into one.

pub mod openai_compat;

use std::sync::Arc;

use toolweave_config::ProviderConfig;
use toolweave_core::Provider;
use toolweave_core::error::ProviderError;

pub use openai_compat::OpenAiCompatProvider;

/// Build the configured provider.
///
/// Every supported backend speaks the OpenAI wire format, so the config only
/// selects the endpoint and credentials.
pub fn build_from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = match (&config.api_key, config.name.as_str()) {
        (Some(key), _) => key.clone(),
        (None, "ollama") => "ollama".to_string(),
        (None, name) => {
            return Err(ProviderError::NotConfigured(format!(
                "No API key for provider '{name}'. Set TOOLWEAVE_API_KEY or provider.api_key"
            )));
        }
    };

    let provider = OpenAiCompatProvider::new(&config.name, &config.base_url, api_key)?;
    tracing::debug!(provider = %config.name, base_url = %config.base_url, "Provider configured");
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_configured() {
        let config = ProviderConfig::default();
        assert!(matches!(
            build_from_config(&config),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = ProviderConfig {
            name: "ollama".into(),
            base_url: "http://localhost:11434/v1".into(),
            ..ProviderConfig::default()
        };
        let provider = build_from_config(&config).unwrap();
        assert_eq!(provider.name(), "ollama");
    }
}
