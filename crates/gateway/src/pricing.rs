use std::collections::HashMap;
use tracing::debug;

use crate::config::{ModelConfig, ProviderKind};
use crate::providers::{estimate_tokens, TokenUsage};

/// Dollar price per 1K tokens: (input, output)
pub type TokenPrice = (f64, f64);

/// Cost per 1K tokens for different providers and models
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<(ProviderKind, String), TokenPrice>,
    fallback: TokenPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut prices = HashMap::new();

        // OpenAI pricing (as of 2024)
        prices.insert((ProviderKind::OpenAi, "gpt-4o".to_string()), (0.0025, 0.01));
        prices.insert((ProviderKind::OpenAi, "gpt-4o-mini".to_string()), (0.00015, 0.0006));
        prices.insert((ProviderKind::OpenAi, "gpt-4-turbo".to_string()), (0.01, 0.03));
        prices.insert((ProviderKind::OpenAi, "gpt-3.5-turbo".to_string()), (0.0005, 0.0015));

        // Anthropic pricing
        prices.insert((ProviderKind::Claude, "claude-3-5-sonnet-20241022".to_string()), (0.003, 0.015));
        prices.insert((ProviderKind::Claude, "claude-3-haiku-20240307".to_string()), (0.00025, 0.00125));
        prices.insert((ProviderKind::Claude, "claude-3-opus-20240229".to_string()), (0.015, 0.075));

        // Groq pricing
        prices.insert((ProviderKind::Groq, "llama-3.1-8b-instant".to_string()), (0.00005, 0.00008));
        prices.insert((ProviderKind::Groq, "llama-3.1-70b-versatile".to_string()), (0.00059, 0.00079));
        prices.insert((ProviderKind::Groq, "mixtral-8x7b-32768".to_string()), (0.00024, 0.00024));

        Self {
            prices,
            fallback: (0.001, 0.003),
        }
    }
}

impl PricingTable {
    pub fn set_price(&mut self, provider: ProviderKind, model: &str, price: TokenPrice) {
        self.prices.insert((provider, model.to_string()), price);
    }

    pub fn price(&self, provider: ProviderKind, model: &str) -> TokenPrice {
        self.prices
            .get(&(provider, model.to_string()))
            .copied()
            .unwrap_or(self.fallback)
    }

    /// Whole cents for the given token counts, rounded up
    fn cents(&self, provider: ProviderKind, model: &str, input_tokens: u32, output_tokens: u32) -> u64 {
        let (input, output) = self.price(provider, model);
        let dollars = input_tokens as f64 / 1000.0 * input + output_tokens as f64 / 1000.0 * output;
        (dollars * 100.0).ceil().max(0.0) as u64
    }

    /// Worst-case estimate used at admission: estimated prompt tokens plus
    /// the full output budget
    pub fn estimate_cents(&self, config: &ModelConfig, prompt: &str) -> u64 {
        let estimate = self.cents(config.provider, &config.model, estimate_tokens(prompt), config.max_tokens);
        debug!(provider = %config.provider, model = %config.model, "Estimated cost: {}¢", estimate);
        estimate
    }

    /// Actual cost from vendor-reported usage
    pub fn cost_cents(&self, provider: ProviderKind, model: &str, usage: &TokenUsage) -> u64 {
        self.cents(provider, model, usage.prompt_tokens, usage.completion_tokens)
    }
}
