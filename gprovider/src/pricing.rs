//! Bind-time model settings and per-megatoken pricing.
//!
//! ```rust
//! use gcommon::UsdMicros;
//! use gprovider::{ModelConfig, ModelPricing};
//!
//! let pricing = ModelPricing::new(
//!     UsdMicros::from_micros(150_000),
//!     UsdMicros::from_micros(600_000),
//! );
//! let config = ModelConfig::new("gpt-4o-mini", 4096).with_pricing(pricing);
//! assert_eq!(config.clamp_output(Some(16_384)), 4096);
//! ```

use gcommon::UsdMicros;

const TOKENS_PER_MEGATOKEN: u128 = 1_000_000;

/// Dollar rates per million tokens for one bound model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelPricing {
    pub input_per_mtok: UsdMicros,
    pub output_per_mtok: UsdMicros,
    pub cached_input_per_mtok: Option<UsdMicros>,
    pub image_per_mtok: Option<UsdMicros>,
}

impl ModelPricing {
    pub fn new(input_per_mtok: UsdMicros, output_per_mtok: UsdMicros) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            cached_input_per_mtok: None,
            image_per_mtok: None,
        }
    }

    pub fn with_cached_input(mut self, cached_input_per_mtok: UsdMicros) -> Self {
        self.cached_input_per_mtok = Some(cached_input_per_mtok);
        self
    }

    pub fn with_image(mut self, image_per_mtok: UsdMicros) -> Self {
        self.image_per_mtok = Some(image_per_mtok);
        self
    }

    pub fn price(&self, prompt_tokens: u64, completion_tokens: u64) -> UsdMicros {
        rate(prompt_tokens, self.input_per_mtok)
            .saturating_add(rate(completion_tokens, self.output_per_mtok))
    }

    pub fn price_cached(&self, cached_tokens: u64) -> UsdMicros {
        match self.cached_input_per_mtok {
            Some(per_mtok) => rate(cached_tokens, per_mtok),
            None => UsdMicros::ZERO,
        }
    }

    pub fn price_images(&self, image_tokens: u64) -> UsdMicros {
        match self.image_per_mtok {
            Some(per_mtok) => rate(image_tokens, per_mtok),
            None => UsdMicros::ZERO,
        }
    }
}

fn rate(tokens: u64, per_mtok: UsdMicros) -> UsdMicros {
    let micros = (tokens as u128 * per_mtok.as_micros() as u128) / TOKENS_PER_MEGATOKEN;
    UsdMicros::from_micros(micros.min(u64::MAX as u128) as u64)
}

/// Bind-time configuration for one backend/model pair. The output ceiling is
/// model-specific and clamps every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub pricing: ModelPricing,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_output_tokens,
            temperature: None,
            pricing: ModelPricing::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Effective output ceiling for a request: the caller may lower the
    /// model ceiling but never raise it.
    pub fn clamp_output(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(value) => value.min(self.max_output_tokens),
            None => self.max_output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_charges_per_megatoken() {
        // $0.15 per 1M input tokens, $0.60 per 1M output tokens.
        let pricing = ModelPricing::new(
            UsdMicros::from_micros(150_000),
            UsdMicros::from_micros(600_000),
        );

        // 30 input + 20 output tokens.
        let cost = pricing.price(30, 20);
        assert_eq!(cost.as_micros(), (30 * 150_000 + 20 * 600_000) / 1_000_000);

        // 1M input tokens costs exactly the input rate.
        assert_eq!(pricing.price(1_000_000, 0).as_micros(), 150_000);
    }

    #[test]
    fn cached_and_image_rates_default_to_zero() {
        let pricing = ModelPricing::new(
            UsdMicros::from_micros(150_000),
            UsdMicros::from_micros(600_000),
        );
        assert_eq!(pricing.price_cached(10_000), UsdMicros::ZERO);
        assert_eq!(pricing.price_images(10_000), UsdMicros::ZERO);

        let with_cache = pricing.with_cached_input(UsdMicros::from_micros(75_000));
        assert_eq!(with_cache.price_cached(1_000_000).as_micros(), 75_000);
    }

    #[test]
    fn clamp_output_never_exceeds_model_ceiling() {
        let config = ModelConfig::new("gpt-4o-mini", 4096);
        assert_eq!(config.clamp_output(None), 4096);
        assert_eq!(config.clamp_output(Some(512)), 512);
        assert_eq!(config.clamp_output(Some(65_536)), 4096);
    }
}
