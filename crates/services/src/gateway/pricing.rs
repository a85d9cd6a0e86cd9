//! Nano-dollar cost estimates for usage-log reporting. Estimates only;
//! billing truth lives with the upstream provider.

/// Per-million-token prices in nano-dollars.
#[derive(Debug, Clone, Copy)]
pub struct TokenPricing {
    pub input_cost_per_million: i64,
    pub output_cost_per_million: i64,
}

impl TokenPricing {
    pub fn estimate_nano_usd(&self, input_tokens: i64, output_tokens: i64) -> i64 {
        let input_cost = (input_tokens * self.input_cost_per_million) / 1_000_000;
        let output_cost = (output_tokens * self.output_cost_per_million) / 1_000_000;
        input_cost + output_cost
    }
}

/// Known model prices. Unknown models get no estimate rather than a wrong
/// one.
pub fn pricing_for(model: &str) -> Option<TokenPricing> {
    match model {
        "gpt-4o" => Some(TokenPricing {
            input_cost_per_million: 2_500_000_000,
            output_cost_per_million: 10_000_000_000,
        }),
        "gpt-4o-mini" => Some(TokenPricing {
            input_cost_per_million: 150_000_000,
            output_cost_per_million: 600_000_000,
        }),
        _ => None,
    }
}

/// Convenience for the usage log: estimate from a model name, or None when
/// the model is unknown.
pub fn estimate_cost_nano_usd(model: &str, input_tokens: i64, output_tokens: i64) -> Option<i64> {
    pricing_for(model).map(|p| p.estimate_nano_usd(input_tokens, output_tokens))
}
