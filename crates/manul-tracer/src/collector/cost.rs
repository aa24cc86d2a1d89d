//! Cost estimation for traced calls
//!
//! Prices are per million tokens. Dated model names such as
//! `gpt-4o-mini-2024-07-18` resolve to the longest known prefix.

use std::collections::HashMap;

use crate::models::TraceRecord;

/// Pricing of one model, in USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    /// Prompt tokens
    pub input_per_million: f64,
    /// Completion tokens (reasoning tokens included)
    pub output_per_million: f64,
    /// Prompt tokens served from cache, when the provider discounts them
    pub cached_input_per_million: Option<f64>,
}

impl ModelPricing {
    const fn new(input: f64, output: f64, cached: Option<f64>) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cached_input_per_million: cached,
        }
    }
}

const DEFAULT_PRICING: &[(&str, ModelPricing)] = &[
    ("gpt-4o", ModelPricing::new(2.50, 10.0, Some(1.25))),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60, Some(0.075))),
    ("gpt-4.1", ModelPricing::new(2.0, 8.0, Some(0.50))),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60, Some(0.10))),
    ("gpt-4.1-nano", ModelPricing::new(0.10, 0.40, Some(0.025))),
    ("gpt-4-turbo", ModelPricing::new(10.0, 30.0, None)),
    ("gpt-4", ModelPricing::new(30.0, 60.0, None)),
    ("gpt-3.5-turbo", ModelPricing::new(0.50, 1.50, None)),
    ("o1", ModelPricing::new(15.0, 60.0, Some(7.5))),
    ("o1-mini", ModelPricing::new(1.10, 4.40, Some(0.55))),
    ("o3", ModelPricing::new(2.0, 8.0, Some(0.50))),
    ("o3-mini", ModelPricing::new(1.10, 4.40, Some(0.55))),
    ("o4-mini", ModelPricing::new(1.10, 4.40, Some(0.275))),
];

/// Estimates call cost from token usage
#[derive(Debug, Clone)]
pub struct CostCalculator {
    pricing: HashMap<String, ModelPricing>,
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl CostCalculator {
    /// Calculator with the built-in OpenAI price list
    pub fn new() -> Self {
        Self {
            pricing: DEFAULT_PRICING
                .iter()
                .map(|(model, pricing)| ((*model).to_string(), *pricing))
                .collect(),
        }
    }

    /// Calculator with no prices; every cost is unknown
    pub fn empty() -> Self {
        Self {
            pricing: HashMap::new(),
        }
    }

    /// Cost of a trace, `None` when the model or usage is unknown
    pub fn cost_of(&self, trace: &TraceRecord) -> Option<f64> {
        let model = trace.model_id.as_deref()?;
        let Some(pricing) = self.find_pricing(model) else {
            tracing::debug!(model, "No pricing for model");
            return None;
        };

        let prompt_tokens = trace.prompt_tokens?.max(0);
        let cached_tokens = trace.prompt_cached_tokens.unwrap_or(0).max(0).min(prompt_tokens);
        let prompt = prompt_tokens as f64;
        let cached = cached_tokens as f64;
        let completion = trace.completion_tokens.unwrap_or(0).max(0) as f64;

        let input_cost = match pricing.cached_input_per_million {
            Some(cached_rate) => {
                (prompt - cached) * pricing.input_per_million + cached * cached_rate
            }
            None => prompt * pricing.input_per_million,
        };
        let output_cost = completion * pricing.output_per_million;

        Some((input_cost + output_cost) / 1_000_000.0)
    }

    /// Pricing for a model: exact name, then the longest known prefix
    pub fn find_pricing(&self, model: &str) -> Option<&ModelPricing> {
        if let Some(pricing) = self.pricing.get(model) {
            return Some(pricing);
        }

        self.pricing
            .iter()
            .filter(|(known, _)| model.starts_with(known.as_str()))
            .max_by_key(|(known, _)| known.len())
            .map(|(_, pricing)| pricing)
    }

    /// Add or replace the pricing of a model
    pub fn set_pricing(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.pricing.insert(model.into(), pricing);
    }
}
