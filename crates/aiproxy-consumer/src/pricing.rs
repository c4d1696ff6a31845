//! Fixed-point billing math.
//!
//! Token counts are integers and prices are expressed per `price_unit`
//! tokens; multiplying as floats throughout would let rounding error creep
//! into a sum of several terms before the final divide. Instead prices are
//! scaled into fixed-point integers once, the weighted sum is accumulated
//! in `i128`, and only the final division back to a billing amount touches
//! floating point.

use aiproxy_core::model::{ModelPrices, Usage};

const FIXED_POINT_SCALE: i128 = 1_000_000_000;

fn to_fixed(price: f64) -> i128 {
    (price * FIXED_POINT_SCALE as f64).round() as i128
}

/// Computes the amount owed for one response's usage against a model's
/// prices:
///
/// ```text
/// prompt'  = prompt_tokens - (cachedPrice>0 ? cached_tokens : 0)
///                          - (cacheCreationPrice>0 ? cache_creation_tokens : 0)
/// amount   = (prompt' * inputPrice + completion_tokens * outputPrice
///             + cached_tokens * cachedPrice
///             + cache_creation_tokens * cacheCreationPrice) / PriceUnit
/// ```
///
/// When `cachedPrice` (or `cacheCreationPrice`) is unset, the corresponding
/// tokens stay inside `prompt'` and are billed at the full input rate
/// instead of falling out of the sum.
pub fn compute_amount(usage: &Usage, prices: &ModelPrices) -> f64 {
    let cached_price = prices.cached_price.unwrap_or(0.0);
    let cache_creation_price = prices.cache_creation_price.unwrap_or(0.0);

    let mut prompt_tokens = usage.prompt_tokens as i128;
    if cached_price > 0.0 {
        prompt_tokens -= usage.cached_tokens as i128;
    }
    if cache_creation_price > 0.0 {
        prompt_tokens -= usage.cache_creation_tokens as i128;
    }
    let prompt_tokens = prompt_tokens.max(0);

    let fixed_sum = prompt_tokens * to_fixed(prices.input_price)
        + (usage.completion_tokens as i128) * to_fixed(prices.output_price)
        + (usage.cached_tokens as i128) * to_fixed(cached_price)
        + (usage.cache_creation_tokens as i128) * to_fixed(cache_creation_price);

    (fixed_sum as f64) / (FIXED_POINT_SCALE as f64) / prices.price_unit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u32, completion: u32, cached: u32, cache_creation: u32) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cached_tokens: cached,
            cache_creation_tokens: cache_creation,
        }
    }

    /// Worked example: prompt=500, completion=250, input=1, output=2 per
    /// 1000 tokens, expect amount=1.0.
    #[test]
    fn matches_worked_example() {
        let prices = ModelPrices {
            input_price: 1.0,
            output_price: 2.0,
            cached_price: None,
            cache_creation_price: None,
            image_price: None,
            price_unit: 1000.0,
        };
        let amount = compute_amount(&usage(500, 250, 0, 0), &prices);
        assert!((amount - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_billed_at_input_rate_when_cached_price_unset() {
        let prices = ModelPrices {
            input_price: 1.0,
            output_price: 2.0,
            cached_price: None,
            cache_creation_price: None,
            image_price: None,
            price_unit: 1000.0,
        };
        let with_cache = compute_amount(&usage(500, 0, 100, 0), &prices);
        let without_cache_distinction = compute_amount(&usage(500, 0, 0, 0), &prices);
        assert!((with_cache - without_cache_distinction).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_discounted_when_cached_price_set() {
        let prices = ModelPrices {
            input_price: 1.0,
            output_price: 2.0,
            cached_price: Some(0.1),
            cache_creation_price: None,
            image_price: None,
            price_unit: 1000.0,
        };
        // prompt' = 500 - 100 = 400; amount = (400*1 + 100*0.1) / 1000
        let amount = compute_amount(&usage(500, 0, 100, 0), &prices);
        assert!((amount - 0.41).abs() < 1e-9);
    }

    #[test]
    fn zero_price_dimensions_contribute_zero() {
        let prices = ModelPrices::default();
        let amount = compute_amount(&usage(1000, 1000, 500, 500), &prices);
        assert_eq!(amount, 0.0);
    }
}
