//! Per-token pricing for known models.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD cost per token for a model name.
///
/// Unknown models fall back to Sonnet pricing so spend is never under-reported.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    let model = model.to_lowercase();
    if model.contains("haiku") {
        (dec!(0.0000008), dec!(0.000004))
    } else if model.contains("opus") {
        (dec!(0.000015), dec!(0.000075))
    } else {
        (dec!(0.000003), dec!(0.000015))
    }
}

/// Total cost of a call given token counts and per-token prices.
pub fn call_cost(
    (input_price, output_price): (Decimal, Decimal),
    input_tokens: u32,
    output_tokens: u32,
) -> Decimal {
    input_price * Decimal::from(input_tokens) + output_price * Decimal::from(output_tokens)
}
