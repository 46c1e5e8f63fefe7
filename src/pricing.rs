/// Model pricing: model identifier -> per-million-token rate card -> exact decimal cost.
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// USD per million tokens for each token class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateCard {
    pub input: Decimal,
    pub output: Decimal,
    pub cache_write: Decimal,
    pub cache_read: Decimal,
}

impl RateCard {
    /// Explicit all-zero card for models we cannot price.
    pub const ZERO: RateCard = RateCard {
        input: Decimal::ZERO,
        output: Decimal::ZERO,
        cache_write: Decimal::ZERO,
        cache_read: Decimal::ZERO,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

const PRODUCT_TIERS: &[&str] = &["opus", "sonnet", "haiku"];

/// Normalise a model identifier to `tier-major[-minor]`.
///
/// `claude-opus-4-5-20251101` -> `opus-4-5`, `claude-sonnet-4-20250514` -> `sonnet-4`.
/// Identifiers outside the known tiers come back with only the vendor prefix stripped.
pub fn model_family(model: &str) -> String {
    let name = model.strip_prefix("claude-").unwrap_or(model);
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() < 2 || !PRODUCT_TIERS.contains(&parts[0]) || !is_single_digit(parts[1]) {
        return name.to_string();
    }
    match parts.get(2) {
        Some(minor) if is_single_digit(minor) => format!("{}-{}-{}", parts[0], parts[1], minor),
        _ => format!("{}-{}", parts[0], parts[1]),
    }
}

fn is_single_digit(s: &str) -> bool {
    s.len() == 1 && s.as_bytes()[0].is_ascii_digit()
}

fn rates(family: &str) -> Option<RateCard> {
    let card = |input, output, cache_write, cache_read| RateCard {
        input,
        output,
        cache_write,
        cache_read,
    };
    Some(match family {
        "opus-4-6" | "opus-4-5" => card(dec!(5), dec!(25), dec!(6.25), dec!(0.50)),
        "opus-4-1" | "opus-4" | "opus-3" => card(dec!(15), dec!(75), dec!(18.75), dec!(1.50)),
        "sonnet-4-5" | "sonnet-4" | "sonnet-3-7" => {
            card(dec!(3), dec!(15), dec!(3.75), dec!(0.30))
        }
        "haiku-4-5" => card(dec!(1), dec!(5), dec!(1.25), dec!(0.10)),
        "haiku-3-5" => card(dec!(0.80), dec!(4), dec!(1.00), dec!(0.08)),
        "haiku-3" => card(dec!(0.25), dec!(1.25), dec!(0.30), dec!(0.03)),
        _ => return None,
    })
}

/// Rate card for a model. Unknown models get [`RateCard::ZERO`] and a warning;
/// another model's price is never substituted.
pub fn price(model: &str) -> RateCard {
    let family = model_family(model);
    match rates(&family) {
        Some(card) => card,
        None => {
            tracing::warn!(model = %model, family = %family, "unknown model, using zero pricing");
            RateCard::ZERO
        }
    }
}

/// Σ(tokens × rate) / 1,000,000, in exact decimal arithmetic.
pub fn cost(
    card: &RateCard,
    input: u64,
    output: u64,
    cache_write: u64,
    cache_read: u64,
) -> Decimal {
    let total = Decimal::from(input) * card.input
        + Decimal::from(output) * card.output
        + Decimal::from(cache_write) * card.cache_write
        + Decimal::from(cache_read) * card.cache_read;
    total / Decimal::from(1_000_000u64)
}
