/// Token and cost collector (all files).
///
/// Sums the four usage counters of every assistant line and prices each line by
/// its model. Delegated-agent usage summarised in the main transcript is folded
/// in only when the agent has no transcript file of its own; that fallback has no
/// model attached and is priced at zero.
use crate::pipeline::{CollectContext, Collector};
use crate::pricing::{self, RateCard};
use crate::transcript::{TokenUsage, TranscriptLine};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokensCard {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub estimated_usd: Decimal,
    pub fast_turns: u64,
    pub fast_cost_usd: Decimal,
}

#[derive(Debug, Default)]
pub struct TokensCollector {
    card: TokensCard,
    /// Rate cards already looked up this pass, so an unknown model warns once.
    rates: HashMap<String, RateCard>,
}

impl TokensCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn card(&self) -> &TokensCard {
        &self.card
    }

    pub fn into_card(self) -> TokensCard {
        self.card
    }

    fn rate(&mut self, model: &str) -> RateCard {
        *self
            .rates
            .entry(model.to_string())
            .or_insert_with(|| pricing::price(model))
    }

    fn add(&mut self, usage: &TokenUsage, rate: &RateCard) {
        let cost = pricing::cost(
            rate,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_creation_input_tokens,
            usage.cache_read_input_tokens,
        );
        let card = &mut self.card;
        card.input += usage.input_tokens;
        card.output += usage.output_tokens;
        card.cache_creation += usage.cache_creation_input_tokens;
        card.cache_read += usage.cache_read_input_tokens;
        card.estimated_usd += cost;
        if usage.is_fast() {
            card.fast_turns += 1;
            card.fast_cost_usd += cost;
        }
    }
}

impl Collector for TokensCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if line.is_assistant() {
            if let Some(usage) = line.usage() {
                let rate = self.rate(line.model());
                self.add(usage, &rate);
            }
        }

        if !ctx.is_main_file() {
            return;
        }
        for (_, result) in line.agent_results() {
            if ctx.has_agent_file(&result.agent_id) {
                continue;
            }
            if let Some(usage) = &result.usage {
                self.add(usage, &RateCard::ZERO);
            }
        }
    }
}
