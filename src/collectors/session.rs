/// Session summary collector (main file only): message breakdown, models and wall-clock span.
use super::CompactionStats;
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCard {
    pub total_messages: u64,
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub human_prompts: u64,
    pub tool_results: u64,
    pub text_responses: u64,
    /// Assistant lines with tool use only (no text, no thinking).
    pub tool_calls: u64,
    /// Assistant lines with thinking only (no text, no tool use).
    pub thinking_blocks: u64,
    pub duration_ms: Option<i64>,
    pub models_used: Vec<String>,
    pub compaction_auto: u64,
    pub compaction_manual: u64,
    pub compaction_avg_time_ms: Option<i64>,
}

#[derive(Debug, Default)]
pub struct SessionCollector {
    card: SessionCard,
    models: BTreeSet<String>,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl SessionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished card, with compaction figures from the compaction collector.
    pub fn into_card(self, compaction: &CompactionStats) -> SessionCard {
        SessionCard {
            compaction_auto: compaction.auto,
            compaction_manual: compaction.manual,
            compaction_avg_time_ms: compaction.avg_time_ms,
            ..self.card
        }
    }
}

impl Collector for SessionCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if !ctx.is_main_file() {
            return;
        }
        let card = &mut self.card;
        card.total_messages += 1;

        if line.is_user() {
            card.user_messages += 1;
            if line.is_human_prompt() {
                card.human_prompts += 1;
            } else if line.is_tool_result_message() {
                card.tool_results += 1;
            }
        }

        if line.is_assistant() {
            card.assistant_messages += 1;
            if !line.model().is_empty() {
                self.models.insert(line.model().to_string());
            }
            let text = line.has_text();
            let tools = line.has_tool_use();
            let thinking = line.has_thinking();
            if text {
                card.text_responses += 1;
            } else if tools && !thinking {
                card.tool_calls += 1;
            } else if thinking && !tools {
                card.thinking_blocks += 1;
            }
        }

        if let Some(ts) = line.timestamp {
            self.first = Some(self.first.map_or(ts, |f| f.min(ts)));
            self.last = Some(self.last.map_or(ts, |l| l.max(ts)));
        }
    }

    fn finalize(&mut self, _ctx: &CollectContext) {
        self.card.models_used = self.models.iter().cloned().collect();
        self.card.duration_ms = match (self.first, self.last) {
            (Some(first), Some(last)) if last > first => Some((last - first).num_milliseconds()),
            _ => None,
        };
    }
}
