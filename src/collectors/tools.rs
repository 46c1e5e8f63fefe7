/// Tool usage collector (all files).
///
/// Only assistant lines make tool calls. Every named tool use is provisionally a
/// success and registers `id -> name` in the pass context; an error result for
/// that id later demotes it. Success tallies are clamped at zero when the pass
/// finishes.
use super::Outcomes;
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCard {
    pub total_calls: u64,
    pub error_count: u64,
    pub tool_stats: BTreeMap<String, Outcomes>,
}

#[derive(Debug, Default)]
pub struct ToolsCollector {
    card: ToolsCard,
}

impl ToolsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn card(&self) -> &ToolsCard {
        &self.card
    }

    pub fn into_card(self) -> ToolsCard {
        self.card
    }

    fn count_tool_uses(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        for tool in line.tool_uses() {
            self.card.total_calls += 1;
            if tool.name.is_empty() {
                continue;
            }
            if !tool.id.is_empty() {
                ctx.tool_names.insert(tool.id.clone(), tool.name.clone());
            }
            self.card
                .tool_stats
                .entry(tool.name.clone())
                .or_default()
                .success += 1;
        }
    }
}

impl Collector for ToolsCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if line.is_assistant() {
            self.count_tool_uses(line, ctx);
            return;
        }

        if !line.is_user() {
            return;
        }
        for result in line.tool_results().filter(|r| r.is_error) {
            self.card.error_count += 1;
            let Some(name) = ctx.tool_name(&result.tool_use_id) else {
                continue;
            };
            if let Some(stats) = self.card.tool_stats.get_mut(name) {
                stats.success -= 1;
                stats.errors += 1;
            }
        }

        // Tool calls made inside an agent with no transcript of its own.
        if ctx.is_main_file() {
            for (_, agent) in line.agent_results() {
                if !ctx.has_agent_file(&agent.agent_id) {
                    self.card.total_calls += agent.total_tool_use_count;
                }
            }
        }
    }

    fn finalize(&mut self, _ctx: &CollectContext) {
        for stats in self.card.tool_stats.values_mut() {
            stats.success = stats.success.max(0);
        }
    }
}
