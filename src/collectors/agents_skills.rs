/// Sub-agent and skill invocation collector (main file only).
///
/// Two sources feed one card:
/// - delegation tool uses (`Task` with `subagent_type`, `Skill` with `skill`) whose
///   id is remembered and classified when the matching result arrives;
/// - slash-command expansions in human text, which name a skill directly and
///   always count as a success.
use super::Outcomes;
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const AGENT_TOOL: &str = "Task";
const SKILL_TOOL: &str = "Skill";
const UNKNOWN_AGENT: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentsAndSkillsCard {
    pub agent_invocations: u64,
    pub skill_invocations: u64,
    pub agent_stats: BTreeMap<String, Outcomes>,
    pub skill_stats: BTreeMap<String, Outcomes>,
}

#[derive(Debug, Default)]
pub struct AgentsSkillsCollector {
    card: AgentsAndSkillsCard,
    agent_types: HashMap<String, String>,
    skill_names: HashMap<String, String>,
}

impl AgentsSkillsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_card(self) -> AgentsAndSkillsCard {
        self.card
    }

    fn remember_delegations(&mut self, line: &TranscriptLine) {
        for tool in line.tool_uses().filter(|t| !t.id.is_empty()) {
            let (map, key) = match tool.name.as_str() {
                AGENT_TOOL => (&mut self.agent_types, "subagent_type"),
                SKILL_TOOL => (&mut self.skill_names, "skill"),
                _ => continue,
            };
            if let Some(name) = tool.input_str(key) {
                map.insert(tool.id.clone(), name.to_string());
            }
        }
    }

    fn classify_results(&mut self, line: &TranscriptLine) {
        for block in line.tool_results() {
            let is_agent = block
                .tool_use_result
                .as_ref()
                .is_some_and(|r| !r.agent_id.is_empty());
            if is_agent {
                let agent_type = self
                    .agent_types
                    .get(&block.tool_use_id)
                    .map(String::as_str)
                    .unwrap_or(UNKNOWN_AGENT);
                self.card.agent_invocations += 1;
                tally(&mut self.card.agent_stats, agent_type, block.is_error);
            } else if let Some(skill) = self.skill_names.get(&block.tool_use_id) {
                self.card.skill_invocations += 1;
                tally(&mut self.card.skill_stats, skill, block.is_error);
            }
        }
    }
}

fn tally(stats: &mut BTreeMap<String, Outcomes>, name: &str, is_error: bool) {
    let entry = stats.entry(name.to_string()).or_default();
    if is_error {
        entry.errors += 1;
    } else {
        entry.success += 1;
    }
}

impl Collector for AgentsSkillsCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if !ctx.is_main_file() {
            return;
        }
        if line.is_assistant() {
            self.remember_delegations(line);
        }
        if line.is_tool_result_message() {
            self.classify_results(line);
        }
        if let Some(skill) = line.command_skill_name() {
            self.card.skill_invocations += 1;
            tally(&mut self.card.skill_stats, skill, false);
        }
    }
}
