//! Per-metric collectors fed by one pipeline pass.
//!
//! Each collector owns its accumulation state and produces one card payload.
//! Collectors marked main-only ignore lines read from sub-agent files.

pub mod agents_skills;
pub mod code_activity;
pub mod compaction;
pub mod conversation;
pub mod redactions;
pub mod session;
pub mod tokens;
pub mod tools;

pub use agents_skills::{AgentsAndSkillsCard, AgentsSkillsCollector};
pub use code_activity::{CodeActivityCard, CodeActivityCollector};
pub use compaction::{CompactionCollector, CompactionStats};
pub use conversation::{ConversationCard, ConversationCollector};
pub use redactions::{RedactionsCard, RedactionsCollector};
pub use session::{SessionCard, SessionCollector};
pub use tokens::{TokensCard, TokensCollector};
pub use tools::{ToolsCard, ToolsCollector};

use serde::{Deserialize, Serialize};

/// Success/error tally for one named tool, agent type or skill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcomes {
    pub success: i64,
    pub errors: i64,
}

/// Integer mean of duration samples; `None` when there are none.
pub(crate) fn mean_ms(samples: &[i64]) -> Option<i64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<i64>() / samples.len() as i64)
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::pipeline::{self, CollectContext, Collector};
    use std::io::Cursor;

    /// Run collectors over in-memory JSONL lines.
    pub fn run_lines(lines: &[&str], collectors: &mut [&mut dyn Collector]) -> CollectContext {
        pipeline::run(Cursor::new(lines.join("\n")), collectors).unwrap()
    }

    pub fn ts(secs: i64) -> String {
        chrono::DateTime::from_timestamp(1_735_689_600 + secs, 0)
            .unwrap()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_is_integer_division() {
        assert_eq!(mean_ms(&[]), None);
        assert_eq!(mean_ms(&[1000]), Some(1000));
        assert_eq!(mean_ms(&[1000, 2001]), Some(1500));
    }
}
