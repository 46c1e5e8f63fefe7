/// Conversation timing collector (main file only).
///
/// An assistant turn runs from a human prompt to the last assistant line before
/// the next prompt (tool round-trips included). User thinking time runs from
/// that last assistant line to the next prompt.
use super::mean_ms;
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationCard {
    pub user_turns: u64,
    /// Assistant lines with visible text; tool-only replies are not counted.
    pub assistant_turns: u64,
    pub avg_assistant_turn_ms: Option<i64>,
    pub avg_user_thinking_ms: Option<i64>,
    pub total_assistant_duration_ms: Option<i64>,
    pub total_user_duration_ms: Option<i64>,
    /// Share of timed wall-clock the assistant was working, in percent.
    pub assistant_utilization: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
enum TurnState {
    AwaitingPrompt {
        last_assistant: Option<DateTime<Utc>>,
    },
    InTurn {
        prompt: DateTime<Utc>,
        last_assistant: Option<DateTime<Utc>>,
    },
}

impl TurnState {
    fn last_assistant(&self) -> Option<DateTime<Utc>> {
        match *self {
            TurnState::AwaitingPrompt { last_assistant } => last_assistant,
            TurnState::InTurn { last_assistant, .. } => last_assistant,
        }
    }

    fn set_last_assistant(&mut self, ts: DateTime<Utc>) {
        match self {
            TurnState::AwaitingPrompt { last_assistant } => *last_assistant = Some(ts),
            TurnState::InTurn { last_assistant, .. } => *last_assistant = Some(ts),
        }
    }
}

#[derive(Debug)]
pub struct ConversationCollector {
    card: ConversationCard,
    state: TurnState,
    turn_samples: Vec<i64>,
    thinking_samples: Vec<i64>,
}

impl Default for ConversationCollector {
    fn default() -> Self {
        Self {
            card: ConversationCard::default(),
            state: TurnState::AwaitingPrompt {
                last_assistant: None,
            },
            turn_samples: Vec::new(),
            thinking_samples: Vec::new(),
        }
    }
}

impl ConversationCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_card(self) -> ConversationCard {
        self.card
    }

    /// Record the open turn's duration if it received a timed response.
    fn close_turn(&mut self) {
        if let TurnState::InTurn {
            prompt,
            last_assistant: Some(last),
        } = self.state
        {
            let ms = (last - prompt).num_milliseconds();
            if ms >= 0 {
                self.turn_samples.push(ms);
            }
        }
    }

    fn on_prompt(&mut self, ts: Option<DateTime<Utc>>) {
        self.card.user_turns += 1;
        let Some(ts) = ts else {
            // No anchor: drop the open turn rather than measure a bogus gap.
            self.state = TurnState::AwaitingPrompt {
                last_assistant: None,
            };
            return;
        };
        self.close_turn();
        if let Some(last) = self.state.last_assistant() {
            let ms = (ts - last).num_milliseconds();
            if ms >= 0 {
                self.thinking_samples.push(ms);
            }
        }
        self.state = TurnState::InTurn {
            prompt: ts,
            last_assistant: None,
        };
    }
}

impl Collector for ConversationCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if !ctx.is_main_file() {
            return;
        }
        if line.is_human_prompt() {
            self.on_prompt(line.timestamp);
            return;
        }
        if !line.is_assistant() {
            return;
        }
        if line.has_text() {
            self.card.assistant_turns += 1;
        }
        if let Some(ts) = line.timestamp {
            self.state.set_last_assistant(ts);
        }
    }

    fn finalize(&mut self, _ctx: &CollectContext) {
        self.close_turn();
        let card = &mut self.card;
        card.avg_assistant_turn_ms = mean_ms(&self.turn_samples);
        card.avg_user_thinking_ms = mean_ms(&self.thinking_samples);

        let assistant: i64 = self.turn_samples.iter().sum();
        let user: i64 = self.thinking_samples.iter().sum();
        card.total_assistant_duration_ms = (!self.turn_samples.is_empty()).then_some(assistant);
        card.total_user_duration_ms = (!self.thinking_samples.is_empty()).then_some(user);
        if assistant + user > 0 {
            let pct = assistant as f64 / (assistant + user) as f64 * 100.0;
            card.assistant_utilization = Some((pct * 10.0).round() / 10.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil::{run_lines, ts};

    fn prompt(secs: i64) -> String {
        format!(
            r#"{{"type":"user","timestamp":"{}","message":{{"content":"do it"}}}}"#,
            ts(secs)
        )
    }

    fn reply(secs: i64, text: bool) -> String {
        let block = if text {
            r#"{"type":"text","text":"done"}"#
        } else {
            r#"{"type":"tool_use","id":"t","name":"Bash","input":{}}"#
        };
        format!(
            r#"{{"type":"assistant","timestamp":"{}","message":{{"usage":{{}},"content":[{block}]}}}}"#,
            ts(secs)
        )
    }

    fn run(lines: &[String]) -> ConversationCard {
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut c = ConversationCollector::new();
        run_lines(&refs, &mut [&mut c]);
        c.into_card()
    }

    #[test]
    fn one_turn_and_one_thinking_gap() {
        let card = run(&[prompt(0), reply(5, true), prompt(20)]);
        assert_eq!(card.user_turns, 2);
        assert_eq!(card.assistant_turns, 1);
        assert_eq!(card.avg_assistant_turn_ms, Some(5_000));
        assert_eq!(card.avg_user_thinking_ms, Some(15_000));
        assert_eq!(card.total_assistant_duration_ms, Some(5_000));
        assert_eq!(card.total_user_duration_ms, Some(15_000));
        assert_eq!(card.assistant_utilization, Some(25.0));
    }

    #[test]
    fn tool_only_replies_time_the_turn_but_not_the_counter() {
        let card = run(&[prompt(0), reply(2, false), reply(8, false), reply(10, true)]);
        assert_eq!(card.assistant_turns, 1);
        // Finalize closes the open turn at the last assistant line.
        assert_eq!(card.avg_assistant_turn_ms, Some(10_000));
        assert_eq!(card.avg_user_thinking_ms, None);
    }

    #[test]
    fn averages_are_independent() {
        let card = run(&[
            prompt(0),
            reply(4, true),
            prompt(10),
            reply(16, true),
            prompt(40),
        ]);
        assert_eq!(card.avg_assistant_turn_ms, Some(5_000));
        // gaps: 6s and 24s
        assert_eq!(card.avg_user_thinking_ms, Some(15_000));
    }

    #[test]
    fn prompt_without_timestamp_resets_anchors() {
        let card = run(&[
            prompt(0),
            reply(5, true),
            r#"{"type":"user","message":{"content":"untimed"}}"#.to_string(),
            reply(50, true),
            prompt(60),
        ]);
        assert_eq!(card.user_turns, 3);
        // The first turn is dropped; no turn is open when reply(50) arrives,
        // so only the thinking gap 50 -> 60 is recorded.
        assert_eq!(card.avg_assistant_turn_ms, None);
        assert_eq!(card.avg_user_thinking_ms, Some(10_000));
    }

    #[test]
    fn untimed_reply_counts_but_records_no_samples() {
        let card = run(&[
            prompt(0),
            r#"{"type":"assistant","message":{"usage":{},"content":[{"type":"text","text":"ok"}]}}"#
                .to_string(),
            prompt(20),
        ]);
        assert_eq!(card.user_turns, 2);
        assert_eq!(card.assistant_turns, 1);
        assert_eq!(card.avg_assistant_turn_ms, None);
        assert_eq!(card.avg_user_thinking_ms, None);
    }

    #[test]
    fn unanswered_prompt_records_nothing() {
        let card = run(&[prompt(0), prompt(30)]);
        assert_eq!(card.user_turns, 2);
        assert_eq!(card.avg_assistant_turn_ms, None);
        assert_eq!(card.avg_user_thinking_ms, None);
        assert_eq!(card.assistant_utilization, None);
    }

    #[test]
    fn tool_results_are_not_prompts() {
        let card = run(&[
            prompt(0),
            reply(1, false),
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t"}]}}"#
                .to_string(),
            reply(3, true),
        ]);
        assert_eq!(card.user_turns, 1);
        assert_eq!(card.avg_assistant_turn_ms, Some(3_000));
    }

    #[test]
    fn empty_transcript() {
        assert_eq!(run(&[]), ConversationCard::default());
    }
}
