/// Transcript record model: a typed, lenient view of one JSONL line.
///
/// Unknown fields are ignored, `null` reads as the field's default, a timestamp
/// that does not parse as RFC 3339 reads as absent, and content blocks that are
/// not JSON objects are dropped. Only a line that is not a JSON object at all (or
/// whose known fields have the wrong shape) fails to parse; callers skip it.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// `<command-name>/skill</command-name>` markup left in human text by a slash-command expansion.
static COMMAND_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<command-name>/?([^<]*)</command-name>").unwrap());

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptLine {
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub kind: String,
    #[serde(default, deserialize_with = "nullable")]
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    pub subtype: String,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(rename = "compactMetadata", default)]
    pub compact_metadata: Option<CompactMetadata>,
    #[serde(rename = "logicalParentUuid", default, deserialize_with = "nullable")]
    pub logical_parent_uuid: String,
    #[serde(rename = "isMeta", default, deserialize_with = "nullable")]
    pub is_meta: bool,
    #[serde(rename = "sourceToolUseID", default, deserialize_with = "nullable")]
    pub source_tool_use_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Message {
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub role: String,
    #[serde(default, deserialize_with = "nullable")]
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub content: Content,
    #[serde(default, deserialize_with = "nullable")]
    pub stop_reason: String,
}

/// Token counters reported for one assistant message (or summarised for a delegated agent).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "nullable")]
    pub input_tokens: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub output_tokens: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub cache_creation_input_tokens: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub cache_read_input_tokens: u64,
    /// "fast" marks an accelerated-speed turn.
    #[serde(default, deserialize_with = "nullable")]
    pub speed: String,
}

impl TokenUsage {
    pub fn is_fast(&self) -> bool {
        self.speed == "fast"
    }
}

/// Message content: either plain text or an ordered list of typed blocks.
#[derive(Debug, Clone, Default)]
pub enum Content {
    #[default]
    Empty,
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => Content::Text(s),
            Value::Array(items) => Content::Blocks(
                items
                    .into_iter()
                    .filter(Value::is_object)
                    .filter_map(|item| serde_json::from_value(item).ok())
                    .collect(),
            ),
            _ => Content::Empty,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub kind: String,
    #[serde(default, deserialize_with = "nullable")]
    pub text: String,
    #[serde(default, deserialize_with = "nullable")]
    pub thinking: String,
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "object_or_empty")]
    pub input: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub tool_use_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub is_error: bool,
    #[serde(rename = "toolUseResult", default)]
    pub tool_use_result: Option<AgentResult>,
}

impl ContentBlock {
    pub fn is_tool_use(&self) -> bool {
        self.kind == "tool_use"
    }

    pub fn is_tool_result(&self) -> bool {
        self.kind == "tool_result"
    }

    /// String-valued input argument, if present and non-empty.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Summary attached to the result of a delegated sub-agent call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentResult {
    #[serde(rename = "agentId", default, deserialize_with = "nullable")]
    pub agent_id: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(rename = "totalTokens", default, deserialize_with = "nullable")]
    pub total_tokens: u64,
    #[serde(rename = "totalToolUseCount", default, deserialize_with = "nullable")]
    pub total_tool_use_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactTrigger {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompactMetadata {
    #[serde(default, deserialize_with = "nullable")]
    pub trigger: String,
    #[serde(rename = "preTokens", default, deserialize_with = "nullable")]
    pub pre_tokens: u64,
}

impl CompactMetadata {
    pub fn trigger(&self) -> Option<CompactTrigger> {
        match self.trigger.as_str() {
            "auto" => Some(CompactTrigger::Auto),
            "manual" => Some(CompactTrigger::Manual),
            _ => None,
        }
    }
}

/// Parse one raw line. Errors mean "skip this line".
pub fn parse_line(raw: &[u8]) -> Result<TranscriptLine, serde_json::Error> {
    serde_json::from_slice(raw)
}

impl TranscriptLine {
    pub fn is_user(&self) -> bool {
        self.kind == "user"
    }

    /// Assistant lines only count when they carry usage counters.
    pub fn is_assistant(&self) -> bool {
        self.kind == "assistant" && self.usage().is_some()
    }

    pub fn is_compact_boundary(&self) -> bool {
        self.kind == "system" && self.subtype == "compact_boundary"
    }

    /// A user line with plain-text content, i.e. typed by a person (or expanded from a command).
    pub fn is_human_prompt(&self) -> bool {
        self.is_user() && matches!(self.content(), Content::Text(_))
    }

    /// A user line whose content is a block list (tool results).
    pub fn is_tool_result_message(&self) -> bool {
        self.is_user() && matches!(self.content(), Content::Blocks(_))
    }

    /// Skill body injected by the harness after a Skill tool call.
    pub fn is_skill_expansion(&self) -> bool {
        self.is_user() && self.is_meta && !self.source_tool_use_id.is_empty()
    }

    pub fn is_command_expansion(&self) -> bool {
        self.command_skill_name().is_some()
    }

    /// Skill named by `<command-name>/name</command-name>` in human text.
    pub fn command_skill_name(&self) -> Option<&str> {
        if !self.is_human_prompt() {
            return None;
        }
        let text = self.text_content()?;
        let caps = COMMAND_NAME.captures(text)?;
        let name = caps.get(1)?.as_str().trim();
        (!name.is_empty()).then_some(name)
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.message.as_ref().and_then(|m| m.usage.as_ref())
    }

    pub fn model(&self) -> &str {
        self.message.as_ref().map(|m| m.model.as_str()).unwrap_or("")
    }

    pub fn content(&self) -> &Content {
        static EMPTY: Content = Content::Empty;
        self.message.as_ref().map(|m| &m.content).unwrap_or(&EMPTY)
    }

    /// Plain-text content, for string-content messages only.
    pub fn text_content(&self) -> Option<&str> {
        match self.content() {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match self.content() {
            Content::Blocks(b) => b,
            _ => &[],
        }
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks().iter().filter(|b| b.is_tool_use())
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks().iter().filter(|b| b.is_tool_result())
    }

    pub fn has_text(&self) -> bool {
        match self.content() {
            Content::Text(_) => true,
            Content::Blocks(b) => b.iter().any(|b| b.kind == "text"),
            Content::Empty => false,
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.tool_uses().next().is_some()
    }

    pub fn has_thinking(&self) -> bool {
        self.blocks().iter().any(|b| b.kind == "thinking")
    }

    /// Sub-agent summaries carried by tool-result blocks of this line.
    pub fn agent_results(&self) -> impl Iterator<Item = (&ContentBlock, &AgentResult)> {
        let blocks: &[ContentBlock] = if self.is_tool_result_message() {
            self.blocks()
        } else {
            &[]
        };
        blocks.iter().filter_map(|b| {
            let r = b.tool_use_result.as_ref()?;
            (b.is_tool_result() && !r.agent_id.is_empty()).then_some((b, r))
        })
    }

    /// Joined text blocks (or the plain text) of a message.
    pub fn joined_text(&self) -> String {
        match self.content() {
            Content::Text(s) => s.clone(),
            Content::Blocks(b) => join_kind(b, "text", |b| &b.text),
            Content::Empty => String::new(),
        }
    }

    pub fn joined_thinking(&self) -> String {
        join_kind(self.blocks(), "thinking", |b| &b.thinking)
    }
}

fn join_kind(blocks: &[ContentBlock], kind: &str, field: fn(&ContentBlock) -> &String) -> String {
    blocks
        .iter()
        .filter(|b| b.kind == kind)
        .map(field)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(m) => m,
        _ => Map::new(),
    })
}
