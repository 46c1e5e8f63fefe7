/// Parsing of the generator's reply into a recap card.
use super::{RecapCard, RecapError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MAX_TITLE_CHARS: usize = 100;
const MAX_OBSERVATIONS: usize = 3;
const MAX_SUGGESTIONS: usize = 2;

/// One list entry, optionally pointing at the transcript record it is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawItem")]
pub struct AnnotatedItem {
    pub text: String,
    /// Record uuid once resolved; empty when the item refers to nothing.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
}

/// Items arrive as bare strings or as `{text, message_id}` where the id may
/// be a number or a string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawItem {
    Plain(String),
    Annotated {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        message_id: Option<serde_json::Value>,
    },
}

impl From<RawItem> for AnnotatedItem {
    fn from(raw: RawItem) -> Self {
        match raw {
            RawItem::Plain(text) => AnnotatedItem {
                text,
                message_id: String::new(),
            },
            RawItem::Annotated { text, message_id } => {
                let message_id = match message_id {
                    Some(serde_json::Value::Number(n)) => n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f as i64))
                        .map(|i| i.to_string())
                        .unwrap_or_default(),
                    Some(serde_json::Value::String(s)) => s,
                    _ => String::new(),
                };
                AnnotatedItem {
                    text: text.unwrap_or_default(),
                    message_id,
                }
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecap {
    suggested_session_title: Option<String>,
    recap: Option<String>,
    went_well: Option<Vec<AnnotatedItem>>,
    went_bad: Option<Vec<AnnotatedItem>>,
    human_suggestions: Option<Vec<AnnotatedItem>>,
    environment_suggestions: Option<Vec<AnnotatedItem>>,
    default_context_suggestions: Option<Vec<AnnotatedItem>>,
}

/// Parse the JSON object embedded in `reply` (first `{` to last `}`), cap
/// list lengths and the title, and resolve element ids through `id_map`.
///
/// Generation metadata (model, token counts, timing) is left at defaults.
pub fn parse_response(reply: &str, id_map: &HashMap<u32, String>) -> Result<RecapCard, RecapError> {
    let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) else {
        return Err(RecapError::Unparseable("no JSON object in response".to_string()));
    };
    if end < start {
        return Err(RecapError::Unparseable("no JSON object in response".to_string()));
    }
    let raw: RawRecap = serde_json::from_str(&reply[start..=end])
        .map_err(|e| RecapError::Unparseable(e.to_string()))?;

    let list = |items: Option<Vec<AnnotatedItem>>, max: usize| {
        let mut items = items.unwrap_or_default();
        items.truncate(max);
        for item in &mut items {
            resolve_id(item, id_map);
        }
        items
    };

    Ok(RecapCard {
        suggested_session_title: raw
            .suggested_session_title
            .unwrap_or_default()
            .chars()
            .take(MAX_TITLE_CHARS)
            .collect(),
        recap: raw.recap.unwrap_or_default(),
        went_well: list(raw.went_well, MAX_OBSERVATIONS),
        went_bad: list(raw.went_bad, MAX_OBSERVATIONS),
        human_suggestions: list(raw.human_suggestions, MAX_SUGGESTIONS),
        environment_suggestions: list(raw.environment_suggestions, MAX_SUGGESTIONS),
        default_context_suggestions: list(raw.default_context_suggestions, MAX_SUGGESTIONS),
        ..Default::default()
    })
}

/// Replace an element number with its record uuid; anything unresolvable is cleared.
fn resolve_id(item: &mut AnnotatedItem, id_map: &HashMap<u32, String>) {
    if item.message_id.is_empty() {
        return;
    }
    item.message_id = item
        .message_id
        .parse::<u32>()
        .ok()
        .and_then(|n| id_map.get(&n).cloned())
        .unwrap_or_default();
}
