//! Versioned, line-stamped card snapshots and their validity rules.
//!
//! A card covers a session's transcript up to `up_to_line`. Transcripts only
//! grow, so a card stays valid until more lines appear or the computation for
//! its category changes version.

use crate::collectors::{
    AgentsAndSkillsCard, CodeActivityCard, ConversationCard, RedactionsCard, SessionCard,
    TokensCard, ToolsCard,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Tokens,
    Session,
    Tools,
    CodeActivity,
    Conversation,
    AgentsAndSkills,
    Redactions,
    SmartRecap,
}

impl Category {
    /// Categories recomputed together by one collector pass.
    pub const CHEAP: [Category; 7] = [
        Category::Tokens,
        Category::Session,
        Category::Tools,
        Category::CodeActivity,
        Category::Conversation,
        Category::AgentsAndSkills,
        Category::Redactions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tokens => "tokens",
            Category::Session => "session",
            Category::Tools => "tools",
            Category::CodeActivity => "code_activity",
            Category::Conversation => "conversation",
            Category::AgentsAndSkills => "agents_and_skills",
            Category::Redactions => "redactions",
            Category::SmartRecap => "smart_recap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tokens" => Some(Category::Tokens),
            "session" => Some(Category::Session),
            "tools" => Some(Category::Tools),
            "code_activity" => Some(Category::CodeActivity),
            "conversation" => Some(Category::Conversation),
            "agents_and_skills" => Some(Category::AgentsAndSkills),
            "redactions" => Some(Category::Redactions),
            "smart_recap" => Some(Category::SmartRecap),
            _ => None,
        }
    }

    /// Current computation version. Bump when a category's output changes shape
    /// or meaning; every stored card of an older version becomes invalid.
    pub fn version(&self) -> u32 {
        match self {
            Category::Tokens => 2,
            Category::Session => 4,
            Category::Tools => 2,
            Category::CodeActivity => 2,
            Category::Conversation => 2,
            Category::AgentsAndSkills => 1,
            Category::Redactions => 2,
            Category::SmartRecap => 1,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted card row. The payload is opaque to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCard {
    pub session_id: String,
    pub category: Category,
    pub version: u32,
    pub computed_at: DateTime<Utc>,
    pub up_to_line: u64,
    pub payload: serde_json::Value,
    /// Recap regeneration lock; always `None` for cheap categories.
    pub computing_started_at: Option<DateTime<Utc>>,
}

impl StoredCard {
    pub fn is_current_version(&self) -> bool {
        self.version == self.category.version()
    }
}

/// True when the card exists, is at its category's current version, and
/// covers at least `current_line_count` lines.
pub fn is_valid(card: Option<&StoredCard>, current_line_count: u64) -> bool {
    match card {
        None => false,
        Some(card) => card.is_current_version() && card.up_to_line >= current_line_count,
    }
}

/// True only if every cheap category is present and individually valid.
pub fn all_valid(cards: &HashMap<Category, StoredCard>, current_line_count: u64) -> bool {
    Category::CHEAP
        .iter()
        .all(|c| is_valid(cards.get(c), current_line_count))
}

#[derive(Debug)]
pub enum CardError {
    Missing(Category),
    Payload {
        category: Category,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for CardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CardError::Missing(c) => write!(f, "no stored card for category {c}"),
            CardError::Payload { category, source } => {
                write!(f, "bad payload for card {category}: {source}")
            }
        }
    }
}

impl std::error::Error for CardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CardError::Missing(_) => None,
            CardError::Payload { source, .. } => Some(source),
        }
    }
}

/// The cheap cards of one session, as produced by a single collector pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheapCards {
    pub tokens: TokensCard,
    pub session: SessionCard,
    pub tools: ToolsCard,
    pub code_activity: CodeActivityCard,
    pub conversation: ConversationCard,
    pub agents_and_skills: AgentsAndSkillsCard,
    pub redactions: RedactionsCard,
}

impl CheapCards {
    /// Stamp every card with one generation's line count and time.
    pub fn to_stored(
        &self,
        session_id: &str,
        up_to_line: u64,
        computed_at: DateTime<Utc>,
    ) -> Result<Vec<StoredCard>, CardError> {
        let payloads = [
            (Category::Tokens, encode(Category::Tokens, &self.tokens)?),
            (Category::Session, encode(Category::Session, &self.session)?),
            (Category::Tools, encode(Category::Tools, &self.tools)?),
            (
                Category::CodeActivity,
                encode(Category::CodeActivity, &self.code_activity)?,
            ),
            (
                Category::Conversation,
                encode(Category::Conversation, &self.conversation)?,
            ),
            (
                Category::AgentsAndSkills,
                encode(Category::AgentsAndSkills, &self.agents_and_skills)?,
            ),
            (
                Category::Redactions,
                encode(Category::Redactions, &self.redactions)?,
            ),
        ];
        Ok(payloads
            .into_iter()
            .map(|(category, payload)| StoredCard {
                session_id: session_id.to_string(),
                category,
                version: category.version(),
                computed_at,
                up_to_line,
                payload,
                computing_started_at: None,
            })
            .collect())
    }

    pub fn from_stored(cards: &HashMap<Category, StoredCard>) -> Result<Self, CardError> {
        Ok(CheapCards {
            tokens: decode(cards, Category::Tokens)?,
            session: decode(cards, Category::Session)?,
            tools: decode(cards, Category::Tools)?,
            code_activity: decode(cards, Category::CodeActivity)?,
            conversation: decode(cards, Category::Conversation)?,
            agents_and_skills: decode(cards, Category::AgentsAndSkills)?,
            redactions: decode(cards, Category::Redactions)?,
        })
    }
}

fn encode<T: Serialize>(category: Category, card: &T) -> Result<serde_json::Value, CardError> {
    serde_json::to_value(card).map_err(|source| CardError::Payload { category, source })
}

fn decode<T: DeserializeOwned>(
    cards: &HashMap<Category, StoredCard>,
    category: Category,
) -> Result<T, CardError> {
    let card = cards.get(&category).ok_or(CardError::Missing(category))?;
    serde_json::from_value(card.payload.clone())
        .map_err(|source| CardError::Payload { category, source })
}
