/// Cheap-card analysis for one session: serve the cache when every card is
/// current, otherwise recompute all of them in one pass and store the new
/// generation.
use crate::cards::{self, CardError, Category, CheapCards};
use crate::collectors::{
    AgentsAndSkillsCard, AgentsSkillsCollector, CodeActivityCard, CodeActivityCollector,
    CompactionCollector, ConversationCard, ConversationCollector, RedactionsCard,
    RedactionsCollector, SessionCard, SessionCollector, TokensCard, TokensCollector, ToolsCard,
    ToolsCollector,
};
use crate::files::FileCollection;
use crate::pipeline::{self, PipelineError};
use crate::recap::RecapView;
use crate::store::{CardStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Full analytics response for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAnalytics {
    pub session_id: String,
    pub line_count: u64,
    /// Line count the served cards were computed at.
    pub up_to_line: u64,
    pub computed_at: DateTime<Utc>,
    pub tokens: TokensCard,
    pub session: SessionCard,
    pub tools: ToolsCard,
    pub code_activity: CodeActivityCard,
    pub conversation: ConversationCard,
    pub agents_and_skills: AgentsAndSkillsCard,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redactions: Option<RedactionsCard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recap: Option<RecapView>,
}

impl SessionAnalytics {
    fn new(
        session_id: &str,
        line_count: u64,
        up_to_line: u64,
        computed_at: DateTime<Utc>,
        cards: CheapCards,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            line_count,
            up_to_line,
            computed_at,
            tokens: cards.tokens,
            session: cards.session,
            tools: cards.tools,
            code_activity: cards.code_activity,
            conversation: cards.conversation,
            agents_and_skills: cards.agents_and_skills,
            redactions: (!cards.redactions.is_empty()).then_some(cards.redactions),
            recap: None,
        }
    }

    /// The cheap cards this response was assembled from.
    pub fn cheap_cards(&self) -> CheapCards {
        CheapCards {
            tokens: self.tokens.clone(),
            session: self.session.clone(),
            tools: self.tools.clone(),
            code_activity: self.code_activity.clone(),
            conversation: self.conversation.clone(),
            agents_and_skills: self.agents_and_skills.clone(),
            redactions: self.redactions.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
pub enum AnalyzeError {
    Pipeline(PipelineError),
    Store(StoreError),
    Card(CardError),
    /// Counting lines before the pass failed.
    Io(std::io::Error),
}

impl std::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalyzeError::Pipeline(e) => write!(f, "{e}"),
            AnalyzeError::Store(e) => write!(f, "{e}"),
            AnalyzeError::Card(e) => write!(f, "{e}"),
            AnalyzeError::Io(e) => write!(f, "failed to read transcript: {e}"),
        }
    }
}

impl std::error::Error for AnalyzeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnalyzeError::Pipeline(e) => Some(e),
            AnalyzeError::Store(e) => Some(e),
            AnalyzeError::Card(e) => Some(e),
            AnalyzeError::Io(e) => Some(e),
        }
    }
}

impl From<PipelineError> for AnalyzeError {
    fn from(e: PipelineError) -> Self {
        AnalyzeError::Pipeline(e)
    }
}

impl From<StoreError> for AnalyzeError {
    fn from(e: StoreError) -> Self {
        AnalyzeError::Store(e)
    }
}

impl From<CardError> for AnalyzeError {
    fn from(e: CardError) -> Self {
        AnalyzeError::Card(e)
    }
}

/// One pass over the collection producing every cheap card, plus the number
/// of lines the pass read.
pub fn collect_cards(files: &FileCollection) -> Result<(CheapCards, u64), PipelineError> {
    let mut tokens = TokensCollector::new();
    // Registers tool names; must precede collectors that resolve results.
    let mut tools = ToolsCollector::new();
    let mut code = CodeActivityCollector::new();
    let mut conversation = ConversationCollector::new();
    let mut compaction = CompactionCollector::new();
    let mut session = SessionCollector::new();
    let mut agents = AgentsSkillsCollector::new();
    let mut redactions = RedactionsCollector::new();

    let ctx = pipeline::run_collection(
        files,
        &mut [
            &mut tokens,
            &mut tools,
            &mut code,
            &mut conversation,
            &mut compaction,
            &mut session,
            &mut agents,
            &mut redactions,
        ],
    )?;

    let compaction = compaction.into_stats();
    let cards = CheapCards {
        tokens: tokens.into_card(),
        session: session.into_card(&compaction),
        tools: tools.into_card(),
        code_activity: code.card(),
        conversation: conversation.into_card(),
        agents_and_skills: agents.into_card(),
        redactions: redactions.into_card(),
    };
    Ok((cards, ctx.line_count))
}

/// Serve the cheap cards for a session, recomputing them if any is missing,
/// outdated, or behind the transcript.
///
/// A failed pass writes nothing; the previous generation stays in place.
pub fn analyze<S: CardStore + ?Sized>(
    store: &S,
    files: &FileCollection,
    session_id: &str,
) -> Result<SessionAnalytics, AnalyzeError> {
    let line_count = files.line_count().map_err(AnalyzeError::Io)?;

    let cached = store.get_cards(session_id)?;
    if cards::all_valid(&cached, line_count) {
        match CheapCards::from_stored(&cached) {
            Ok(cards) => {
                // A generation is written together, so any card carries its stamp.
                let (up_to_line, computed_at) = Category::CHEAP
                    .iter()
                    .filter_map(|c| cached.get(c))
                    .map(|c| (c.up_to_line, c.computed_at))
                    .min()
                    .unwrap_or((line_count, Utc::now()));
                tracing::debug!(session_id, line_count, "serving cached cards");
                return Ok(SessionAnalytics::new(
                    session_id,
                    line_count,
                    up_to_line,
                    computed_at,
                    cards,
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, session_id, "cached cards unreadable, recomputing");
            }
        }
    }

    let (cards, up_to_line) = collect_cards(files)?;
    let computed_at = Utc::now();
    store.upsert_cards(&cards.to_stored(session_id, up_to_line, computed_at)?)?;
    tracing::info!(session_id, lines = up_to_line, "cards recomputed");

    Ok(SessionAnalytics::new(
        session_id,
        line_count.max(up_to_line),
        up_to_line,
        computed_at,
        cards,
    ))
}
