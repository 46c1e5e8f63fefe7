//! The recap card: a model-written summary of a session.
//!
//! Generating a recap is slow and rate-limited, so it does not follow the cheap
//! cards' "recompute on any new line" rule. A cached recap is served until it is
//! both behind the transcript and older than the staleness window. Regeneration
//! is guarded by an advisory, time-bounded lock so concurrent requests for one
//! session do not all call the generator. Whoever loses the race serves the
//! cached card, flagged stale, instead of waiting.

pub mod excerpt;
pub mod gate;
pub mod generator;
pub mod response;

pub use gate::{can_acquire_lock, is_stale};
pub use generator::{CommandGenerator, RecapGeneration, RecapGenerator, RecapRequest};
pub use response::{parse_response, AnnotatedItem};

use crate::cards::{CheapCards, Category, StoredCard};
use crate::config::RecapConfig;
use crate::files::FileCollection;
use crate::store::{CardStore, StoreError};
use chrono::{DateTime, Utc};
use gate::LockGuard;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Stored recap payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecapCard {
    pub recap: String,
    pub went_well: Vec<AnnotatedItem>,
    pub went_bad: Vec<AnnotatedItem>,
    pub human_suggestions: Vec<AnnotatedItem>,
    pub environment_suggestions: Vec<AnnotatedItem>,
    pub default_context_suggestions: Vec<AnnotatedItem>,
    pub suggested_session_title: String,
    pub model_used: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub generation_time_ms: Option<u64>,
}

/// A recap as served, with its stamp and whether it lags the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecapView {
    #[serde(flatten)]
    pub card: RecapCard,
    pub computed_at: DateTime<Utc>,
    pub up_to_line: u64,
    pub is_stale: bool,
}

/// Tunables for the recap gate, resolved from config.
#[derive(Debug, Clone)]
pub struct RecapSettings {
    pub model: String,
    pub max_output_tokens: u32,
    pub max_content_chars: usize,
    pub staleness_window: chrono::Duration,
    pub lock_timeout: chrono::Duration,
    pub generation_timeout: std::time::Duration,
}

impl From<&RecapConfig> for RecapSettings {
    fn from(config: &RecapConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            max_content_chars: config.max_content_chars(),
            staleness_window: config.staleness_window(),
            lock_timeout: config.lock_timeout(),
            generation_timeout: config.generation_timeout(),
        }
    }
}

#[derive(Debug)]
pub enum RecapError {
    /// Failed to start the generator subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Io(std::io::Error),
    /// Generator exited unsuccessfully.
    Exit {
        code: Option<i32>,
        stderr: String,
    },
    /// Generator reported an error in its reply.
    Failed(String),
    Timeout(std::time::Duration),
    /// Nothing in the transcript worth summarising.
    EmptyTranscript,
    Unparseable(String),
    Store(StoreError),
}

impl std::fmt::Display for RecapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecapError::Spawn { command, source } => {
                write!(f, "failed to spawn recap generator {command}: {source}")
            }
            RecapError::Io(e) => write!(f, "I/O error during recap generation: {e}"),
            RecapError::Exit { code, stderr } => match code {
                Some(code) => write!(f, "recap generator exited with code {code}: {stderr}"),
                None => write!(f, "recap generator killed by signal: {stderr}"),
            },
            RecapError::Failed(msg) => write!(f, "recap generator reported an error: {msg}"),
            RecapError::Timeout(d) => {
                write!(f, "recap generation timed out after {}s", d.as_secs_f64())
            }
            RecapError::EmptyTranscript => write!(f, "no content to summarise"),
            RecapError::Unparseable(msg) => write!(f, "unparseable recap response: {msg}"),
            RecapError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RecapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecapError::Spawn { source, .. } => Some(source),
            RecapError::Io(e) => Some(e),
            RecapError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RecapError {
    fn from(e: StoreError) -> Self {
        RecapError::Store(e)
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Generated(RecapView),
    /// Another requester holds the lock.
    Skipped,
}

/// Claim the lock, generate, and store a fresh recap.
///
/// The lock is released on every path: by the card write on success and by a
/// drop guard otherwise (errors, timeouts, and cancellation of this future).
pub async fn refresh_recap<S, G>(
    store: &S,
    generator: &G,
    files: &FileCollection,
    cards: &CheapCards,
    session_id: &str,
    line_count: u64,
    settings: &RecapSettings,
) -> Result<RefreshOutcome, RecapError>
where
    S: CardStore + ?Sized,
    G: RecapGenerator,
{
    if !store.try_claim_recap_lock(session_id, Utc::now(), settings.lock_timeout)? {
        tracing::debug!(session_id, "recap lock held elsewhere, skipping");
        return Ok(RefreshOutcome::Skipped);
    }
    let guard = LockGuard::new(store, session_id);

    let excerpt = excerpt::prepare_transcript(files).map_err(RecapError::Io)?;
    if excerpt.elements == 0 {
        return Err(RecapError::EmptyTranscript);
    }
    let stats = excerpt::prepare_stats(cards);
    let content = excerpt::build_content(&excerpt, &stats, settings.max_content_chars);
    let request = RecapRequest {
        model: settings.model.clone(),
        max_output_tokens: settings.max_output_tokens,
        prompt: excerpt::build_prompt(&content),
    };

    let started = Instant::now();
    let generation = tokio::time::timeout(settings.generation_timeout, generator.generate(&request))
        .await
        .map_err(|_| RecapError::Timeout(settings.generation_timeout))??;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut card = parse_response(&generation.text, &excerpt.id_map).inspect_err(|e| {
        tracing::warn!(
            error = %e,
            model = %settings.model,
            response_len = generation.text.len(),
            "recap response parse failed"
        );
    })?;
    card.model_used = settings.model.clone();
    card.input_tokens = generation.input_tokens;
    card.output_tokens = generation.output_tokens;
    card.generation_time_ms = Some(elapsed_ms);

    let computed_at = Utc::now();
    let row = StoredCard {
        session_id: session_id.to_string(),
        category: Category::SmartRecap,
        version: Category::SmartRecap.version(),
        computed_at,
        up_to_line: line_count,
        payload: serde_json::to_value(&card).map_err(StoreError::from)?,
        computing_started_at: None,
    };
    store.upsert_recap(&row)?;
    guard.disarm();

    tracing::info!(
        session_id,
        input_tokens = card.input_tokens,
        output_tokens = card.output_tokens,
        generation_ms = elapsed_ms,
        "recap generated"
    );
    Ok(RefreshOutcome::Generated(RecapView {
        card,
        computed_at,
        up_to_line: line_count,
        is_stale: false,
    }))
}

/// Serve the recap for a session, regenerating it when stale and the lock is free.
///
/// Best effort: failures are logged and the cached card (flagged stale) or
/// nothing is returned.
pub async fn serve_recap<S, G>(
    store: &S,
    generator: &G,
    files: &FileCollection,
    cards: &CheapCards,
    session_id: &str,
    line_count: u64,
    settings: &RecapSettings,
) -> Option<RecapView>
where
    S: CardStore + ?Sized,
    G: RecapGenerator,
{
    let now = Utc::now();
    let row = match store.get_card(session_id, Category::SmartRecap) {
        Ok(row) => row,
        Err(e) => {
            tracing::warn!(error = %e, session_id, "failed to read cached recap");
            None
        }
    };
    let cached = row.as_ref().and_then(decode);
    let cached_row = cached.as_ref().map(|(row, _)| *row);
    let stale = is_stale(cached_row, line_count, settings.staleness_window, now);

    let cached_view = |is_stale: bool| {
        cached.as_ref().map(|(row, card)| RecapView {
            card: card.clone(),
            computed_at: row.computed_at,
            up_to_line: row.up_to_line,
            is_stale,
        })
    };

    if !stale {
        return cached_view(false);
    }
    if !can_acquire_lock(row.as_ref(), settings.lock_timeout, now) {
        return cached_view(true);
    }
    match refresh_recap(store, generator, files, cards, session_id, line_count, settings).await {
        Ok(RefreshOutcome::Generated(view)) => Some(view),
        Ok(RefreshOutcome::Skipped) => cached_view(true),
        Err(e) => {
            tracing::warn!(error = %e, session_id, "recap generation failed");
            cached_view(true)
        }
    }
}

/// A current-version recap row and its decoded payload. Lock-only placeholder
/// rows and older versions yield `None`.
fn decode(row: &StoredCard) -> Option<(&StoredCard, RecapCard)> {
    if !row.is_current_version() {
        return None;
    }
    match serde_json::from_value(row.payload.clone()) {
        Ok(card) => Some((row, card)),
        Err(e) => {
            tracing::warn!(error = %e, session_id = %row.session_id, "undecodable recap card");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{self, SqliteStore};
    use std::future::Future;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const REPLY: &str = r#"{"suggested_session_title": "Add flag", "recap": "Added a flag.",
        "went_well": [{"text": "Clear ask", "message_id": 1}]}"#;

    struct FakeGenerator {
        reply: Result<&'static str, &'static str>,
        delay: Duration,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeGenerator {
        fn replying(reply: &'static str) -> Self {
            Self {
                reply: Ok(reply),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: Err("overloaded"),
                ..Self::replying("")
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::replying(REPLY)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RecapGenerator for FakeGenerator {
        fn generate(
            &self,
            request: &RecapRequest,
        ) -> impl Future<Output = Result<RecapGeneration, RecapError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            async move {
                tokio::time::sleep(self.delay).await;
                match self.reply {
                    Ok(text) => Ok(RecapGeneration {
                        text: text.to_string(),
                        input_tokens: 120,
                        output_tokens: 40,
                    }),
                    Err(msg) => Err(RecapError::Failed(msg.to_string())),
                }
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: SqliteStore,
        files: FileCollection,
        settings: RecapSettings,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = store::open_or_create(&dir.path().join("cards.db")).unwrap();
        let main: PathBuf = dir.path().join("main.jsonl");
        std::fs::write(
            &main,
            [
                r#"{"type":"user","uuid":"u-1","message":{"content":"add a --dry-run flag"}}"#,
                r#"{"type":"assistant","uuid":"a-1","message":{"usage":{},"content":[{"type":"text","text":"Done."}]}}"#,
            ]
            .join("\n"),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store,
            files: FileCollection::new(main),
            settings: RecapSettings::from(&RecapConfig::default()),
        }
    }

    fn seed_recap(store: &SqliteStore, up_to_line: u64, age: chrono::Duration, version: u32) {
        let card = RecapCard {
            recap: "cached".into(),
            ..Default::default()
        };
        store
            .upsert_recap(&StoredCard {
                session_id: "s1".into(),
                category: Category::SmartRecap,
                version,
                computed_at: Utc::now() - age,
                up_to_line,
                payload: serde_json::to_value(&card).unwrap(),
                computing_started_at: None,
            })
            .unwrap();
    }

    async fn serve(fx: &Fixture, generator: &FakeGenerator, line_count: u64) -> Option<RecapView> {
        serve_recap(
            &fx.store,
            generator,
            &fx.files,
            &CheapCards::default(),
            "s1",
            line_count,
            &fx.settings,
        )
        .await
    }

    fn lock_of(store: &SqliteStore) -> Option<DateTime<Utc>> {
        store
            .get_card("s1", Category::SmartRecap)
            .unwrap()
            .and_then(|c| c.computing_started_at)
    }

    #[tokio::test]
    async fn first_request_generates_and_stores() {
        let fx = fixture();
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 2).await.unwrap();

        assert_eq!(generator.calls(), 1);
        assert!(!view.is_stale);
        assert_eq!(view.up_to_line, 2);
        assert_eq!(view.card.recap, "Added a flag.");
        assert_eq!(view.card.went_well[0].message_id, "u-1");
        assert_eq!(view.card.model_used, "claude-haiku-4-5");
        assert_eq!(view.card.input_tokens, 120);
        assert!(view.card.generation_time_ms.is_some());
        assert_eq!(lock_of(&fx.store), None);

        let prompt = &generator.prompts.lock().unwrap()[0];
        assert!(prompt.contains("<user id=\"1\">\nadd a --dry-run flag\n</user>"));
        assert!(prompt.contains("<session_stats>"));
    }

    #[tokio::test]
    async fn covering_card_served_without_generation() {
        let fx = fixture();
        seed_recap(&fx.store, 10, chrono::Duration::hours(5), 1);
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 10).await.unwrap();
        assert_eq!(generator.calls(), 0);
        assert_eq!(view.card.recap, "cached");
        assert!(!view.is_stale);
    }

    #[tokio::test]
    async fn new_lines_inside_window_keep_cached_card() {
        let fx = fixture();
        seed_recap(&fx.store, 10, chrono::Duration::minutes(1), 1);
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 50).await.unwrap();
        assert_eq!(generator.calls(), 0);
        assert_eq!(view.card.recap, "cached");
    }

    #[tokio::test]
    async fn stale_card_regenerated() {
        let fx = fixture();
        seed_recap(&fx.store, 1, chrono::Duration::minutes(11), 1);
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 2).await.unwrap();
        assert_eq!(generator.calls(), 1);
        assert_eq!(view.card.recap, "Added a flag.");
    }

    #[tokio::test]
    async fn old_version_regenerated_regardless_of_coverage() {
        let fx = fixture();
        seed_recap(&fx.store, 100, chrono::Duration::zero(), 0);
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 2).await.unwrap();
        assert_eq!(generator.calls(), 1);
        assert_eq!(view.card.recap, "Added a flag.");
    }

    #[tokio::test]
    async fn held_lock_serves_cached_card_as_stale() {
        let fx = fixture();
        seed_recap(&fx.store, 1, chrono::Duration::hours(1), 1);
        assert!(fx
            .store
            .try_claim_recap_lock("s1", Utc::now(), fx.settings.lock_timeout)
            .unwrap());
        let generator = FakeGenerator::replying(REPLY);
        let view = serve(&fx, &generator, 2).await.unwrap();
        assert_eq!(generator.calls(), 0);
        assert!(view.is_stale);
        assert_eq!(view.card.recap, "cached");
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let fx = fixture();
        let long_ago = Utc::now() - chrono::Duration::minutes(5);
        assert!(fx
            .store
            .try_claim_recap_lock("s1", long_ago, fx.settings.lock_timeout)
            .unwrap());
        let generator = FakeGenerator::replying(REPLY);
        assert!(serve(&fx, &generator, 2).await.is_some());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn generator_failure_releases_lock_and_serves_cache() {
        let fx = fixture();
        seed_recap(&fx.store, 1, chrono::Duration::hours(1), 1);
        let generator = FakeGenerator::failing();
        let view = serve(&fx, &generator, 2).await.unwrap();
        assert_eq!(generator.calls(), 1);
        assert!(view.is_stale);
        assert_eq!(view.card.recap, "cached");
        assert_eq!(lock_of(&fx.store), None);
    }

    #[tokio::test]
    async fn failure_without_cache_serves_nothing() {
        let fx = fixture();
        let generator = FakeGenerator::failing();
        assert!(serve(&fx, &generator, 2).await.is_none());
        assert_eq!(lock_of(&fx.store), None);
    }

    #[tokio::test]
    async fn unparseable_reply_releases_lock() {
        let fx = fixture();
        let generator = FakeGenerator::replying("sorry, no JSON today");
        assert!(serve(&fx, &generator, 2).await.is_none());
        assert_eq!(lock_of(&fx.store), None);
    }

    #[tokio::test]
    async fn timeout_releases_lock() {
        let mut fx = fixture();
        fx.settings.generation_timeout = Duration::from_millis(20);
        let generator = FakeGenerator::slow(Duration::from_millis(500));
        let err = refresh_recap(
            &fx.store,
            &generator,
            &fx.files,
            &CheapCards::default(),
            "s1",
            2,
            &fx.settings,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RecapError::Timeout(_)));
        assert_eq!(lock_of(&fx.store), None);
    }

    #[tokio::test]
    async fn concurrent_requests_generate_once() {
        let fx = fixture();
        let generator = FakeGenerator::slow(Duration::from_millis(50));
        let (a, b) = tokio::join!(serve(&fx, &generator, 2), serve(&fx, &generator, 2));
        assert_eq!(generator.calls(), 1);
        // Exactly one requester produced the card; the other found the lock held.
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
    }

    #[tokio::test]
    async fn empty_transcript_is_an_error() {
        let fx = fixture();
        std::fs::write(fx.files.main_file().path.clone(), "{\"type\":\"system\"}\n").unwrap();
        let generator = FakeGenerator::replying(REPLY);
        let err = refresh_recap(
            &fx.store,
            &generator,
            &fx.files,
            &CheapCards::default(),
            "s1",
            1,
            &fx.settings,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RecapError::EmptyTranscript));
        assert_eq!(generator.calls(), 0);
        assert_eq!(lock_of(&fx.store), None);
    }
}
