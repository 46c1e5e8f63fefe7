use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use transcript_cards::analyze;
use transcript_cards::config::Config;
use transcript_cards::files::FileCollection;
use transcript_cards::recap::{self, CommandGenerator, RecapSettings};
use transcript_cards::{search, store};

/// Compute analytics cards for agent session transcripts.
#[derive(Parser, Debug)]
#[command(name = "transcript-cards", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file path
    #[arg(short, long, default_value = "cards.toml", global = true)]
    config: PathBuf,

    /// Card database path (overrides config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the analytics cards of a session as JSON
    Analyze {
        session_id: String,

        /// Main transcript (JSONL)
        transcript: PathBuf,

        /// Directory holding the session's agent-<id>.jsonl files
        #[arg(long)]
        agents_dir: Option<PathBuf>,

        /// Include the model-written recap card
        #[arg(long)]
        recap: bool,
    },
    /// Print the human prompts of a transcript for search indexing
    SearchText {
        /// Main transcript (JSONL)
        transcript: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "transcript-cards failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Analyze {
            session_id,
            transcript,
            agents_dir,
            recap: with_recap,
        } => {
            let config = Config::load(&cli.config)?;
            let db_path = cli.db.unwrap_or_else(|| config.storage.db_path.clone());
            let store = store::open_or_create(&db_path)?;
            let files = FileCollection::discover(
                &transcript,
                agents_dir.as_deref(),
                &config.transcripts.agent_glob,
            );

            let mut analytics = analyze::analyze(&store, &files, &session_id)?;
            if with_recap && config.recap.enabled {
                let settings = RecapSettings::from(&config.recap);
                let generator = CommandGenerator::from_config(&config.recap);
                analytics.recap = recap::serve_recap(
                    &store,
                    &generator,
                    &files,
                    &analytics.cheap_cards(),
                    &session_id,
                    analytics.line_count,
                    &settings,
                )
                .await;
            } else if with_recap {
                tracing::info!("recap disabled in config");
            }
            println!("{}", serde_json::to_string_pretty(&analytics)?);
        }
        Command::SearchText { transcript } => {
            let text = search::extract_user_messages_text(&FileCollection::new(transcript))?;
            println!("{text}");
        }
    }
    Ok(())
}
