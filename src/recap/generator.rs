/// Recap generation backends.
///
/// The production backend runs a command-line model client as a subprocess,
/// writes the prompt to its stdin and reads the reply from stdout.
use super::RecapError;
use crate::config::RecapConfig;
use serde::Deserialize;
use std::future::Future;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct RecapRequest {
    pub model: String,
    pub max_output_tokens: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecapGeneration {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub trait RecapGenerator {
    fn generate(
        &self,
        request: &RecapRequest,
    ) -> impl Future<Output = Result<RecapGeneration, RecapError>> + Send;
}

/// Runs `command args...` with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandGenerator {
    pub fn from_config(config: &RecapConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

/// Build the command arguments, replacing `{model}` and `{max_tokens}` placeholders.
fn build_args(args: &[String], request: &RecapRequest) -> Vec<String> {
    let max_tokens = request.max_output_tokens.to_string();
    args.iter()
        .map(|arg| {
            arg.replace("{model}", &request.model)
                .replace("{max_tokens}", &max_tokens)
        })
        .collect()
}

/// Reply shape of clients run with JSON output.
#[derive(Deserialize)]
struct Envelope {
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct EnvelopeUsage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Accept a JSON envelope `{result, usage}` or, failing that, raw text.
fn read_reply(stdout: &str) -> Result<RecapGeneration, RecapError> {
    match serde_json::from_str::<Envelope>(stdout.trim()) {
        Ok(env) if env.is_error => Err(RecapError::Failed(env.result)),
        Ok(env) => {
            let usage = env.usage.unwrap_or_default();
            Ok(RecapGeneration {
                text: env.result,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            })
        }
        Err(_) => Ok(RecapGeneration {
            text: stdout.to_string(),
            ..Default::default()
        }),
    }
}

impl RecapGenerator for CommandGenerator {
    fn generate(
        &self,
        request: &RecapRequest,
    ) -> impl Future<Output = Result<RecapGeneration, RecapError>> + Send {
        async move {
            let args = build_args(&self.args, request);
            tracing::debug!(
                command = %self.command,
                args = ?args,
                prompt_bytes = request.prompt.len(),
                "spawning recap generator"
            );

            let mut child = Command::new(&self.command)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true) // a missed deadline drops the future
                .spawn()
                .map_err(|source| RecapError::Spawn {
                    command: self.command.clone(),
                    source,
                })?;

            let stdin = child.stdin.take();
            let feed = async {
                if let Some(mut stdin) = stdin {
                    // The child may exit without reading; its status decides the outcome.
                    if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                        tracing::debug!(error = %e, "recap generator closed stdin early");
                    }
                }
            };
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            let output = output.map_err(RecapError::Io)?;

            if !output.status.success() {
                return Err(RecapError::Exit {
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            read_reply(&String::from_utf8_lossy(&output.stdout))
        }
    }
}
