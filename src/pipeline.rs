//! Single-pass collector pipeline.
//!
//! A pass reads a transcript once, line by line. For each line it:
//!
//! 1. bumps the line counter (malformed and empty lines included),
//! 2. parses the record, skipping the line if that fails,
//! 3. records `uuid -> timestamp` in the context when both are present,
//! 4. hands the line and the context to every collector in registration order.
//!
//! Step 3 happens before step 4, so collectors can resolve the timestamp of the
//! current line or any earlier one, never a later one. Lookups a collector adds
//! to the context are visible to collectors after it on the same line and to all
//! collectors on later lines.
//!
//! After the last line every collector's `finalize` runs once, in order. An I/O
//! error aborts the pass and no context is returned.

use crate::files::{self, FileCollection};
use crate::transcript::{self, TranscriptLine};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead};
use std::path::PathBuf;

/// Pass-scoped state threaded through every collector call.
#[derive(Debug, Default)]
pub struct CollectContext {
    pub timestamps: HashMap<String, DateTime<Utc>>,
    pub tool_names: HashMap<String, String>,
    pub line_count: u64,
    /// Agent id of the file currently being read; `None` while reading the main transcript.
    pub agent_id: Option<String>,
    /// Agents that have their own transcript file in this pass.
    pub agent_files: HashSet<String>,
    raw: Vec<u8>,
}

impl CollectContext {
    pub fn is_main_file(&self) -> bool {
        self.agent_id.is_none()
    }

    pub fn has_agent_file(&self, agent_id: &str) -> bool {
        self.agent_files.contains(agent_id)
    }

    pub fn timestamp_of(&self, uuid: &str) -> Option<DateTime<Utc>> {
        self.timestamps.get(uuid).copied()
    }

    pub fn tool_name(&self, tool_use_id: &str) -> Option<&str> {
        self.tool_names.get(tool_use_id).map(String::as_str)
    }

    /// Unparsed bytes of the line being collected.
    pub fn raw_line(&self) -> &[u8] {
        &self.raw
    }
}

/// One metric accumulator fed by a pipeline pass.
pub trait Collector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext);

    fn finalize(&mut self, _ctx: &CollectContext) {}
}

#[derive(Debug)]
pub enum PipelineError {
    Read { path: Option<PathBuf>, source: io::Error },
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Read {
                path: Some(path),
                source,
            } => write!(f, "failed to read transcript {}: {}", path.display(), source),
            PipelineError::Read { path: None, source } => {
                write!(f, "failed to read transcript: {}", source)
            }
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Read { source, .. } => Some(source),
        }
    }
}

/// Run one pass over a single transcript source.
pub fn run<R: BufRead>(
    source: R,
    collectors: &mut [&mut dyn Collector],
) -> Result<CollectContext, PipelineError> {
    let mut ctx = CollectContext::default();
    scan(source, &mut ctx, collectors)
        .map_err(|source| PipelineError::Read { path: None, source })?;
    finalize(&ctx, collectors);
    Ok(ctx)
}

/// Run one pass over every file of a collection, main first, sharing one context.
pub fn run_collection(
    files: &FileCollection,
    collectors: &mut [&mut dyn Collector],
) -> Result<CollectContext, PipelineError> {
    let mut ctx = CollectContext {
        agent_files: files.agent_ids(),
        ..Default::default()
    };
    for file in files.all_files() {
        ctx.agent_id = file.agent_id.clone();
        let read_err = |source| PipelineError::Read {
            path: Some(file.path.clone()),
            source,
        };
        let reader = file.open().map_err(read_err)?;
        scan(reader, &mut ctx, collectors).map_err(read_err)?;
    }
    ctx.agent_id = None;
    finalize(&ctx, collectors);
    tracing::debug!(
        lines = ctx.line_count,
        files = ctx.agent_files.len() + 1,
        "collector pass complete"
    );
    Ok(ctx)
}

fn scan<R: BufRead>(
    mut source: R,
    ctx: &mut CollectContext,
    collectors: &mut [&mut dyn Collector],
) -> io::Result<()> {
    let mut buf = Vec::new();
    while files::next_line(&mut source, &mut buf)? {
        ctx.line_count += 1;
        let line = match transcript::parse_line(&buf) {
            Ok(line) => line,
            Err(_) => continue,
        };
        if let Some(ts) = line.timestamp {
            if !line.uuid.is_empty() {
                ctx.timestamps.insert(line.uuid.clone(), ts);
            }
        }
        std::mem::swap(&mut ctx.raw, &mut buf);
        for c in collectors.iter_mut() {
            c.collect(&line, ctx);
        }
        std::mem::swap(&mut ctx.raw, &mut buf);
    }
    ctx.raw.clear();
    Ok(())
}

fn finalize(ctx: &CollectContext, collectors: &mut [&mut dyn Collector]) {
    for c in collectors.iter_mut() {
        c.finalize(ctx);
    }
}
