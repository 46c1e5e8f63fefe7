/// File collection: one main transcript plus zero or more sub-agent transcripts.
///
/// Sub-agent files are named `agent-<id>.jsonl`; the id links them to the
/// `agentId` reported in the main transcript's delegated-call results.
use crate::transcript::{self, TranscriptLine};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One transcript file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFile {
    pub path: PathBuf,
    /// `None` for the main transcript.
    pub agent_id: Option<String>,
}

impl TranscriptFile {
    pub fn main(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            agent_id: None,
        }
    }

    /// Agent file whose id is taken from an `agent-<id>.jsonl` file name.
    pub fn agent(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let id = agent_id_from_path(&path)?;
        Some(Self {
            path,
            agent_id: Some(id),
        })
    }

    pub fn is_agent(&self) -> bool {
        self.agent_id.is_some()
    }

    pub fn open(&self) -> io::Result<BufReader<File>> {
        Ok(BufReader::new(File::open(&self.path)?))
    }

    /// Parse every line of the file, skipping malformed ones.
    pub fn read_lines(&self) -> io::Result<Vec<TranscriptLine>> {
        let mut reader = self.open()?;
        let mut buf = Vec::new();
        let mut lines = Vec::new();
        while next_line(&mut reader, &mut buf)? {
            if let Ok(line) = transcript::parse_line(&buf) {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

fn agent_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("agent-")?.strip_suffix(".jsonl")?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Main transcript plus its sub-agent transcripts.
#[derive(Debug, Clone)]
pub struct FileCollection {
    main: TranscriptFile,
    agents: Vec<TranscriptFile>,
}

impl FileCollection {
    pub fn new(main: impl Into<PathBuf>) -> Self {
        Self {
            main: TranscriptFile::main(main),
            agents: Vec::new(),
        }
    }

    /// Add an agent file. Paths not named `agent-<id>.jsonl` and duplicate ids are ignored.
    pub fn with_agent(mut self, path: impl Into<PathBuf>) -> Self {
        if let Some(file) = TranscriptFile::agent(path) {
            if !self.has_agent_file(file.agent_id.as_deref().unwrap_or_default()) {
                self.agents.push(file);
            }
        }
        self
    }

    /// Build a collection from a main transcript and every file in `agents_dir`
    /// matching `pattern` (e.g. `agent-*.jsonl`), sorted by path.
    pub fn discover(main: &Path, agents_dir: Option<&Path>, pattern: &str) -> Self {
        let mut fc = Self::new(main);
        let Some(dir) = agents_dir else {
            return fc;
        };
        let full = dir.join(pattern);
        let entries = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, pattern = %full.display(), "invalid agent file pattern");
                return fc;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable agent file");
                    None
                }
            })
            .filter(|p| p.as_path() != main)
            .collect();
        paths.sort();
        for path in paths {
            fc = fc.with_agent(path);
        }
        tracing::debug!(agents = fc.agents.len(), "discovered agent transcripts");
        fc
    }

    pub fn main_file(&self) -> &TranscriptFile {
        &self.main
    }

    pub fn agent_files(&self) -> &[TranscriptFile] {
        &self.agents
    }

    /// Main first, then agents in insertion order.
    pub fn all_files(&self) -> impl Iterator<Item = &TranscriptFile> {
        std::iter::once(&self.main).chain(self.agents.iter())
    }

    pub fn has_agent_file(&self, agent_id: &str) -> bool {
        self.agents
            .iter()
            .any(|f| f.agent_id.as_deref() == Some(agent_id))
    }

    pub fn agent_ids(&self) -> HashSet<String> {
        self.agents
            .iter()
            .filter_map(|f| f.agent_id.clone())
            .collect()
    }

    /// Total lines across all files, counted the way a pipeline pass counts them.
    pub fn line_count(&self) -> io::Result<u64> {
        let mut total = 0;
        for file in self.all_files() {
            total += count_lines(file.open()?)?;
        }
        Ok(total)
    }
}

/// Longest transcript line kept in memory, terminator included.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Read the next newline-delimited line into `buf` (terminator stripped).
/// Returns `Ok(false)` at end of input.
///
/// A line longer than [`MAX_LINE_BYTES`] is consumed without being buffered
/// and comes back empty, so it still counts as a line but never parses.
pub(crate) fn next_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool> {
    next_line_capped(reader, buf, MAX_LINE_BYTES)
}

fn next_line_capped<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<bool> {
    buf.clear();
    let mut read_any = false;
    let mut oversize = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            break;
        }
        read_any = true;
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        if !oversize {
            if buf.len() + used > max_bytes {
                oversize = true;
                buf.clear();
                buf.shrink_to_fit();
            } else {
                buf.extend_from_slice(&available[..used]);
            }
        }
        reader.consume(used);
        if done {
            break;
        }
    }
    if oversize {
        tracing::warn!(max_bytes, "skipping oversize transcript line");
        return Ok(true);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(read_any)
}

pub fn count_lines<R: BufRead>(mut reader: R) -> io::Result<u64> {
    let mut buf = Vec::new();
    let mut n = 0;
    while next_line(&mut reader, &mut buf)? {
        n += 1;
    }
    Ok(n)
}
