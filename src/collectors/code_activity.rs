/// Code activity collector (all files).
///
/// Read/write paths are deduplicated; the extension histogram counts every
/// operation, so reading one file twice adds two to its language.
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeActivityCard {
    pub files_read: u64,
    pub files_modified: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub search_count: u64,
    /// Extension without the leading dot -> operation count.
    pub language_breakdown: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct CodeActivityCollector {
    files_read: HashSet<String>,
    files_modified: HashSet<String>,
    lines_added: u64,
    lines_removed: u64,
    search_count: u64,
    extensions: BTreeMap<String, u64>,
}

impl CodeActivityCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn card(&self) -> CodeActivityCard {
        CodeActivityCard {
            files_read: self.files_read.len() as u64,
            files_modified: self.files_modified.len() as u64,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            search_count: self.search_count,
            language_breakdown: self.extensions.clone(),
        }
    }

    fn track_extension(&mut self, path: &str) {
        if let Some(ext) = extension(path) {
            *self.extensions.entry(ext.to_string()).or_default() += 1;
        }
    }
}

impl Collector for CodeActivityCollector {
    fn collect(&mut self, line: &TranscriptLine, _ctx: &mut CollectContext) {
        if !line.is_assistant() {
            return;
        }
        for tool in line.tool_uses() {
            match tool.name.as_str() {
                "Read" => {
                    if let Some(path) = tool.input_str("file_path") {
                        self.files_read.insert(path.to_string());
                        self.track_extension(path);
                    }
                }
                "Write" => {
                    if let Some(path) = tool.input_str("file_path") {
                        self.files_modified.insert(path.to_string());
                        self.track_extension(path);
                        self.lines_added += count_lines(tool.input_str("content").unwrap_or(""));
                    }
                }
                "Edit" => {
                    if let Some(path) = tool.input_str("file_path") {
                        self.files_modified.insert(path.to_string());
                        self.track_extension(path);
                        self.lines_removed +=
                            count_lines(tool.input_str("old_string").unwrap_or(""));
                        self.lines_added += count_lines(tool.input_str("new_string").unwrap_or(""));
                    }
                }
                "Glob" | "Grep" => self.search_count += 1,
                _ => {}
            }
        }
    }
}

/// Lines in a text segment; a single trailing newline does not start a new line.
pub fn count_lines(s: &str) -> u64 {
    if s.is_empty() {
        return 0;
    }
    let body = s.strip_suffix('\n').unwrap_or(s);
    body.matches('\n').count() as u64 + 1
}

/// Extension of the last path component, without the dot.
fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::testutil::run_lines;
    use serde_json::json;

    fn tool(name: &str, input: serde_json::Value) -> String {
        json!({
            "type": "assistant",
            "message": {
                "usage": {},
                "content": [{"type": "tool_use", "id": "x", "name": name, "input": input}]
            }
        })
        .to_string()
    }

    fn run(lines: &[String]) -> CodeActivityCard {
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut c = CodeActivityCollector::new();
        run_lines(&refs, &mut [&mut c]);
        c.card()
    }

    #[test]
    fn reads_dedupe_paths_but_not_extensions() {
        let card = run(&[
            tool("Read", json!({"file_path": "/src/main.rs"})),
            tool("Read", json!({"file_path": "/src/main.rs"})),
        ]);
        assert_eq!(card.files_read, 1);
        assert_eq!(card.language_breakdown["rs"], 2);
    }

    #[test]
    fn write_and_edit_count_lines() {
        let card = run(&[
            tool(
                "Write",
                json!({"file_path": "/a/new.go", "content": "package a\n\nfunc A() {}\n"}),
            ),
            tool(
                "Edit",
                json!({"file_path": "/a/new.go", "old_string": "func A() {}", "new_string": "func A() {\n\treturn\n}"}),
            ),
        ]);
        assert_eq!(card.files_modified, 1);
        assert_eq!(card.lines_added, 3 + 3);
        assert_eq!(card.lines_removed, 1);
        assert_eq!(card.language_breakdown["go"], 2);
    }

    #[test]
    fn searches_counted() {
        let card = run(&[
            tool("Grep", json!({"pattern": "x"})),
            tool("Glob", json!({"pattern": "*.rs"})),
            tool("Bash", json!({"command": "ls"})),
        ]);
        assert_eq!(card.search_count, 2);
        assert_eq!(card, CodeActivityCard { search_count: 2, ..Default::default() });
    }

    #[test]
    fn missing_path_ignored() {
        let card = run(&[tool("Write", json!({"content": "a\nb"}))]);
        assert_eq!(card.files_modified, 0);
        assert_eq!(card.lines_added, 0);
    }

    #[test]
    fn count_lines_rules() {
        assert_eq!(count_lines(""), 0);
        assert_eq!(count_lines("one"), 1);
        assert_eq!(count_lines("one\n"), 1);
        assert_eq!(count_lines("one\ntwo"), 2);
        assert_eq!(count_lines("one\ntwo\n\n"), 3);
        assert_eq!(count_lines("\n"), 1);
    }

    #[test]
    fn extension_rules() {
        assert_eq!(extension("/x/y/file.tar.gz"), Some("gz"));
        assert_eq!(extension("/x/.gitignore"), Some("gitignore"));
        assert_eq!(extension("/x.d/Makefile"), None);
        assert_eq!(extension("trailing."), None);
    }
}
