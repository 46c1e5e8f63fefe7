/// Indexable text for full-text search: what the human actually typed.
use crate::files::{self, FileCollection};
use crate::transcript;
use std::io;

/// Upper bound on extracted text, in bytes.
pub const MAX_USER_TEXT_BYTES: usize = 500 * 1024;

/// Joins the human prompts of the main transcript with `\n`.
///
/// Tool results, skill expansions and slash-command expansions are skipped.
/// Agent transcripts are not read; their "user" lines are delegated prompts
/// written by the assistant. Output stops at [`MAX_USER_TEXT_BYTES`], cut on a
/// character boundary.
pub fn extract_user_messages_text(files: &FileCollection) -> io::Result<String> {
    let mut reader = files.main_file().open()?;
    let mut buf = Vec::new();
    let mut out = String::new();

    while files::next_line(&mut reader, &mut buf)? {
        let Ok(line) = transcript::parse_line(&buf) else {
            continue;
        };
        if line.is_skill_expansion() || line.is_command_expansion() {
            continue;
        }
        let Some(text) = line.text_content().filter(|_| line.is_human_prompt()) else {
            continue;
        };
        if text.is_empty() {
            continue;
        }

        let sep = usize::from(!out.is_empty());
        if out.len() + sep + text.len() > MAX_USER_TEXT_BYTES {
            let remaining = MAX_USER_TEXT_BYTES - out.len();
            if remaining > sep {
                if sep == 1 {
                    out.push('\n');
                }
                out.push_str(truncate_utf8(text, remaining - sep));
            }
            return Ok(out);
        }
        if sep == 1 {
            out.push('\n');
        }
        out.push_str(text);
    }
    Ok(out)
}

/// Longest prefix of `s` no longer than `max_bytes` that ends on a char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_jsonl(dir: &Path, lines: &[String]) -> PathBuf {
        let path = dir.join("main.jsonl");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn human(text: &str) -> String {
        serde_json::json!({"type": "user", "message": {"content": text}}).to_string()
    }

    #[test]
    fn keeps_only_human_prompts() {
        let dir = TempDir::new().unwrap();
        let path = write_jsonl(
            dir.path(),
            &[
                human("fix the login bug"),
                r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t"}]}}"#
                    .to_string(),
                serde_json::json!({
                    "type": "user", "isMeta": true, "sourceToolUseID": "s1",
                    "message": {"content": "Base directory for this skill: ..."}
                })
                .to_string(),
                human("<command-name>/commit</command-name>"),
                r#"{"type":"assistant","message":{"usage":{},"content":[{"type":"text","text":"sure"}]}}"#
                    .to_string(),
                human("now add a test"),
            ],
        );
        let text = extract_user_messages_text(&FileCollection::new(path)).unwrap();
        assert_eq!(text, "fix the login bug\nnow add a test");
    }

    #[test]
    fn agent_files_not_indexed() {
        let dir = TempDir::new().unwrap();
        let main = write_jsonl(dir.path(), &[human("main prompt")]);
        let agent = dir.path().join("agent-a1.jsonl");
        std::fs::write(&agent, human("delegated prompt")).unwrap();
        let fc = FileCollection::new(main).with_agent(agent);
        assert_eq!(extract_user_messages_text(&fc).unwrap(), "main prompt");
    }

    #[test]
    fn output_capped_on_char_boundary() {
        let dir = TempDir::new().unwrap();
        let big = "é".repeat(MAX_USER_TEXT_BYTES / 2 - 1); // MAX - 2 bytes
        let path = write_jsonl(dir.path(), &[human(&big), human("ééé")]);
        let text = extract_user_messages_text(&FileCollection::new(path)).unwrap();
        assert!(text.len() <= MAX_USER_TEXT_BYTES);
        // One byte left after the newline: not enough for a two-byte char.
        assert_eq!(text.len(), MAX_USER_TEXT_BYTES - 1);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn truncate_utf8_backs_off_mid_char() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("héllo", 3), "hé");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn missing_main_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let fc = FileCollection::new(dir.path().join("nope.jsonl"));
        assert!(extract_user_messages_text(&fc).is_err());
    }
}
