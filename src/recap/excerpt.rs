/// Generator input: a tagged, numbered rendering of the transcript plus a
/// compact summary of the cheap cards.
///
/// Every rendered element gets a sequential integer id. The model refers back
/// to elements by that id; [`Excerpt::id_map`] turns it into the record uuid.
use crate::cards::CheapCards;
use crate::files::FileCollection;
use crate::search::truncate_utf8;
use crate::transcript::TranscriptLine;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;

const USER_LIMIT: usize = 2000;
const SKILL_LIMIT: usize = 1500;
const THINKING_LIMIT: usize = 2000;
const TEXT_LIMIT: usize = 3000;

const TRUNCATED: &str = "... [truncated]";
const TRANSCRIPT_TRUNCATED: &str = "\n\n[Transcript truncated due to length]";

#[derive(Debug, Default)]
pub struct Excerpt {
    pub transcript: String,
    /// Element id -> uuid of the record it was rendered from.
    pub id_map: HashMap<u32, String>,
    pub elements: u32,
}

impl Excerpt {
    fn push(&mut self, line: &TranscriptLine, render: impl FnOnce(u32) -> String) {
        self.elements += 1;
        let id = self.elements;
        if !line.uuid.is_empty() {
            self.id_map.insert(id, line.uuid.clone());
        }
        self.transcript.push_str(&render(id));
        self.transcript.push('\n');
    }
}

/// Render every file of the collection, main first.
pub fn prepare_transcript(files: &FileCollection) -> io::Result<Excerpt> {
    let mut lines = Vec::new();
    for file in files.all_files() {
        lines.extend(file.read_lines()?);
    }
    let names = tool_names(&lines);

    let mut excerpt = Excerpt {
        transcript: String::from("<transcript>\n"),
        ..Default::default()
    };
    for line in &lines {
        if line.is_user() {
            render_user(&mut excerpt, line, &names);
        } else if line.is_assistant() {
            render_assistant(&mut excerpt, line);
        }
    }
    excerpt.transcript.push_str("</transcript>");
    Ok(excerpt)
}

/// tool_use id -> display name; `Skill` calls are named after the skill they load.
fn tool_names(lines: &[TranscriptLine]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for line in lines.iter().filter(|l| l.is_assistant()) {
        for tool in line.tool_uses().filter(|t| !t.id.is_empty()) {
            let name = match tool.input_str("skill") {
                Some(skill) if tool.name == "Skill" && !skill.is_empty() => skill,
                _ => tool.name.as_str(),
            };
            names.insert(tool.id.clone(), name.to_string());
        }
    }
    names
}

fn render_user(excerpt: &mut Excerpt, line: &TranscriptLine, names: &HashMap<String, String>) {
    if line.is_skill_expansion() {
        let Some(content) = line.text_content().filter(|c| !c.is_empty()) else {
            return;
        };
        let content = clip(content, SKILL_LIMIT);
        match names.get(&line.source_tool_use_id) {
            Some(name) => excerpt.push(line, |id| {
                format!("<skill id=\"{id}\" name=\"{name}\">\n{content}\n</skill>")
            }),
            None => excerpt.push(line, |id| format!("<skill id=\"{id}\">\n{content}\n</skill>")),
        }
        return;
    }

    if line.is_human_prompt() {
        if let Some(content) = line.text_content().filter(|c| !c.is_empty()) {
            let content = clip(content, USER_LIMIT);
            excerpt.push(line, |id| format!("<user id=\"{id}\">\n{content}\n</user>"));
        }
        return;
    }

    let results: Vec<String> = line
        .tool_results()
        .map(|block| {
            let tool = names
                .get(&block.tool_use_id)
                .map(String::as_str)
                .unwrap_or("unknown");
            let status = if block.is_error { "error" } else { "success" };
            format!("  <result tool=\"{tool}\" status=\"{status}\"/>")
        })
        .collect();
    if !results.is_empty() {
        let body = results.join("\n");
        excerpt.push(line, |id| {
            format!("<tool_results id=\"{id}\">\n{body}\n</tool_results>")
        });
    }
}

fn render_assistant(excerpt: &mut Excerpt, line: &TranscriptLine) {
    let mut parts = Vec::new();

    let thinking = line.joined_thinking();
    if !thinking.is_empty() {
        parts.push(format!("<thinking>{}</thinking>", clip(&thinking, THINKING_LIMIT)));
    }
    let text = line.joined_text();
    if !text.is_empty() {
        parts.push(clip(&text, TEXT_LIMIT));
    }
    let tools: Vec<&str> = line.tool_uses().map(|t| t.name.as_str()).collect();
    if !tools.is_empty() {
        parts.push(format!("<tools_called>{}</tools_called>", tools.join(", ")));
    }

    if !parts.is_empty() {
        let body = parts.join("\n");
        excerpt.push(line, |id| format!("<assistant id=\"{id}\">\n{body}\n</assistant>"));
    }
}

fn clip(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    format!("{}{TRUNCATED}", truncate_utf8(s, limit))
}

/// Headline numbers from the cheap cards. Unremarkable values are left out.
pub fn prepare_stats(cards: &CheapCards) -> String {
    let t = &cards.tokens;
    let mut section = vec![("input", t.input.to_string()), ("output", t.output.to_string())];
    let cost = t.estimated_usd.round_dp(2);
    if !cost.is_zero() {
        section.push(("cost_usd", format!("{cost:.2}")));
    }
    if t.cache_read > 0 || t.cache_creation > 0 {
        let total = t.cache_read + t.input;
        if total > 0 {
            let rate = t.cache_read as f64 / total as f64 * 100.0;
            // Near-total cache reuse is the norm and not worth mentioning.
            if rate < 95.0 {
                section.push(("cache_hit_rate_percent", format!("{rate:.1}")));
            }
        }
    }
    let mut sections = vec![("tokens", section)];

    let s = &cards.session;
    let mut section = Vec::new();
    if let Some(ms) = s.duration_ms.filter(|&ms| ms > 0) {
        section.push(("duration_minutes", format!("{:.1}", ms as f64 / 60_000.0)));
    }
    let compactions = s.compaction_auto + s.compaction_manual;
    if compactions > 0 {
        section.push(("compactions", compactions.to_string()));
    }
    sections.push(("session", section));

    let c = &cards.conversation;
    let mut section = vec![
        ("user_turns", c.user_turns.to_string()),
        ("assistant_turns", c.assistant_turns.to_string()),
    ];
    // Only gaps over five minutes suggest the human stepped away.
    if let Some(ms) = c.avg_user_thinking_ms.filter(|&ms| ms > 300_000) {
        section.push(("avg_user_response_minutes", format!("{:.1}", ms as f64 / 60_000.0)));
    }
    if let Some(pct) = c.assistant_utilization {
        section.push(("assistant_utilization_percent", format!("{pct:.1}")));
    }
    sections.push(("conversation", section));

    let code = &cards.code_activity;
    if code.files_read > 0 || code.files_modified > 0 {
        let section = [
            ("files_read", code.files_read),
            ("files_modified", code.files_modified),
            ("lines_added", code.lines_added),
            ("lines_removed", code.lines_removed),
        ]
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(k, n)| (k, n.to_string()))
        .collect();
        sections.push(("code_activity", section));
    }

    let tools = &cards.tools;
    if tools.total_calls > 0 {
        let mut section = vec![("total_calls", tools.total_calls.to_string())];
        if tools.error_count > 0 {
            let rate = tools.error_count as f64 / tools.total_calls as f64 * 100.0;
            section.push(("error_rate_percent", format!("{rate:.1}")));
        }
        sections.push(("tools", section));
    }

    let a = &cards.agents_and_skills;
    if a.agent_invocations > 0 || a.skill_invocations > 0 {
        let section = [
            ("agent_invocations", a.agent_invocations),
            ("skill_invocations", a.skill_invocations),
        ]
        .into_iter()
        .filter(|&(_, n)| n > 0)
        .map(|(k, n)| (k, n.to_string()))
        .collect();
        sections.push(("agents_and_skills", section));
    }

    if !cards.redactions.is_empty() {
        sections.push((
            "redactions",
            vec![("total", cards.redactions.total_redactions.to_string())],
        ));
    }

    let mut out = String::from("<session_stats>\n");
    for (name, fields) in sections {
        let _ = writeln!(out, "  <{name}>");
        for (key, value) in fields {
            let _ = writeln!(out, "    <{key}>{value}</{key}>");
        }
        let _ = writeln!(out, "  </{name}>");
    }
    out.push_str("</session_stats>");
    out
}

const INSTRUCTIONS: &str = r#"You review a recorded session between a developer and an AI coding assistant.

Input:
- <transcript>: the conversation. Every element has a numeric id attribute.
  <user> is a prompt typed by the developer, <skill> is skill text injected
  after a skill was invoked, <assistant> is a reply (with optional <thinking>
  and <tools_called>), <tool_results> lists which tool calls succeeded or failed.
- <session_stats>: computed metrics for the session.

Reply with a single JSON object and nothing else:
{
  "suggested_session_title": "short title for the main task, at most 100 characters",
  "recap": "two or three plain sentences on what happened, mentioning notable stats",
  "went_well": [{"text": "...", "message_id": 3}],
  "went_bad": [{"text": "...", "message_id": 7}],
  "human_suggestions": [{"text": "..."}],
  "environment_suggestions": [{"text": "..."}],
  "default_context_suggestions": [{"text": "..."}]
}

went_well and went_bad hold at most 3 items, the suggestion lists at most 2.
message_id is the id of the element that best illustrates the item; leave it
out when no single element does. Prefer empty lists to low-confidence items.
The session may still be in progress; judge what has happened so far.
Context suggestions must be general working practices, not task details."#;

/// Full generator prompt: instructions followed by the session content.
pub fn build_prompt(content: &str) -> String {
    format!("{INSTRUCTIONS}\n\n{content}")
}

/// Join transcript and stats, trimming the transcript (never the stats) to fit
/// `max_chars`.
pub fn build_content(excerpt: &Excerpt, stats: &str, max_chars: usize) -> String {
    let transcript = excerpt.transcript.as_str();
    let content = format!("{transcript}\n\n{stats}");
    if content.len() <= max_chars {
        return content;
    }
    // Room for the truncation marker.
    let budget = max_chars.saturating_sub(stats.len() + 100);
    if budget == 0 || transcript.len() <= budget {
        return content;
    }
    tracing::debug!(
        chars = content.len(),
        max_chars,
        "truncating transcript excerpt"
    );
    format!(
        "{}{TRANSCRIPT_TRUNCATED}\n\n{stats}",
        truncate_utf8(transcript, budget)
    )
}
