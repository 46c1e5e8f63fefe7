/// Redaction marker collector (all files).
///
/// Markers are matched against the raw line bytes. The marker alphabet has no
/// characters JSON would escape, so a marker inside any string value appears
/// verbatim in the encoded line.
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::TranscriptLine;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static REDACTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[REDACTED:([A-Z][A-Z0-9_]*)\]").unwrap());

/// Placeholder used in documentation of the marker format itself.
const PLACEHOLDER_TYPE: &[u8] = b"TYPE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactionsCard {
    pub total_redactions: u64,
    pub redaction_counts: BTreeMap<String, u64>,
}

impl RedactionsCard {
    pub fn is_empty(&self) -> bool {
        self.total_redactions == 0
    }
}

#[derive(Debug, Default)]
pub struct RedactionsCollector {
    card: RedactionsCard,
}

impl RedactionsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_card(self) -> RedactionsCard {
        self.card
    }
}

impl Collector for RedactionsCollector {
    fn collect(&mut self, _line: &TranscriptLine, ctx: &mut CollectContext) {
        for caps in REDACTION_MARKER.captures_iter(ctx.raw_line()) {
            let kind = &caps[1];
            if kind == PLACEHOLDER_TYPE {
                continue;
            }
            self.card.total_redactions += 1;
            *self
                .card
                .redaction_counts
                .entry(String::from_utf8_lossy(kind).into_owned())
                .or_default() += 1;
        }
    }
}
