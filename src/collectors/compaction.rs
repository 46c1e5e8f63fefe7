/// Compaction collector (main file only).
///
/// Manual compactions are counted but never timed: their parent-to-boundary gap
/// includes however long the person took to ask for one.
use super::mean_ms;
use crate::pipeline::{CollectContext, Collector};
use crate::transcript::{CompactTrigger, TranscriptLine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub auto: u64,
    pub manual: u64,
    pub avg_time_ms: Option<i64>,
}

#[derive(Debug, Default)]
pub struct CompactionCollector {
    stats: CompactionStats,
    samples: Vec<i64>,
}

impl CompactionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    pub fn into_stats(self) -> CompactionStats {
        self.stats
    }
}

impl Collector for CompactionCollector {
    fn collect(&mut self, line: &TranscriptLine, ctx: &mut CollectContext) {
        if !ctx.is_main_file() || !line.is_compact_boundary() {
            return;
        }
        let Some(meta) = &line.compact_metadata else {
            return;
        };
        match meta.trigger() {
            Some(CompactTrigger::Auto) => {
                self.stats.auto += 1;
                let parent = ctx.timestamp_of(&line.logical_parent_uuid);
                if let (Some(start), Some(end)) = (parent, line.timestamp) {
                    let delta = (end - start).num_milliseconds();
                    if delta >= 0 {
                        self.samples.push(delta);
                    }
                }
            }
            Some(CompactTrigger::Manual) => self.stats.manual += 1,
            None => {}
        }
    }

    fn finalize(&mut self, _ctx: &CollectContext) {
        self.stats.avg_time_ms = mean_ms(&self.samples);
    }
}
