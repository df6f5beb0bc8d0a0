use crate::io::open_writer;
use crate::parse::LogValidation;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Per-severity line counts, collected per map task and merged per stage.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ValidationCounters {
    counts: BTreeMap<LogValidation, u64>,
}

impl ValidationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, level: LogValidation) {
        *self.counts.entry(level).or_insert(0) += 1;
    }

    pub fn get(&self, level: LogValidation) -> u64 {
        self.counts.get(&level).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn merge(&mut self, other: &ValidationCounters) {
        for (level, n) in &other.counts {
            *self.counts.entry(*level).or_insert(0) += n;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogValidation, u64)> + '_ {
        self.counts.iter().map(|(l, n)| (*l, *n))
    }
}

/// What one map task did.
#[derive(Clone, Debug, Default)]
pub struct MapTaskStats {
    pub task_id: usize,
    pub num_files: u64,
    pub total_emits: u64,
    pub total_spilled: u64,
    pub total_bytes_out: u64,
    pub total_flushes: u64,
    pub wall_ms: u64,
    pub counters: ValidationCounters,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct MapStats {
    pub tasks: usize,
    pub input_files: u64,
    pub total_emits: u64,
    /// Records written to spill files; below `total_emits` when a combiner ran.
    pub total_spilled: u64,
    pub total_bytes_out: u64,
    pub total_flushes: u64,
    pub min_task_ms: u64,
    pub max_task_ms: u64,
    pub wall_ms: u64,
}

impl MapStats {
    pub fn from_tasks(per_task: &[MapTaskStats], wall_ms: u64) -> Self {
        Self {
            tasks: per_task.len(),
            input_files: per_task.iter().map(|t| t.num_files).sum(),
            total_emits: per_task.iter().map(|t| t.total_emits).sum(),
            total_spilled: per_task.iter().map(|t| t.total_spilled).sum(),
            total_bytes_out: per_task.iter().map(|t| t.total_bytes_out).sum(),
            total_flushes: per_task.iter().map(|t| t.total_flushes).sum(),
            min_task_ms: per_task.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_task_ms: per_task.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            wall_ms,
        }
    }
}

/// What sorting one partition did.
#[derive(Clone, Debug, Default)]
pub struct SortOutcome {
    pub lines_in: u64,
    pub bytes_in: u64,
    pub sort_only_ms: u64,
    pub io_read_ms: u64,
    pub io_write_ms: u64,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct SortStats {
    pub reducers: usize,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub min_reducer_ms: u64,
    pub max_reducer_ms: u64,
    pub wall_ms: u64,
}

impl SortStats {
    pub fn from_partitions(per_partition: &[SortOutcome], wall_ms: u64) -> Self {
        Self {
            reducers: per_partition.len(),
            total_lines: per_partition.iter().map(|s| s.lines_in).sum(),
            total_bytes: per_partition.iter().map(|s| s.bytes_in).sum(),
            min_reducer_ms: per_partition.iter().map(|s| s.wall_ms).min().unwrap_or(0),
            max_reducer_ms: per_partition.iter().map(|s| s.wall_ms).max().unwrap_or(0),
            wall_ms,
        }
    }
}

/// What reducing one partition did.
#[derive(Clone, Debug, Default)]
pub struct ReduceTaskStats {
    pub reducer: usize,
    pub lines_in: u64,
    pub groups: u64,
    pub rows_out: u64,
    pub dropped_groups: u64,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct ReduceStats {
    pub reducers: usize,
    pub total_lines: u64,
    pub total_groups: u64,
    pub total_rows: u64,
    pub dropped_groups: u64,
    pub min_reducer_ms: u64,
    pub max_reducer_ms: u64,
    pub wall_ms: u64,
}

impl ReduceStats {
    pub fn from_tasks(per_task: &[ReduceTaskStats], wall_ms: u64) -> Self {
        Self {
            reducers: per_task.len(),
            total_lines: per_task.iter().map(|t| t.lines_in).sum(),
            total_groups: per_task.iter().map(|t| t.groups).sum(),
            total_rows: per_task.iter().map(|t| t.rows_out).sum(),
            dropped_groups: per_task.iter().map(|t| t.dropped_groups).sum(),
            min_reducer_ms: per_task.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_reducer_ms: per_task.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            wall_ms,
        }
    }
}

/// Summary of one map/sort/reduce stage.
#[derive(Default, Clone, Debug, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub map: MapStats,
    pub sort: SortStats,
    pub reduce: ReduceStats,
    pub validation: ValidationCounters,
}

/// Summary of a whole pipeline run, one report per stage in run order.
#[derive(Default, Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub stages: Vec<StageReport>,
    pub wall_ms: u64,
}

impl PipelineReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut out = open_writer(path)?;
        serde_json::to_writer_pretty(&mut out, self).with_context(|| format!("serialize report to {}", path.display()))?;
        out.flush().with_context(|| format!("flush {}", path.display()))
    }
}
