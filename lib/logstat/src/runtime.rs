use crate::api::{Combiner, ExecutablePipeline, MapContext, Mapper, NoCombiner, ReduceContext, Reducer};
use crate::config::{RuntimeSettings, StageOptions};
use crate::constants::{COMBINE_BATCH_RECORDS, SUCCESS_MARKER};
use crate::group::for_each_group;
use crate::io::{ensure_dir, list_files_recursive, open_writer, read_raw_lines, reset_dir, FrameReader};
use crate::key::ShuffleService;
use crate::parse::LogValidation;
use crate::row::{ResultRow, TextRowSink};
use crate::sort::{map_file, sort_partition};
use crate::stats::{MapStats, MapTaskStats, ReduceStats, ReduceTaskStats, SortOutcome, SortStats, StageReport, ValidationCounters};
use crate::writer::{spill_path, ThreadWriter, WriterPool};
use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// File name of output partition `partition` of a stage.
pub fn output_part_name(partition: usize) -> String {
    format!("part-r-{:05}", partition)
}

fn sorted_path(base_dir: &Path, partition: usize) -> PathBuf {
    base_dir.join(format!("part{:05}.sorted", partition))
}

/// Local map/sort/reduce runner for one stage.
///
/// Map tasks run on rayon over round-robin file splits and spill through a
/// [`WriterPool`]; each partition is then sorted by the shuffle's total order and
/// reduced group by group into `part-r-NNNNN` under the output directory.
pub struct RuntimePipeline {
    name: String,
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    settings: RuntimeSettings,
    options: StageOptions,
    sink: TextRowSink,
}

impl RuntimePipeline {
    pub fn new(name: impl Into<String>, settings: RuntimeSettings, options: StageOptions) -> Self {
        let sink = TextRowSink::new(options.separator.clone());
        Self { name: name.into(), inputs: vec![], output: None, settings, options, sink }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spill and sort files of this stage live here until the stage finishes.
    pub fn work_dir(&self) -> PathBuf {
        self.settings.work_dir.join(&self.name)
    }

    /// Runs the stage with borrowed task objects. `combiner` of `None` spills map
    /// output as emitted.
    pub fn execute<M, C, R, S>(&self, mapper: &M, combiner: Option<&C>, reducer: &R, shuffle: &S) -> Result<StageReport>
    where
        M: Mapper,
        C: Combiner<Key = M::Key, Value = M::Value>,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
        S: ShuffleService<M::Key>,
    {
        let stage_start = Instant::now();
        let output_dir = self.output.clone().context("output not set")?;
        if self.inputs.is_empty() {
            bail!("stage {} has no inputs", self.name);
        }
        let mut all_files = Vec::new();
        for inp in &self.inputs {
            all_files.extend(list_files_recursive(inp)?);
        }
        reset_dir(&output_dir)?;

        let work_dir = self.work_dir();
        let map_out_dir = work_dir.join("map_out");
        let sort_out_dir = work_dir.join("sort_out");
        reset_dir(&work_dir)?;
        ensure_dir(&sort_out_dir)?;

        let num_reducers = self.settings.num_reducers.max(1);
        let map_tasks = self.settings.map_tasks.max(1).min(all_files.len().max(1));
        let chunks: Vec<Vec<PathBuf>> = (0..map_tasks)
            .map(|i| all_files.iter().enumerate().filter(|(idx, _)| idx % map_tasks == i).map(|(_, p)| p.clone()).collect())
            .collect();
        info!(
            stage = %self.name,
            input_files = all_files.len(),
            map_tasks,
            num_reducers,
            combiner = combiner.is_some(),
            "Stage starting"
        );

        // ========== Map ==========
        let map_start = Instant::now();
        let (pool, mut joiner) = WriterPool::new(
            &map_out_dir,
            num_reducers,
            self.settings.flush_bytes,
            self.settings.flush_interval,
            self.settings.writer_queue_cap,
        )?;
        let map_results: Vec<Result<MapTaskStats>> = chunks
            .par_iter()
            .enumerate()
            .map(|(task_id, files)| self.run_map_task(task_id, files, mapper, combiner, shuffle, &pool))
            .collect();
        pool.close_all();
        let joined = joiner.join_all();
        let map_task_stats = map_results.into_iter().collect::<Result<Vec<_>>>()?;
        joined.context("spill writers")?;
        let map_stats = MapStats::from_tasks(&map_task_stats, map_start.elapsed().as_millis() as u64);
        let mut validation = ValidationCounters::new();
        for t in &map_task_stats {
            validation.merge(&t.counters);
        }
        info!(
            phase = "map",
            stage = %self.name,
            tasks = map_stats.tasks,
            input_files = map_stats.input_files,
            total_emits = map_stats.total_emits,
            total_spilled = map_stats.total_spilled,
            total_bytes_out = map_stats.total_bytes_out,
            total_flushes = map_stats.total_flushes,
            min_task_ms = map_stats.min_task_ms,
            max_task_ms = map_stats.max_task_ms,
            wall_ms = map_stats.wall_ms,
            "Map phase complete"
        );
        if self.options.counting {
            for (level, lines) in validation.iter() {
                info!(stage = %self.name, level = %level, lines, "Validation count");
            }
        }
        for m in pool.metrics_snapshot() {
            debug!(
                partition = m.partition,
                max_queue_len = m.max_queue_len,
                enq_count = m.enq_count,
                enq_bytes = m.enq_bytes,
                flush_by_size = m.flush_by_size,
                flush_by_timer = m.flush_by_timer,
                bytes_written = m.bytes_written,
                write_calls = m.write_calls,
                "spill writer metrics"
            );
        }

        // ========== Sort ==========
        let sort_start = Instant::now();
        let sort_results: Vec<Result<SortOutcome>> = (0..num_reducers)
            .into_par_iter()
            .map(|r| {
                sort_partition::<M::Key, S>(&spill_path(&map_out_dir, r), &sorted_path(&sort_out_dir, r), shuffle)
                    .with_context(|| format!("sort partition {}", r))
            })
            .collect();
        let sort_outcomes = sort_results.into_iter().collect::<Result<Vec<_>>>()?;
        let sort_stats = SortStats::from_partitions(&sort_outcomes, sort_start.elapsed().as_millis() as u64);
        info!(
            phase = "sort",
            stage = %self.name,
            reducers = sort_stats.reducers,
            total_lines = sort_stats.total_lines,
            total_bytes = sort_stats.total_bytes,
            min_reducer_ms = sort_stats.min_reducer_ms,
            max_reducer_ms = sort_stats.max_reducer_ms,
            wall_ms = sort_stats.wall_ms,
            "Sort phase complete"
        );

        // ========== Reduce ==========
        let reduce_start = Instant::now();
        let reduce_results: Vec<Result<ReduceTaskStats>> = (0..num_reducers)
            .into_par_iter()
            .map(|r| self.run_reduce_task(r, &sorted_path(&sort_out_dir, r), &output_dir, reducer, shuffle))
            .collect();
        let reduce_task_stats = reduce_results.into_iter().collect::<Result<Vec<_>>>()?;
        let reduce_stats = ReduceStats::from_tasks(&reduce_task_stats, reduce_start.elapsed().as_millis() as u64);
        info!(
            phase = "reduce",
            stage = %self.name,
            reducers = reduce_stats.reducers,
            total_lines = reduce_stats.total_lines,
            total_groups = reduce_stats.total_groups,
            total_rows = reduce_stats.total_rows,
            dropped_groups = reduce_stats.dropped_groups,
            min_reducer_ms = reduce_stats.min_reducer_ms,
            max_reducer_ms = reduce_stats.max_reducer_ms,
            wall_ms = reduce_stats.wall_ms,
            "Reduce phase complete"
        );

        let marker = output_dir.join(SUCCESS_MARKER);
        fs::write(&marker, b"").with_context(|| format!("write {}", marker.display()))?;
        if self.settings.keep_intermediates {
            info!(stage = %self.name, work_dir = %work_dir.display(), "Keeping intermediates");
        } else if let Err(e) = fs::remove_dir_all(&work_dir) {
            warn!(stage = %self.name, work_dir = %work_dir.display(), error = %e, "Failed to remove intermediates");
        }
        info!(stage = %self.name, wall_ms = stage_start.elapsed().as_millis() as u64, "Stage complete");

        Ok(StageReport { stage: self.name.clone(), map: map_stats, sort: sort_stats, reduce: reduce_stats, validation })
    }

    fn run_map_task<M, C, S>(
        &self,
        task_id: usize,
        files: &[PathBuf],
        mapper: &M,
        combiner: Option<&C>,
        shuffle: &S,
        pool: &WriterPool,
    ) -> Result<MapTaskStats>
    where
        M: Mapper,
        C: Combiner<Key = M::Key, Value = M::Value>,
        S: ShuffleService<M::Key>,
    {
        let start = Instant::now();
        let num_partitions = pool.num_partitions();
        debug!(task_id, num_files = files.len(), writers = num_partitions, "map task starting");
        let mut ctx = MapContext::new(self.options.verbose, self.options.counting);
        let mut writer = pool.make_thread_writer(self.settings.local_batch_bytes);
        let mut emits = 0u64;
        let mut spilled = 0u64;
        let mut buffered: Vec<(M::Key, M::Value)> = Vec::new();

        for file in files {
            let mut read_error = None;
            let mut undecodable = 0u64;
            let verbose = self.options.verbose;
            let lines = read_raw_lines(file)?
                .map_while(|line| match line {
                    Ok(line) => Some(line),
                    Err(e) => {
                        read_error = Some(e);
                        None
                    }
                })
                .filter_map(|bytes| match String::from_utf8(bytes) {
                    Ok(line) => Some(line),
                    Err(e) => {
                        if verbose {
                            warn!(level = %LogValidation::Malformed, line = %String::from_utf8_lossy(e.as_bytes()), "Ignoring undecodable input");
                        }
                        undecodable += 1;
                        None
                    }
                });
            let mut failure = None;
            let mut emit = |key: M::Key, value: M::Value| {
                emits += 1;
                if failure.is_some() {
                    return;
                }
                if let Some(combiner) = combiner {
                    buffered.push((key, value));
                    if buffered.len() >= COMBINE_BATCH_RECORDS {
                        match combine_and_spill(&mut buffered, combiner, shuffle, &mut writer) {
                            Ok(n) => spilled += n,
                            Err(e) => failure = Some(e),
                        }
                    }
                    return;
                }
                let partition = shuffle.partition(&key, num_partitions);
                match writer.emit(partition, &key, &value) {
                    Ok(()) => spilled += 1,
                    Err(e) => failure = Some(e),
                }
            };
            mapper.do_map(lines, &mut ctx, &mut emit);
            for _ in 0..undecodable {
                ctx.record(LogValidation::Malformed);
            }
            if let Some(e) = read_error {
                return Err(e).with_context(|| format!("read {}", file.display()));
            }
            if let Some(e) = failure {
                return Err(e).with_context(|| format!("map task {} spilling {}", task_id, file.display()));
            }
        }
        if let Some(combiner) = combiner {
            spilled += combine_and_spill(&mut buffered, combiner, shuffle, &mut writer)?;
        }
        writer.flush_all()?;
        let (_, flushes, bytes) = writer.stats();
        let wall_ms = start.elapsed().as_millis() as u64;
        debug!(task_id, emits, spilled, bytes, wall_ms, "map task finished");
        Ok(MapTaskStats {
            task_id,
            num_files: files.len() as u64,
            total_emits: emits,
            total_spilled: spilled,
            total_bytes_out: bytes,
            total_flushes: flushes,
            wall_ms,
            counters: ctx.into_counters(),
        })
    }

    fn run_reduce_task<R, S>(
        &self,
        reducer_id: usize,
        sorted: &Path,
        output_dir: &Path,
        reducer: &R,
        shuffle: &S,
    ) -> Result<ReduceTaskStats>
    where
        R: Reducer,
        S: ShuffleService<R::Key>,
    {
        let start = Instant::now();
        let map = map_file(sorted)?;
        let bytes: &[u8] = map.as_deref().unwrap_or(&[]);
        let out_path = output_dir.join(output_part_name(reducer_id));
        let mut out = open_writer(&out_path)?;
        let mut ctx = ReduceContext::default();
        let mut rows = 0u64;

        let records = FrameReader::new(bytes).map(|frame| -> Result<(R::Key, R::ValueIn)> {
            let frame = frame?;
            let key = bincode::deserialize(frame.key).with_context(|| format!("decode key at offset {}", frame.start))?;
            let value =
                bincode::deserialize(frame.value).with_context(|| format!("decode value at offset {}", frame.start))?;
            Ok((key, value))
        });
        let scan = for_each_group(records, shuffle, |key, values| {
            let mut written = Ok(());
            reducer.do_reduce(key, values, &mut ctx, &mut |row: ResultRow| {
                if written.is_ok() {
                    written = self.sink.write_row(&mut out, &row);
                    rows += 1;
                }
            });
            written
        })
        .with_context(|| format!("reduce partition {} from {}", reducer_id, sorted.display()))?;
        out.flush().with_context(|| format!("flush {}", out_path.display()))?;

        let wall_ms = start.elapsed().as_millis() as u64;
        debug!(reducer = reducer_id, groups = scan.groups, rows, wall_ms, "reduce task finished");
        Ok(ReduceTaskStats {
            reducer: reducer_id,
            lines_in: scan.records,
            groups: scan.groups,
            rows_out: rows,
            dropped_groups: ctx.dropped_groups(),
            wall_ms,
        })
    }
}

/// Sorts the buffered map output, runs the combiner once per group and spills
/// what it emits. Returns the number of spilled records.
fn combine_and_spill<C, S>(
    buffered: &mut Vec<(C::Key, C::Value)>,
    combiner: &C,
    shuffle: &S,
    writer: &mut ThreadWriter<'_>,
) -> Result<u64>
where
    C: Combiner,
    S: ShuffleService<C::Key>,
{
    let mut batch = std::mem::take(buffered);
    batch.sort_by(|a, b| shuffle.compare_total(&a.0, &b.0));
    let num_partitions = writer.num_partitions();
    let mut spilled = 0u64;
    for_each_group(batch.into_iter().map(Ok), shuffle, |key, values| {
        let mut result = Ok(());
        combiner.combine(key, values, &mut |k: C::Key, v: C::Value| {
            if result.is_ok() {
                let partition = shuffle.partition(&k, num_partitions);
                result = writer.emit(partition, &k, &v);
                spilled += 1;
            }
        });
        result
    })?;
    Ok(spilled)
}

impl ExecutablePipeline for RuntimePipeline {
    fn add_input(&mut self, input_path: impl Into<PathBuf>) {
        self.inputs.push(input_path.into());
    }

    fn add_output(&mut self, output_path: impl Into<PathBuf>) {
        self.output = Some(output_path.into());
    }

    fn map_reduce<M, R, S>(&mut self, mapper: M, reducer: R, shuffle: S) -> Result<StageReport>
    where
        M: Mapper,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
        S: ShuffleService<M::Key>,
    {
        self.execute(&mapper, None::<&NoCombiner<M::Key, M::Value>>, &reducer, &shuffle)
    }

    fn map_combine_reduce<M, C, R, S>(&mut self, mapper: M, combiner: C, reducer: R, shuffle: S) -> Result<StageReport>
    where
        M: Mapper,
        C: Combiner<Key = M::Key, Value = M::Value>,
        R: Reducer<Key = M::Key, ValueIn = M::Value>,
        S: ShuffleService<M::Key>,
    {
        self.execute(&mapper, Some(&combiner), &reducer, &shuffle)
    }
}
