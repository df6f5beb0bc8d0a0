//! Linear chains of map/reduce stages.
//!
//! Each stage writes a finished dataset (part files plus a `_SUCCESS` marker)
//! and the next stage reads all of it. Stages run one at a time; a failing stage
//! stops the chain.

use crate::api::{Combiner, ExecutablePipeline, Mapper, NoCombiner, Reducer};
use crate::config::{RuntimeSettings, StageOptions};
use crate::constants::{OUTPUT_PART_GLOB, SUCCESS_MARKER};
use crate::key::ShuffleService;
use crate::row::RowSchema;
use crate::runtime::RuntimePipeline;
use crate::stats::{PipelineReport, StageReport};
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Input locations of a stage: raw log files/directories, or a finished stage's output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dataset {
    locations: Vec<PathBuf>,
}

impl Dataset {
    pub fn new<I, P>(locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self { locations: locations.into_iter().map(Into::into).collect() }
    }

    pub fn at(location: impl Into<PathBuf>) -> Self {
        Self { locations: vec![location.into()] }
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Whether the stage that writes `dir` ran to completion.
    pub fn is_complete(dir: &Path) -> bool {
        dir.join(SUCCESS_MARKER).is_file()
    }

    /// Output partition files of a finished stage, in partition order.
    pub fn part_files(dir: &Path) -> Result<Vec<PathBuf>> {
        if !Self::is_complete(dir) {
            bail!("{} is not a finished stage output (no {})", dir.display(), SUCCESS_MARKER);
        }
        let pattern = dir.join(OUTPUT_PART_GLOB);
        let pattern = pattern.to_str().with_context(|| format!("non UTF-8 path {}", dir.display()))?;
        let mut parts = glob::glob(pattern)
            .with_context(|| format!("glob {}", pattern))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("list {}", dir.display()))?;
        parts.sort();
        Ok(parts)
    }
}

/// Settings every stage of a pipeline shares.
#[derive(Clone, Debug)]
pub struct StageEnv {
    pub settings: RuntimeSettings,
    pub options: StageOptions,
}

/// One step of a [`Pipeline`].
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Row layout this stage reads; `None` for raw log lines.
    fn input_schema(&self) -> Option<RowSchema>;

    fn output_schema(&self) -> RowSchema;

    fn run(&self, input: &Dataset, output: &Path, env: &StageEnv) -> Result<StageReport>;
}

/// A stage made of a mapper, an optional combiner, a reducer and a shuffle.
pub struct MapReduceStage<M, C, R, S> {
    name: String,
    mapper: M,
    combiner: Option<C>,
    reducer: R,
    shuffle: S,
    input_schema: Option<RowSchema>,
    output_schema: RowSchema,
}

impl<M, R, S> MapReduceStage<M, NoCombiner<M::Key, M::Value>, R, S>
where
    M: Mapper,
{
    pub fn new(name: impl Into<String>, mapper: M, reducer: R, shuffle: S, output_schema: RowSchema) -> Self {
        Self {
            name: name.into(),
            mapper,
            combiner: None,
            reducer,
            shuffle,
            input_schema: None,
            output_schema,
        }
    }
}

impl<M, C, R, S> MapReduceStage<M, C, R, S> {
    pub fn with_combiner<C2>(self, combiner: C2) -> MapReduceStage<M, C2, R, S> {
        MapReduceStage {
            name: self.name,
            mapper: self.mapper,
            combiner: Some(combiner),
            reducer: self.reducer,
            shuffle: self.shuffle,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
        }
    }

    /// Declares that the stage reads rows of `schema` instead of raw log lines.
    pub fn reading(mut self, schema: RowSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

impl<M, C, R, S> Stage for MapReduceStage<M, C, R, S>
where
    M: Mapper,
    C: Combiner<Key = M::Key, Value = M::Value>,
    R: Reducer<Key = M::Key, ValueIn = M::Value>,
    S: ShuffleService<M::Key>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn input_schema(&self) -> Option<RowSchema> {
        self.input_schema
    }

    fn output_schema(&self) -> RowSchema {
        self.output_schema
    }

    fn run(&self, input: &Dataset, output: &Path, env: &StageEnv) -> Result<StageReport> {
        let mut runtime = RuntimePipeline::new(&self.name, env.settings.clone(), env.options.clone());
        for location in input.locations() {
            runtime.add_input(location.clone());
        }
        runtime.add_output(output);
        runtime.execute(&self.mapper, self.combiner.as_ref(), &self.reducer, &self.shuffle)
    }
}

/// Stages run in order; each one's output directory is the next one's input.
pub struct Pipeline {
    name: String,
    input: Dataset,
    env: StageEnv,
    stages: Vec<(Box<dyn Stage>, PathBuf)>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, input: Dataset, env: StageEnv) -> Self {
        Self { name: name.into(), input, env, stages: Vec::new() }
    }

    pub fn stage(mut self, stage: impl Stage + 'static, output: impl Into<PathBuf>) -> Self {
        self.stages.push((Box::new(stage), output.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|(s, _)| s.name()).collect()
    }

    /// Checks the chain before anything runs: the first stage reads raw lines,
    /// every later stage reads exactly what the one before it writes, and no two
    /// stages share an output directory or overwrite the raw input.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("pipeline {} has no stages", self.name);
        }
        if self.input.is_empty() {
            bail!("pipeline {} has no input", self.name);
        }
        let mut outputs = HashSet::new();
        let mut upstream: Option<RowSchema> = None;
        for (stage, output) in &self.stages {
            if stage.input_schema() != upstream {
                match (stage.input_schema(), upstream) {
                    (Some(want), Some(have)) => {
                        bail!("stage {} reads {} but the previous stage writes {}", stage.name(), want, have)
                    }
                    (Some(want), None) => bail!("stage {} reads {} but is fed raw log lines", stage.name(), want),
                    (None, _) => bail!("stage {} reads raw log lines but is not the first stage", stage.name()),
                }
            }
            if !outputs.insert(output.clone()) {
                bail!("stage {} writes to {} which another stage also writes", stage.name(), output.display());
            }
            if self.input.locations().contains(output) {
                bail!("stage {} would overwrite input {}", stage.name(), output.display());
            }
            upstream = Some(stage.output_schema());
        }
        Ok(())
    }

    pub fn run(&self) -> Result<PipelineReport> {
        self.validate()?;
        let start = Instant::now();
        info!(pipeline = %self.name, stages = self.stages.len(), "Pipeline starting");
        let mut input = self.input.clone();
        let mut report = PipelineReport { pipeline: self.name.clone(), ..Default::default() };
        for (idx, (stage, output)) in self.stages.iter().enumerate() {
            info!(
                pipeline = %self.name,
                stage = stage.name(),
                step = idx + 1,
                output = %output.display(),
                schema = %stage.output_schema(),
                "Running stage"
            );
            let stage_report = stage
                .run(&input, output, &self.env)
                .with_context(|| format!("pipeline {} stage {} ({}) failed", self.name, idx + 1, stage.name()))?;
            report.stages.push(stage_report);
            input = Dataset::at(output.clone());
        }
        if !self.env.settings.keep_intermediates {
            // Only succeeds once every stage removed its own work directory.
            if let Err(e) = fs::remove_dir(&self.env.settings.work_dir) {
                debug!(pipeline = %self.name, work_dir = %self.env.settings.work_dir.display(), error = %e, "Work dir left in place");
            }
        }
        report.wall_ms = start.elapsed().as_millis() as u64;
        info!(pipeline = %self.name, wall_ms = report.wall_ms, "Pipeline complete");
        Ok(report)
    }
}
