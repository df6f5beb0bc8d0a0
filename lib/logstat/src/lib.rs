pub mod api;
pub mod config;
pub mod constants;
pub mod group;
pub mod io;
pub mod jobs;
pub mod key;
pub mod parse;
pub mod partition;
pub mod pipeline;
pub mod row;
pub mod runtime;
pub mod sort;
pub mod stats;
pub mod timestamp;
pub mod utils;
pub mod writer;

pub use api::{Combiner, ExecutablePipeline, MapContext, Mapper, ReduceContext, Reducer};
pub use config::{JobArgs, JobConfig, RunMode, RuntimeSettings, StageOptions, TargetDate};
pub use key::{CompositeKey, KeyField, KeyShuffle, ShuffleService};
pub use parse::{EventRecord, LogDispatcher, LogParser, LogValidation};
pub use partition::{LegacyPartitioner, PartitionScheme, Partitioner, StablePartitioner};
pub use pipeline::{Dataset, MapReduceStage, Pipeline, Stage, StageEnv};
pub use row::{ResultRow, RowSchema};
pub use runtime::RuntimePipeline;
pub use stats::{PipelineReport, StageReport, ValidationCounters};
