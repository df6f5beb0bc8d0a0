//! Centralized environment variable names and default values for runtime tuning.

// Environment variable names
pub const ENV_KEEP_INTERMEDIATES: &str = "LOGSTAT_KEEP_INTERMEDIATES";
pub const ENV_NUM_REDUCERS: &str = "LOGSTAT_NUM_REDUCERS";
pub const ENV_MAP_TASKS: &str = "LOGSTAT_MAP_TASKS";
pub const ENV_FLUSH_BYTES: &str = "LOGSTAT_FLUSH_BYTES";
pub const ENV_FLUSH_INTERVAL_MS: &str = "LOGSTAT_FLUSH_INTERVAL_MS";
pub const ENV_WRITER_QUEUE_CAP: &str = "LOGSTAT_WRITER_QUEUE_CAP";
pub const ENV_LOCAL_BATCH_BYTES: &str = "LOGSTAT_LOCAL_BATCH_BYTES";
pub const ENV_WORK_DIR: &str = "LOGSTAT_WORK_DIR";

// Defaults
pub const DEFAULT_LOCAL_BATCH_BYTES: usize = 256 * 1024; // per partition, per map task
pub const DEFAULT_WRITER_QUEUE_CAP: usize = 1024;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 200;
pub const MIN_FLUSH_INTERVAL_MS: u64 = 1;
pub const DEFAULT_FLUSH_BYTES: usize = 16 * 1024 * 1024; // 16 MiB
pub const DEFAULT_WORK_DIR: &str = ".logstat_runs";

/// Separator placed between key and value columns of an output row.
pub const KEY_VALUE_DELIMITER: char = '\t';
/// Default separator between fields inside the key or the value columns.
pub const DEFAULT_FIELD_SEPARATOR: &str = "|";
/// Marker file written into an output directory once a stage completes.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Map output records a task buffers per combine pass before spilling.
pub const COMBINE_BATCH_RECORDS: usize = 64 * 1024;
/// Glob matching every output partition file of a stage.
pub const OUTPUT_PART_GLOB: &str = "part-r-*";
