//! Job options and runtime tuning.
//!
//! Job options come from the command line and are validated up front: a bad
//! run mode or target date fails the job before any stage starts. Runtime
//! tuning comes from `LOGSTAT_*` environment variables, see [`crate::constants`].

use crate::constants::*;
use crate::partition::{LegacyPartitioner, PartitionScheme, StablePartitioner};
use crate::pipeline::{Dataset, StageEnv};
use crate::utils::{env_parse, env_var_truthy, local_run_id, platform_workers};
use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Hour,
    Day,
    Week,
    Month,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Hour => "hour",
            RunMode::Day => "day",
            RunMode::Week => "week",
            RunMode::Month => "month",
        }
    }

    /// Shape `--target-date` must have in this mode.
    pub fn target_format(&self) -> &'static str {
        match self {
            RunMode::Hour => "YYYY-MM-DD-HH",
            RunMode::Day => "YYYY-MM-DD",
            RunMode::Week => "YYYY-WW",
            RunMode::Month => "YYYY-MM",
        }
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hour" => Ok(RunMode::Hour),
            "day" => Ok(RunMode::Day),
            "week" => Ok(RunMode::Week),
            "month" => Ok(RunMode::Month),
            other => bail!("run mode must be one of hour, day, week, month (got {:?})", other),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The period a run covers. The core treats it as a label; only validation
/// and the default (previous period) live here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetDate {
    pub mode: RunMode,
    /// First instant of the period.
    pub start: NaiveDateTime,
    /// Canonical text form, in the mode's `target_format`.
    pub label: String,
}

impl TargetDate {
    pub fn parse(mode: RunMode, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bad = || format!("target date {:?} does not match {} for run mode {}", raw, mode.target_format(), mode);
        let start = match mode {
            RunMode::Hour => {
                let (day, hour) = raw.rsplit_once('-').with_context(bad)?;
                let day = NaiveDate::parse_from_str(day, "%Y-%m-%d").with_context(bad)?;
                let hour = hour.parse::<u32>().ok().filter(|h| *h < 24).with_context(bad)?;
                day.and_hms_opt(hour, 0, 0).with_context(bad)?
            }
            RunMode::Day => NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(bad)?.and_time(NaiveTime::MIN),
            RunMode::Week => {
                let (year, week) = raw.split_once('-').with_context(bad)?;
                let year = year.parse::<i32>().ok().with_context(bad)?;
                let week = week.parse::<u32>().ok().with_context(bad)?;
                NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).with_context(bad)?.and_time(NaiveTime::MIN)
            }
            RunMode::Month => NaiveDate::parse_from_str(&format!("{}-01", raw), "%Y-%m-%d")
                .with_context(bad)?
                .and_time(NaiveTime::MIN),
        };
        Ok(Self::at(mode, start))
    }

    /// The period before the one containing `now`.
    pub fn previous(mode: RunMode, now: NaiveDateTime) -> Self {
        let start = match mode {
            RunMode::Hour => {
                let hour = now - ChronoDuration::hours(1);
                hour.date().and_time(NaiveTime::MIN) + ChronoDuration::hours(hour.hour() as i64)
            }
            RunMode::Day => (now.date() - ChronoDuration::days(1)).and_time(NaiveTime::MIN),
            RunMode::Week => {
                let monday = now.date() - ChronoDuration::days(now.weekday().num_days_from_monday() as i64);
                (monday - ChronoDuration::days(7)).and_time(NaiveTime::MIN)
            }
            RunMode::Month => {
                let (year, month) = if now.month() == 1 { (now.year() - 1, 12) } else { (now.year(), now.month() - 1) };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .unwrap_or_else(|| now.date())
                    .and_time(NaiveTime::MIN)
            }
        };
        Self::at(mode, start)
    }

    /// `raw` when given, otherwise the previous period.
    pub fn resolve(mode: RunMode, raw: Option<&str>, now: NaiveDateTime) -> Result<Self> {
        match raw.map(str::trim).filter(|r| !r.is_empty()) {
            Some(raw) => Self::parse(mode, raw),
            None => Ok(Self::previous(mode, now)),
        }
    }

    fn at(mode: RunMode, start: NaiveDateTime) -> Self {
        let label = match mode {
            RunMode::Hour => start.format("%Y-%m-%d-%H").to_string(),
            RunMode::Day => start.format("%Y-%m-%d").to_string(),
            RunMode::Week => {
                let iso = start.date().iso_week();
                format!("{}-{:02}", iso.year(), iso.week())
            }
            RunMode::Month => start.format("%Y-%m").to_string(),
        };
        Self { mode, start, label }
    }
}

/// Options every map/reduce stage of a job shares.
#[derive(Clone, Debug)]
pub struct StageOptions {
    /// Echo each skipped line.
    pub verbose: bool,
    /// Count lines per validation level.
    pub counting: bool,
    /// Separator between fields inside the key or value half of a row.
    pub separator: String,
    /// Reproduce the historical partition hash instead of the stable one.
    pub legacy_partitioner: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            counting: false,
            separator: DEFAULT_FIELD_SEPARATOR.to_string(),
            legacy_partitioner: false,
        }
    }
}

impl StageOptions {
    /// Partitioner for keys whose historical hash was over the concatenated prefix.
    pub fn prefix_partitioner(&self) -> PartitionScheme {
        if self.legacy_partitioner {
            PartitionScheme::Legacy(LegacyPartitioner::java_string())
        } else {
            PartitionScheme::Stable(StablePartitioner)
        }
    }

    /// Partitioner for keys whose historical hash was over the rendered text key.
    pub fn text_partitioner(&self) -> PartitionScheme {
        if self.legacy_partitioner {
            PartitionScheme::Legacy(LegacyPartitioner::hadoop_text(self.separator.clone()))
        } else {
            PartitionScheme::Stable(StablePartitioner)
        }
    }
}

/// Tuning of the local map/sort/reduce runtime.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    /// Partitions, and therefore reduce tasks and output files, per stage.
    pub num_reducers: usize,
    /// Upper bound on parallel map tasks; never more than the input file count.
    pub map_tasks: usize,
    /// Root for spill and sort files of this run.
    pub work_dir: PathBuf,
    pub keep_intermediates: bool,
    pub flush_bytes: usize,
    pub flush_interval: Duration,
    pub writer_queue_cap: usize,
    pub local_batch_bytes: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            num_reducers: platform_workers(),
            map_tasks: platform_workers(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR).join(local_run_id()),
            keep_intermediates: false,
            flush_bytes: DEFAULT_FLUSH_BYTES,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            writer_queue_cap: DEFAULT_WRITER_QUEUE_CAP,
            local_batch_bytes: DEFAULT_LOCAL_BATCH_BYTES,
        }
    }
}

/// IO threads wait at most this long for spill batches; zero would make them spin.
fn flush_interval_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(MIN_FLUSH_INTERVAL_MS))
}

impl RuntimeSettings {
    /// Defaults overridden by any `LOGSTAT_*` variables that are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let work_root = std::env::var(ENV_WORK_DIR).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(DEFAULT_WORK_DIR));
        Self {
            num_reducers: env_parse::<usize>(ENV_NUM_REDUCERS).filter(|n| *n > 0).unwrap_or(defaults.num_reducers),
            map_tasks: env_parse::<usize>(ENV_MAP_TASKS).filter(|n| *n > 0).unwrap_or(defaults.map_tasks),
            work_dir: work_root.join(local_run_id()),
            keep_intermediates: env_var_truthy(ENV_KEEP_INTERMEDIATES),
            flush_bytes: env_parse(ENV_FLUSH_BYTES).unwrap_or(defaults.flush_bytes),
            flush_interval: env_parse::<u64>(ENV_FLUSH_INTERVAL_MS)
                .map(flush_interval_from_ms)
                .unwrap_or(defaults.flush_interval),
            writer_queue_cap: env_parse(ENV_WRITER_QUEUE_CAP).unwrap_or(defaults.writer_queue_cap),
            local_batch_bytes: env_parse(ENV_LOCAL_BATCH_BYTES).unwrap_or(defaults.local_batch_bytes),
        }
    }

    /// Applies a reducer count from the command line; 0 keeps the current value.
    pub fn with_reducers(mut self, requested: usize) -> Self {
        if requested > 0 {
            self.num_reducers = requested;
        }
        self
    }
}

/// Everything a job binary needs, validated.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub mode: RunMode,
    pub target: TargetDate,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub options: StageOptions,
    pub runtime: RuntimeSettings,
}

/// Raw, unvalidated job options as given on the command line.
#[derive(Clone, Debug, Default)]
pub struct JobArgs {
    pub mode: String,
    pub target_date: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub num_reducers: usize,
    pub verbose: bool,
    pub counter: bool,
    pub separator: Option<String>,
    pub legacy_partitioner: bool,
    pub keep_intermediates: bool,
}

impl JobConfig {
    pub fn from_args(args: JobArgs, now: NaiveDateTime) -> Result<Self> {
        let mode: RunMode = args.mode.parse()?;
        let target = TargetDate::resolve(mode, args.target_date.as_deref(), now)?;
        if args.inputs.is_empty() {
            bail!("at least one input location is required");
        }
        if args.output.as_os_str().is_empty() {
            bail!("an output location is required");
        }
        if args.inputs.iter().any(|i| i == &args.output) {
            bail!("output {} is also an input", args.output.display());
        }
        let separator = args.separator.unwrap_or_else(|| DEFAULT_FIELD_SEPARATOR.to_string());
        if separator.is_empty() || separator.contains(['\t', '\n', '\r']) {
            bail!("field separator {:?} must be non-empty and must not contain tabs or newlines", separator);
        }
        let mut runtime = RuntimeSettings::from_env().with_reducers(args.num_reducers);
        runtime.keep_intermediates |= args.keep_intermediates;
        Ok(Self {
            mode,
            target,
            inputs: args.inputs,
            output: args.output,
            options: StageOptions {
                verbose: args.verbose,
                counting: args.counter,
                separator,
                legacy_partitioner: args.legacy_partitioner,
            },
            runtime,
        })
    }

    /// [`JobConfig::from_args`] against the local clock.
    pub fn from_cli(args: JobArgs) -> Result<Self> {
        Self::from_args(args, chrono::Local::now().naive_local())
    }

    pub fn input(&self) -> Dataset {
        Dataset::new(self.inputs.iter().cloned())
    }

    pub fn stage_env(&self) -> StageEnv {
        StageEnv { settings: self.runtime.clone(), options: self.options.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 30, 0).unwrap()
    }

    fn args(mode: &str, target: Option<&str>) -> JobArgs {
        JobArgs {
            mode: mode.to_string(),
            target_date: target.map(str::to_string),
            inputs: vec![PathBuf::from("in")],
            output: PathBuf::from("out"),
            ..Default::default()
        }
    }

    #[test]
    fn run_modes_parse_case_insensitively() {
        assert_eq!("Day".parse::<RunMode>().unwrap(), RunMode::Day);
        assert_eq!(" week ".parse::<RunMode>().unwrap(), RunMode::Week);
        assert!("fortnight".parse::<RunMode>().is_err());
        assert!("".parse::<RunMode>().is_err());
    }

    #[test]
    fn target_dates_follow_the_mode() {
        assert_eq!(TargetDate::parse(RunMode::Day, "2014-03-09").unwrap().label, "2014-03-09");
        assert_eq!(TargetDate::parse(RunMode::Hour, "2014-03-09-07").unwrap().start, at(2014, 3, 9, 7) - ChronoDuration::minutes(30));
        assert_eq!(TargetDate::parse(RunMode::Month, "2014-03").unwrap().label, "2014-03");
        let week = TargetDate::parse(RunMode::Week, "2014-10").unwrap();
        assert_eq!(week.start.date(), NaiveDate::from_ymd_opt(2014, 3, 3).unwrap());
        assert_eq!(week.label, "2014-10");
    }

    #[test]
    fn malformed_target_dates_are_rejected() {
        assert!(TargetDate::parse(RunMode::Day, "2014-02-30").is_err());
        assert!(TargetDate::parse(RunMode::Day, "2014-03").is_err());
        assert!(TargetDate::parse(RunMode::Hour, "2014-03-09-24").is_err());
        assert!(TargetDate::parse(RunMode::Week, "2014-54").is_err());
        assert!(TargetDate::parse(RunMode::Month, "2014-13").is_err());
    }

    #[test]
    fn default_target_is_the_previous_period() {
        let now = at(2015, 1, 1, 0);
        assert_eq!(TargetDate::previous(RunMode::Hour, now).label, "2014-12-31-23");
        assert_eq!(TargetDate::previous(RunMode::Day, now).label, "2014-12-31");
        assert_eq!(TargetDate::previous(RunMode::Month, now).label, "2014-12");
        // 2015-01-01 is a Thursday in ISO week 2015-01; the week before is 2014-52
        assert_eq!(TargetDate::previous(RunMode::Week, now).label, "2014-52");
    }

    #[test]
    fn job_config_validates_before_running() {
        let now = at(2014, 6, 1, 12);
        let cfg = JobConfig::from_args(args("day", None), now).unwrap();
        assert_eq!(cfg.target.label, "2014-05-31");
        assert_eq!(cfg.options.separator, "|");
        assert!(cfg.runtime.num_reducers >= 1);

        assert!(JobConfig::from_args(args("daily", None), now).is_err());
        assert!(JobConfig::from_args(args("day", Some("2014/05/31")), now).is_err());

        let mut no_inputs = args("day", None);
        no_inputs.inputs.clear();
        assert!(JobConfig::from_args(no_inputs, now).is_err());

        let mut tab_sep = args("day", None);
        tab_sep.separator = Some("\t".into());
        assert!(JobConfig::from_args(tab_sep, now).is_err());
    }

    #[test]
    fn explicit_reducer_count_wins() {
        let mut a = args("day", Some("2014-05-31"));
        a.num_reducers = 3;
        let cfg = JobConfig::from_args(a, at(2014, 6, 1, 0)).unwrap();
        assert_eq!(cfg.runtime.num_reducers, 3);
    }

    #[test]
    fn zero_flush_interval_is_clamped() {
        assert_eq!(flush_interval_from_ms(0), Duration::from_millis(1));
        assert_eq!(flush_interval_from_ms(250), Duration::from_millis(250));
    }

    #[test]
    fn legacy_flag_switches_partitioners() {
        let opts = StageOptions { legacy_partitioner: true, ..Default::default() };
        assert!(matches!(opts.prefix_partitioner(), PartitionScheme::Legacy(_)));
        assert!(matches!(opts.text_partitioner(), PartitionScheme::Legacy(_)));
        assert!(matches!(StageOptions::default().prefix_partitioner(), PartitionScheme::Stable(_)));
    }
}
