//! Session length histogram, in two stages.
//!
//! Stage one keys every event `(appkey, session, utctime)` and groups by
//! `(appkey, session)`. Timestamps are fixed width, so the first value of a
//! group is the earliest and the last the latest; their difference is the
//! session length. Sessions of zero or negative length, or with a timestamp
//! that does not parse, produce no row.
//!
//! Stage two reads those rows back, keys them `(appkey, seconds)` and counts
//! sessions per key. A combiner pre-sums counts on the map side.

use super::ConfiguredShuffle;
use crate::api::{Combiner, MapContext, Mapper, NoCombiner, ReduceContext, Reducer};
use crate::config::StageOptions;
use crate::key::{CompositeKey, KeyField, KeyShuffle};
use crate::parse::{Command, LogDispatcher, LogValidation};
use crate::pipeline::{Dataset, MapReduceStage, Pipeline, StageEnv};
use crate::row::{ResultRow, RowSchema};
use crate::timestamp::seconds_between;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

pub const SESSION_TIME_STAGE: &str = "session-time";
pub const SESSION_LENGTH_STAGE: &str = "session-length";

pub const SESSION_TIME_SCHEMA: RowSchema = RowSchema { key: &["appkey", "session"], value: &["seconds"] };
pub const SESSION_LENGTH_SCHEMA: RowSchema = RowSchema { key: &["appkey", "seconds"], value: &["sessions"] };

// ========== Stage 1: per-session duration ==========

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKey {
    pub appkey: String,
    pub session: String,
    pub utctime: String,
}

impl CompositeKey for SessionKey {
    const ARITY: usize = 3;
    const GROUP_ARITY: usize = 2;

    fn field(&self, idx: usize) -> KeyField<'_> {
        match idx {
            0 => KeyField::Text(&self.appkey),
            1 => KeyField::Text(&self.session),
            _ => KeyField::Text(&self.utctime),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntity {
    pub session: String,
    pub utctime: String,
    pub cmd: Command,
}

#[derive(Default)]
pub struct SessionTimeMapper {
    dispatcher: LogDispatcher,
}

impl SessionTimeMapper {
    pub fn new(dispatcher: LogDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Mapper for SessionTimeMapper {
    type Key = SessionKey;
    type Value = SessionEntity;

    fn do_map<I, F>(&self, input: I, ctx: &mut MapContext, emit: &mut F)
    where
        I: IntoIterator<Item = String>,
        F: FnMut(SessionKey, SessionEntity),
    {
        for line in input {
            let Some(record) = self.dispatcher.dispatch(&line, ctx) else {
                continue;
            };
            let key = SessionKey {
                appkey: record.appkey,
                session: record.session.clone(),
                utctime: record.utctime.clone(),
            };
            emit(key, SessionEntity { session: record.session, utctime: record.utctime, cmd: record.cmd });
        }
    }
}

pub struct SessionTimeReducer;

impl Reducer for SessionTimeReducer {
    type Key = SessionKey;
    type ValueIn = SessionEntity;

    fn do_reduce<I, F>(&self, key: &SessionKey, values: I, ctx: &mut ReduceContext, emit: &mut F)
    where
        I: Iterator<Item = SessionEntity>,
        F: FnMut(ResultRow),
    {
        let mut first: Option<String> = None;
        let mut last: Option<String> = None;
        for value in values {
            if first.is_none() {
                first = Some(value.utctime.clone());
            }
            last = Some(value.utctime);
        }
        let (Some(first), Some(last)) = (first, last) else {
            ctx.drop_group();
            return;
        };
        match seconds_between(&first, &last) {
            Ok(seconds) if seconds > 0 => {
                emit(ResultRow::new([key.appkey.clone(), key.session.clone()], [seconds.to_string()]));
            }
            Ok(_) => ctx.drop_group(),
            Err(e) => {
                debug!(appkey = %key.appkey, session = %key.session, error = %e, "dropping session with bad timestamp");
                ctx.drop_group();
            }
        }
    }
}

// ========== Stage 2: histogram ==========

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramKey {
    pub appkey: String,
    pub seconds: i64,
}

impl CompositeKey for HistogramKey {
    const ARITY: usize = 2;
    const GROUP_ARITY: usize = 2;

    fn field(&self, idx: usize) -> KeyField<'_> {
        match idx {
            0 => KeyField::Text(&self.appkey),
            _ => KeyField::Int(self.seconds),
        }
    }
}

/// Reads stage-one rows and emits one count per session.
pub struct SessionLengthMapper {
    separator: String,
}

impl SessionLengthMapper {
    pub fn new(separator: impl Into<String>) -> Self {
        Self { separator: separator.into() }
    }

    fn parse(&self, line: &str) -> Result<HistogramKey, LogValidation> {
        let row = ResultRow::parse(line, &self.separator).ok_or(LogValidation::Malformed)?;
        if !SESSION_TIME_SCHEMA.accepts(&row) {
            return Err(LogValidation::Malformed);
        }
        let appkey = row.key[0].trim();
        let seconds = row.value[0].trim().parse::<i64>().map_err(|_| LogValidation::Invalid)?;
        if appkey.is_empty() || seconds <= 0 {
            return Err(LogValidation::Invalid);
        }
        Ok(HistogramKey { appkey: appkey.to_string(), seconds })
    }
}

impl Mapper for SessionLengthMapper {
    type Key = HistogramKey;
    type Value = u64;

    fn do_map<I, F>(&self, input: I, ctx: &mut MapContext, emit: &mut F)
    where
        I: IntoIterator<Item = String>,
        F: FnMut(HistogramKey, u64),
    {
        for line in input {
            match self.parse(&line) {
                Ok(key) => {
                    ctx.record(LogValidation::Valid);
                    emit(key, 1);
                }
                Err(level) => ctx.skip(&line, level),
            }
        }
    }
}

/// Sums the counts of one key.
pub struct CountCombiner;

impl Combiner for CountCombiner {
    type Key = HistogramKey;
    type Value = u64;

    fn combine<I, F>(&self, key: &HistogramKey, values: I, emit: &mut F)
    where
        I: Iterator<Item = u64>,
        F: FnMut(HistogramKey, u64),
    {
        emit(key.clone(), values.sum());
    }
}

pub struct HistogramReducer;

impl Reducer for HistogramReducer {
    type Key = HistogramKey;
    type ValueIn = u64;

    fn do_reduce<I, F>(&self, key: &HistogramKey, values: I, _ctx: &mut ReduceContext, emit: &mut F)
    where
        I: Iterator<Item = u64>,
        F: FnMut(ResultRow),
    {
        let sessions: u64 = values.sum();
        emit(ResultRow::new([key.appkey.clone(), key.seconds.to_string()], [sessions.to_string()]));
    }
}

pub type SessionTimeStage =
    MapReduceStage<SessionTimeMapper, NoCombiner<SessionKey, SessionEntity>, SessionTimeReducer, ConfiguredShuffle>;
pub type SessionLengthStage = MapReduceStage<SessionLengthMapper, CountCombiner, HistogramReducer, ConfiguredShuffle>;

pub fn session_time_stage(options: &StageOptions) -> SessionTimeStage {
    MapReduceStage::new(
        SESSION_TIME_STAGE,
        SessionTimeMapper::new(LogDispatcher::new().with_separator(options.separator.clone())),
        SessionTimeReducer,
        KeyShuffle::new(options.prefix_partitioner()),
        SESSION_TIME_SCHEMA,
    )
}

pub fn session_length_stage(options: &StageOptions) -> SessionLengthStage {
    MapReduceStage::new(
        SESSION_LENGTH_STAGE,
        SessionLengthMapper::new(options.separator.clone()),
        HistogramReducer,
        KeyShuffle::new(options.text_partitioner()),
        SESSION_LENGTH_SCHEMA,
    )
    .with_combiner(CountCombiner)
    .reading(SESSION_TIME_SCHEMA)
}

/// Raw logs to per-session durations in `intermediate`, then to the histogram in `output`.
pub fn session_length_pipeline(
    input: Dataset,
    intermediate: impl Into<PathBuf>,
    output: impl Into<PathBuf>,
    env: StageEnv,
) -> Pipeline {
    let first = session_time_stage(&env.options);
    let second = session_length_stage(&env.options);
    Pipeline::new("session-length-statistic", input, env).stage(first, intermediate).stage(second, output)
}
