//! Distinct users and sessions per (appkey, country).
//!
//! Records are keyed `(appkey, country, token, session)` and grouped by the
//! first two fields, so inside a group equal tokens are adjacent and, for one
//! token, equal sessions are adjacent. The reducer counts both in one pass
//! with [`DistinctRuns`].

use super::{ConfiguredShuffle, DistinctRuns};
use crate::api::{MapContext, Mapper, NoCombiner, ReduceContext, Reducer};
use crate::config::StageOptions;
use crate::key::{CompositeKey, KeyField, KeyShuffle};
use crate::parse::{Command, LogDispatcher};
use crate::pipeline::{Dataset, MapReduceStage, Pipeline, StageEnv};
use crate::row::{ResultRow, RowSchema};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const COUNTRY_STAGE: &str = "country";

/// Country of records whose log line carried none.
pub const COUNTRY_PLACEHOLDER: &str = "--";

pub const COUNTRY_SCHEMA: RowSchema = RowSchema { key: &["appkey", "country"], value: &["users", "sessions"] };

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryKey {
    pub appkey: String,
    pub country: String,
    pub token: String,
    pub session: String,
}

impl CompositeKey for CountryKey {
    const ARITY: usize = 4;
    const GROUP_ARITY: usize = 2;

    fn field(&self, idx: usize) -> KeyField<'_> {
        match idx {
            0 => KeyField::Text(&self.appkey),
            1 => KeyField::Text(&self.country),
            2 => KeyField::Text(&self.token),
            _ => KeyField::Text(&self.session),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryEntity {
    pub token: String,
    pub session: String,
    pub cmd: Command,
}

#[derive(Default)]
pub struct CountryMapper {
    dispatcher: LogDispatcher,
}

impl CountryMapper {
    pub fn new(dispatcher: LogDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Mapper for CountryMapper {
    type Key = CountryKey;
    type Value = CountryEntity;

    fn do_map<I, F>(&self, input: I, ctx: &mut MapContext, emit: &mut F)
    where
        I: IntoIterator<Item = String>,
        F: FnMut(CountryKey, CountryEntity),
    {
        for line in input {
            let Some(record) = self.dispatcher.dispatch(&line, ctx) else {
                continue;
            };
            let key = CountryKey {
                appkey: record.appkey,
                country: record.country.unwrap_or_else(|| COUNTRY_PLACEHOLDER.to_string()),
                token: record.token.clone(),
                session: record.session.clone(),
            };
            emit(key, CountryEntity { token: record.token, session: record.session, cmd: record.cmd });
        }
    }
}

pub struct CountryReducer;

impl Reducer for CountryReducer {
    type Key = CountryKey;
    type ValueIn = CountryEntity;

    fn do_reduce<I, F>(&self, key: &CountryKey, values: I, _ctx: &mut ReduceContext, emit: &mut F)
    where
        I: Iterator<Item = CountryEntity>,
        F: FnMut(ResultRow),
    {
        let mut users = DistinctRuns::new();
        let mut sessions = DistinctRuns::new();
        for value in values {
            users.observe(value.token);
            sessions.observe(value.session);
        }
        emit(ResultRow::new(
            [key.appkey.clone(), key.country.clone()],
            [users.count().to_string(), sessions.count().to_string()],
        ));
    }
}

pub type CountryStage = MapReduceStage<CountryMapper, NoCombiner<CountryKey, CountryEntity>, CountryReducer, ConfiguredShuffle>;

pub fn country_stage(options: &StageOptions) -> CountryStage {
    MapReduceStage::new(
        COUNTRY_STAGE,
        CountryMapper::new(LogDispatcher::new().with_separator(options.separator.clone())),
        CountryReducer,
        KeyShuffle::new(options.prefix_partitioner()),
        COUNTRY_SCHEMA,
    )
}

/// Single-stage pipeline from raw logs to `appkey|country -> users|sessions`.
pub fn country_pipeline(input: Dataset, output: impl Into<PathBuf>, env: StageEnv) -> Pipeline {
    let stage = country_stage(&env.options);
    Pipeline::new("country-statistic", input, env).stage(stage, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::run_local;
    use crate::key::ShuffleService;
    use crate::parse::LogValidation;

    fn line(cmd: &str, appkey: &str, session: &str, token: &str, time: &str, country: &str) -> String {
        format!("{}\t{}\t{}\t{}\t{}\t{}", cmd, appkey, session, token, time, country)
    }

    fn run(lines: &[String]) -> Vec<String> {
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut rows: Vec<String> =
            run_local(&CountryMapper::default(), &CountryReducer, &refs).rows.iter().map(|r| r.render("|")).collect();
        rows.sort();
        rows
    }

    #[test]
    fn one_user_two_sessions() {
        let mut lines = Vec::new();
        for i in 0..3 {
            lines.push(line("PAGEVIEW", "A", "s1", "t1", &format!("2014010100000{}", i), "PH"));
        }
        lines.push(line("STARTSESS", "A", "s2", "t1", "20140101010000", "PH"));
        lines.push(line("ENDSESS", "A", "s2", "t1", "20140101010500", "PH"));
        assert_eq!(run(&lines), vec!["A|PH\t1|2"]);
    }

    #[test]
    fn adjacent_duplicates_count_once() {
        let lines = vec![
            line("PAGEVIEW", "A", "s1", "t1", "20140101000000", "KR"),
            line("PAGEVIEW", "A", "s2", "t1", "20140101000001", "KR"),
            line("PAGEVIEW", "A", "s2", "t2", "20140101000002", "KR"),
        ];
        assert_eq!(run(&lines), vec!["A|KR\t2|2"]);
    }

    #[test]
    fn counts_do_not_depend_on_input_order() {
        let mut lines = vec![
            line("PAGEVIEW", "A", "s1", "t1", "20140101000000", "PH"),
            line("PAGEVIEW", "A", "s3", "t2", "20140101000000", "PH"),
            line("STARTSESS", "B", "s9", "t7", "20140101000000", "US"),
            line("PAGEVIEW", "A", "s2", "t1", "20140101000000", "PH"),
            line("ENDSESS", "A", "s1", "t1", "20140101000000", "PH"),
            line("PAGEVIEW", "A", "s3", "t2", "20140101000000", "JP"),
        ];
        let expected = run(&lines);
        assert_eq!(expected, vec!["A|JP\t1|1", "A|PH\t2|3", "B|US\t1|1"]);
        lines.reverse();
        assert_eq!(run(&lines), expected);
        lines.rotate_left(2);
        assert_eq!(run(&lines), expected);
    }

    #[test]
    fn missing_country_groups_under_placeholder() {
        let lines = vec![
            line("PAGEVIEW", "A", "s1", "t1", "20140101000000", ""),
            "COMPONENT\tA\ts2\tt2\t20140101000000\t\tbutton".to_string(),
        ];
        assert_eq!(run(&lines), vec!["A|--\t2|2"]);
    }

    #[test]
    fn bad_lines_are_skipped_and_counted() {
        let lines = ["garbage", "PAGEVIEW\tA\ts1\tt1\t20140101000000\tPH", "BOGUS\tA\ts1\tt1\t20140101000000\tPH"];
        let out = run_local(&CountryMapper::default(), &CountryReducer, &lines);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.map_ctx.counters().get(LogValidation::Malformed), 1);
        assert_eq!(out.map_ctx.counters().get(LogValidation::Invalid), 1);
        assert_eq!(out.map_ctx.counters().get(LogValidation::Valid), 1);
    }

    #[test]
    fn legacy_partitioning_uses_appkey_and_country_only() {
        let options = StageOptions { legacy_partitioner: true, ..Default::default() };
        let stage_shuffle = KeyShuffle::new(options.prefix_partitioner());
        let key = |token: &str| CountryKey {
            appkey: "app".into(),
            country: "PH".into(),
            token: token.into(),
            session: "s".into(),
        };
        let p = stage_shuffle.partition(&key("t1"), 16);
        assert_eq!(stage_shuffle.partition(&key("t2"), 16), p);
        // abs("appPH".hashCode() * 127) % 16
        let h = "appPH".encode_utf16().fold(0i32, |h, u| h.wrapping_mul(31).wrapping_add(u as i32));
        assert_eq!(p, (h.wrapping_mul(127).unsigned_abs() as usize) % 16);
    }
}
