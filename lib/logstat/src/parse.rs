//! Log line classification and the record parsers behind it.
//!
//! A raw line is tab-delimited. Its variant is decided by the field count alone:
//!
//! | variant   | fields                                                 |
//! |-----------|--------------------------------------------------------|
//! | common    | `cmd appkey session token utctime country`             |
//! | component | `cmd appkey session token utctime country component`   |
//!
//! Lines of any other shape are `Malformed`. The variant's parser then checks
//! the command and the required fields; its verdict is a [`LogValidation`].

use crate::api::MapContext;
use crate::constants::DEFAULT_FIELD_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FIELD_DELIMITER: char = '\t';

/// Severity of one parsed line, in increasing order of badness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogValidation {
    /// Every field present.
    Valid,
    /// Usable, but an optional field (country) is missing.
    Degraded,
    /// Recognized shape, rejected by the parser.
    Invalid,
    /// Matched no known variant.
    Malformed,
}

impl LogValidation {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogValidation::Valid => "VALID",
            LogValidation::Degraded => "DEGRADED",
            LogValidation::Invalid => "INVALID",
            LogValidation::Malformed => "MALFORMED",
        }
    }
}

impl fmt::Display for LogValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    StartSession,
    PageView,
    EndSession,
    Component,
}

impl Command {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTSESS" => Some(Command::StartSession),
            "PAGEVIEW" => Some(Command::PageView),
            "ENDSESS" => Some(Command::EndSession),
            "COMPONENT" => Some(Command::Component),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogVariant {
    Common,
    Component,
}

impl LogVariant {
    pub fn classify(line: &str) -> Option<Self> {
        match line.split(FIELD_DELIMITER).count() {
            6 => Some(LogVariant::Common),
            7 => Some(LogVariant::Component),
            _ => None,
        }
    }

    pub fn accepts(&self, cmd: Command) -> bool {
        match self {
            LogVariant::Common => matches!(cmd, Command::StartSession | Command::PageView | Command::EndSession),
            LogVariant::Component => cmd == Command::Component,
        }
    }
}

/// One parsed log line. Built fresh per line and handed to the mapper by value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub appkey: String,
    pub country: Option<String>,
    pub token: String,
    pub session: String,
    /// Raw timestamp, see [`crate::timestamp::LOG_TIME_FORMAT`].
    pub utctime: String,
    pub cmd: Command,
    pub component: Option<String>,
    pub level: LogValidation,
}

/// Turns one line of a known variant into an [`EventRecord`].
pub trait LogParser: Send + Sync {
    fn variant(&self) -> LogVariant;

    /// On rejection, returns the severity to count the line under.
    fn parse(&self, line: &str) -> Result<EventRecord, LogValidation>;
}

/// Parser for the tab-delimited layouts in the module docs.
#[derive(Clone, Copy, Debug)]
pub struct DelimitedParser {
    variant: LogVariant,
}

impl DelimitedParser {
    pub fn new(variant: LogVariant) -> Self {
        Self { variant }
    }
}

fn required(field: &str) -> Result<String, LogValidation> {
    let field = field.trim();
    if field.is_empty() {
        Err(LogValidation::Invalid)
    } else {
        Ok(field.to_string())
    }
}

impl LogParser for DelimitedParser {
    fn variant(&self) -> LogVariant {
        self.variant
    }

    fn parse(&self, line: &str) -> Result<EventRecord, LogValidation> {
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        let expected = match self.variant {
            LogVariant::Common => 6,
            LogVariant::Component => 7,
        };
        if fields.len() != expected {
            return Err(LogValidation::Malformed);
        }
        let cmd = Command::parse(fields[0].trim()).ok_or(LogValidation::Invalid)?;
        if !self.variant.accepts(cmd) {
            return Err(LogValidation::Invalid);
        }
        let country = Some(fields[5].trim()).filter(|c| !c.is_empty()).map(str::to_string);
        let component = match self.variant {
            LogVariant::Common => None,
            LogVariant::Component => Some(required(fields[6])?),
        };
        Ok(EventRecord {
            appkey: required(fields[1])?,
            session: required(fields[2])?,
            token: required(fields[3])?,
            utctime: required(fields[4])?,
            level: if country.is_some() { LogValidation::Valid } else { LogValidation::Degraded },
            country,
            cmd,
            component,
        })
    }
}

/// Routes each line to the parser for its variant and does the skip bookkeeping.
///
/// Fields that end up in output keys (appkey, session, country) must not
/// contain the output field separator, or the row could not be split back
/// into the same fields downstream. Such records are `Invalid`.
pub struct LogDispatcher {
    parsers: Vec<Box<dyn LogParser>>,
    separator: String,
}

impl Default for LogDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogDispatcher {
    pub fn new() -> Self {
        Self::with_parsers(vec![
            Box::new(DelimitedParser::new(LogVariant::Common)),
            Box::new(DelimitedParser::new(LogVariant::Component)),
        ])
    }

    /// Lines whose variant has no parser here are `Malformed`.
    pub fn with_parsers(parsers: Vec<Box<dyn LogParser>>) -> Self {
        Self { parsers, separator: DEFAULT_FIELD_SEPARATOR.to_string() }
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    fn parser_for(&self, variant: LogVariant) -> Option<&dyn LogParser> {
        self.parsers.iter().find(|p| p.variant() == variant).map(|p| &**p)
    }

    fn splits_on_separator(&self, record: &EventRecord) -> bool {
        let sep = self.separator.as_str();
        record.appkey.contains(sep)
            || record.session.contains(sep)
            || record.country.as_deref().is_some_and(|c| c.contains(sep))
    }

    /// Parses `line`, or records why it was skipped and returns `None`.
    pub fn dispatch(&self, line: &str, ctx: &mut MapContext) -> Option<EventRecord> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(parser) = LogVariant::classify(line).and_then(|v| self.parser_for(v)) else {
            ctx.skip(line, LogValidation::Malformed);
            return None;
        };
        match parser.parse(line) {
            Ok(record) if self.splits_on_separator(&record) => {
                ctx.skip(line, LogValidation::Invalid);
                None
            }
            Ok(record) => {
                ctx.record(record.level);
                Some(record)
            }
            Err(level) => {
                ctx.skip(line, level);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(lines: &[&str]) -> (Vec<EventRecord>, MapContext) {
        let dispatcher = LogDispatcher::new();
        let mut ctx = MapContext::new(false, true);
        let records = lines.iter().filter_map(|l| dispatcher.dispatch(l, &mut ctx)).collect();
        (records, ctx)
    }

    #[test]
    fn classifies_by_field_count() {
        assert_eq!(LogVariant::classify("a\tb\tc\td\te\tf"), Some(LogVariant::Common));
        assert_eq!(LogVariant::classify("a\tb\tc\td\te\tf\tg"), Some(LogVariant::Component));
        assert_eq!(LogVariant::classify("a b c"), None);
        assert_eq!(LogVariant::classify(""), None);
    }

    #[test]
    fn parses_common_line() {
        let (records, ctx) = dispatch(&["PAGEVIEW\tA\ts1\tt1\t20140101000000\tPH\r"]);
        assert_eq!(
            records,
            vec![EventRecord {
                appkey: "A".into(),
                country: Some("PH".into()),
                token: "t1".into(),
                session: "s1".into(),
                utctime: "20140101000000".into(),
                cmd: Command::PageView,
                component: None,
                level: LogValidation::Valid,
            }]
        );
        assert_eq!(ctx.counters().get(LogValidation::Valid), 1);
    }

    #[test]
    fn parses_component_line_without_country() {
        let (records, ctx) = dispatch(&["COMPONENT\tA\ts1\tt1\t20140101000000\t\tbutton-3"]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].country, None);
        assert_eq!(records[0].component.as_deref(), Some("button-3"));
        assert_eq!(records[0].level, LogValidation::Degraded);
        assert_eq!(ctx.counters().get(LogValidation::Degraded), 1);
    }

    #[test]
    fn rejects_command_of_the_other_variant() {
        let (records, ctx) = dispatch(&[
            "COMPONENT\tA\ts1\tt1\t20140101000000\tPH",
            "PAGEVIEW\tA\ts1\tt1\t20140101000000\tPH\tbutton",
            "BOGUS\tA\ts1\tt1\t20140101000000\tPH",
        ]);
        assert!(records.is_empty());
        assert_eq!(ctx.counters().get(LogValidation::Invalid), 3);
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let (records, ctx) = dispatch(&["STARTSESS\tA\t\tt1\t20140101000000\tPH"]);
        assert!(records.is_empty());
        assert_eq!(ctx.counters().get(LogValidation::Invalid), 1);
    }

    #[test]
    fn malformed_count_matches_unrecognized_lines() {
        let (records, ctx) = dispatch(&[
            "garbage",
            "",
            "STARTSESS\tA\ts1\tt1\t20140101000000\tPH",
            "too\tfew\tfields",
            "ENDSESS\tA\ts1\tt1\t20140101000500\tPH",
        ]);
        assert_eq!(records.len(), 2);
        assert_eq!(ctx.counters().get(LogValidation::Malformed), 3);
        assert_eq!(ctx.counters().total(), 5);
    }

    #[test]
    fn counting_off_records_nothing() {
        let dispatcher = LogDispatcher::new();
        let mut ctx = MapContext::new(false, false);
        assert!(dispatcher.dispatch("garbage", &mut ctx).is_none());
        assert_eq!(ctx.counters().total(), 0);
    }

    #[test]
    fn key_fields_holding_the_separator_are_invalid() {
        let (records, ctx) = dispatch(&[
            "PAGEVIEW\tA|B\ts1\tt1\t20140101000000\tPH",
            "PAGEVIEW\tA\ts|1\tt1\t20140101000000\tPH",
            "PAGEVIEW\tA\ts1\tt|1\t20140101000000\tP|H",
            "PAGEVIEW\tA\ts1\tt|1\t20140101000000\tPH",
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token, "t|1");
        assert_eq!(ctx.counters().get(LogValidation::Invalid), 3);
    }

    #[test]
    fn separator_follows_the_configured_one() {
        let dispatcher = LogDispatcher::new().with_separator(",");
        let mut ctx = MapContext::new(false, true);
        assert!(dispatcher.dispatch("PAGEVIEW\tA|B\ts1\tt1\t20140101000000\tPH", &mut ctx).is_some());
        assert!(dispatcher.dispatch("PAGEVIEW\tA,B\ts1\tt1\t20140101000000\tPH", &mut ctx).is_none());
        assert_eq!(ctx.counters().get(LogValidation::Invalid), 1);
    }

    #[test]
    fn variant_without_a_parser_is_malformed() {
        let dispatcher = LogDispatcher::with_parsers(vec![Box::new(DelimitedParser::new(LogVariant::Common))]);
        let mut ctx = MapContext::new(false, true);
        assert!(dispatcher.dispatch("PAGEVIEW\tA\ts1\tt1\t20140101000000\tPH", &mut ctx).is_some());
        assert!(dispatcher.dispatch("COMPONENT\tA\ts1\tt1\t20140101000000\tPH\tmenu", &mut ctx).is_none());
        assert_eq!(ctx.counters().get(LogValidation::Malformed), 1);
    }
}
