//! Output rows: key columns and value columns, each joined by a field separator,
//! with a tab between the two halves.

use crate::constants::KEY_VALUE_DELIMITER;
use anyhow::{Context, Result};
use memchr::memchr;
use std::io::Write;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultRow {
    pub key: Vec<String>,
    pub value: Vec<String>,
}

impl ResultRow {
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: IntoIterator,
        K::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            key: key.into_iter().map(Into::into).collect(),
            value: value.into_iter().map(Into::into).collect(),
        }
    }

    pub fn render(&self, separator: &str) -> String {
        let mut line = self.key.join(separator);
        line.push(KEY_VALUE_DELIMITER);
        line.push_str(&self.value.join(separator));
        line
    }

    /// Inverse of [`ResultRow::render`]. `None` when the line has no key/value tab.
    pub fn parse(line: &str, separator: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let tab = memchr(KEY_VALUE_DELIMITER as u8, line.as_bytes())?;
        let (key, value) = (&line[..tab], &line[tab + 1..]);
        Some(Self {
            key: key.split(separator).map(str::to_string).collect(),
            value: value.split(separator).map(str::to_string).collect(),
        })
    }
}

/// Column names of the rows a stage writes or reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowSchema {
    pub key: &'static [&'static str],
    pub value: &'static [&'static str],
}

impl RowSchema {
    pub fn accepts(&self, row: &ResultRow) -> bool {
        row.key.len() == self.key.len() && row.value.len() == self.value.len()
    }
}

impl std::fmt::Display for RowSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) -> ({})", self.key.join(", "), self.value.join(", "))
    }
}

/// Writes rows as delimited text lines.
#[derive(Clone, Debug)]
pub struct TextRowSink {
    separator: String,
}

impl TextRowSink {
    pub fn new(separator: impl Into<String>) -> Self {
        Self { separator: separator.into() }
    }

    pub fn write_row<W: Write>(&self, out: &mut W, row: &ResultRow) -> Result<()> {
        writeln!(out, "{}", row.render(&self.separator)).context("write result row")
    }
}
