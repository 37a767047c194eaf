//! Flat-file record parsing and serialization.
//!
//! The catalog exports records in a line-oriented, tag-prefixed format: a
//! `VR 1.0` version marker near the top of the file, then records. Each
//! record opens with a `PT` line, carries two-letter tags whose values may
//! continue over lines prefixed with exactly three spaces, and closes with
//! `ER`. The file closes with `EF`.
//!
//! ```text
//! FN Thomson Reuters Web of Science
//! VR 1.0
//! PT J
//! TI Some title that
//!    wraps onto a second line
//! PY 2007
//! ER
//! EF
//! ```

use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Version marker that must appear in the first or second line of a file.
pub const VERSION_MARKER: &str = "VR 1.0";
/// Tag opening a record; its value is the record type.
pub const TYPE_TAG: &str = "PT";
/// Tag closing a record.
pub const RECORD_TERMINATOR: &str = "ER";
/// Tag closing a file.
pub const FILE_TERMINATOR: &str = "EF";

/// One bibliographic record: a mapping from two-letter tag to the lines
/// filed under it. Tag order is not meaningful; line order within a tag is
/// and is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, Vec<String>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields<I, T, L>(fields: I) -> Self
    where
        I: IntoIterator<Item = (T, Vec<L>)>,
        T: Into<String>,
        L: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(tag, lines)| {
                    (
                        tag.into(),
                        lines.into_iter().map(Into::into).collect::<Vec<_>>(),
                    )
                })
                .collect(),
        }
    }

    /// Lines filed under a tag.
    pub fn get(&self, tag: &str) -> Option<&[String]> {
        self.fields.get(tag).map(Vec::as_slice)
    }

    /// The record type: the first line of the `PT` field.
    pub fn record_type(&self) -> Option<&str> {
        self.get(TYPE_TAG).and_then(|lines| lines.first()).map(String::as_str)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.fields
            .iter()
            .map(|(tag, lines)| (tag.as_str(), lines.as_slice()))
    }

    /// Number of distinct tags.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push_line(&mut self, tag: &str, line: &str) {
        self.fields
            .entry(tag.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// Serialize this record in the flat-file format: the `PT` line first
    /// when present, three-space continuation lines, `ER` at the end.
    /// `parse_record` of the output yields an equal record.
    pub fn write_field_tagged(&self, out: &mut String) {
        let mut write_field = |tag: &str, lines: &[String]| {
            for (i, line) in lines.iter().enumerate() {
                if i == 0 {
                    out.push_str(tag);
                    out.push(' ');
                } else {
                    out.push_str("   ");
                }
                out.push_str(line);
                out.push('\n');
            }
        };

        if let Some(lines) = self.fields.get(TYPE_TAG) {
            write_field(TYPE_TAG, lines);
        }
        for (tag, lines) in &self.fields {
            if tag != TYPE_TAG {
                write_field(tag, lines);
            }
        }
        out.push_str(RECORD_TERMINATOR);
        out.push('\n');
    }

    pub fn to_field_tagged(&self) -> String {
        let mut out = String::new();
        self.write_field_tagged(&mut out);
        out
    }
}

/// What the file-level parser noticed besides the records themselves.
/// Degraded but recoverable conditions land here instead of failing the
/// whole file.
#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    /// End of input arrived before the `EF` terminator.
    pub missing_file_terminator: bool,
    /// Non-empty lines after `EF` (logged, never fatal).
    pub trailing_lines: usize,
    /// Records abandoned because of a malformed line; each entry names the
    /// offender. The rest of the file still parses.
    pub record_errors: Vec<String>,
}

impl ParseReport {
    pub fn is_clean(&self) -> bool {
        !self.missing_file_terminator && self.trailing_lines == 0 && self.record_errors.is_empty()
    }
}

/// A parsed export file: the records plus the degradation report.
#[derive(Debug, Clone, Default)]
pub struct RecordFile {
    pub records: Vec<Record>,
    pub report: ParseReport,
}

fn is_tag_line(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || bytes[2] != b' ' {
        return None;
    }
    let tag = &line[..2];
    if !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((tag, &line[3..]))
}

fn terminator_tag(line: &str) -> Option<&str> {
    let trimmed = line.trim_end();
    if trimmed == RECORD_TERMINATOR || trimmed == FILE_TERMINATOR {
        Some(trimmed)
    } else {
        None
    }
}

/// Parse one record from `lines`, starting at `pos` (which must be a tag
/// line), consuming up to and including its `ER`. Returns the record and
/// the index just past the terminator.
fn parse_record_at(lines: &[&str], pos: usize) -> Result<(Record, usize)> {
    let mut record = Record::new();
    let mut current_tag: Option<String> = None;
    let mut i = pos;

    while i < lines.len() {
        let line = lines[i];
        if terminator_tag(line) == Some(RECORD_TERMINATOR) {
            return Ok((record, i + 1));
        }
        if let Some(rest) = line.strip_prefix("   ") {
            // continuation of the current field
            match &current_tag {
                Some(tag) => record.push_line(tag, rest.trim_end_matches('\r')),
                None => {
                    return Err(Error::Format(format!(
                        "continuation line before any tag: {:?}",
                        line
                    )))
                }
            }
        } else if let Some((tag, content)) = is_tag_line(line) {
            record.push_line(tag, content.trim_end_matches('\r'));
            current_tag = Some(tag.to_string());
        } else {
            return Err(Error::Format(format!(
                "line is neither a tag nor a continuation: {:?}",
                line
            )));
        }
        i += 1;
    }
    Err(Error::Format(
        "end of input before the record terminator".to_string(),
    ))
}

/// Parse a single serialized record (tag lines through `ER`). Unlike the
/// file-level parser this accepts any opening tag, so it is the inverse of
/// [`Record::write_field_tagged`] for records without a `PT` field too.
pub fn parse_record(input: &str) -> Result<Record> {
    let lines: Vec<&str> = input.lines().collect();
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::Format("empty record".to_string()))?;
    let (record, _) = parse_record_at(&lines, start)?;
    Ok(record)
}

/// Parse a whole export file.
///
/// The version marker must sit in the first or second line; without it the
/// input is rejected before any record is read. Malformed records are
/// skipped (to the next `ER`) and reported; a missing `EF` is reported, not
/// fatal, and never discards records parsed before end of input.
pub fn parse_str(input: &str) -> Result<RecordFile> {
    let lines: Vec<&str> = input.lines().collect();

    let marker = lines
        .iter()
        .take(2)
        .position(|l| l.contains(VERSION_MARKER))
        .ok_or_else(|| {
            Error::Format(format!(
                "missing `{}` version marker in the first two lines",
                VERSION_MARKER
            ))
        })?;

    let mut file = RecordFile::default();
    let mut i = marker + 1;
    let mut terminated = false;

    while i < lines.len() {
        let line = lines[i];
        if line.trim().is_empty() {
            i += 1;
            continue;
        }
        if terminator_tag(line) == Some(FILE_TERMINATOR) {
            terminated = true;
            i += 1;
            break;
        }
        if is_tag_line(line).map(|(tag, _)| tag) != Some(TYPE_TAG) {
            file.report
                .record_errors
                .push(format!("record does not start with {}: {:?}", TYPE_TAG, line));
            i = skip_to_next_record(&lines, i);
            continue;
        }
        match parse_record_at(&lines, i) {
            Ok((record, next)) => {
                file.records.push(record);
                i = next;
            }
            Err(e) => {
                file.report.record_errors.push(e.to_string());
                i = skip_to_next_record(&lines, i);
            }
        }
    }

    if terminated {
        let trailing = lines[i..].iter().filter(|l| !l.trim().is_empty()).count();
        if trailing > 0 {
            debug!(lines = trailing, "content after the file terminator");
            file.report.trailing_lines = trailing;
        }
    } else {
        warn!(
            records = file.records.len(),
            "input ended without the {} terminator", FILE_TERMINATOR
        );
        file.report.missing_file_terminator = true;
    }
    for err in &file.report.record_errors {
        warn!(%err, "abandoned a malformed record");
    }
    Ok(file)
}

fn skip_to_next_record(lines: &[&str], pos: usize) -> usize {
    let mut i = pos;
    while i < lines.len() {
        if terminator_tag(lines[i]) == Some(RECORD_TERMINATOR) {
            return i + 1;
        }
        // a file terminator also ends the broken record; leave it for the
        // main loop to see
        if terminator_tag(lines[i]) == Some(FILE_TERMINATOR) {
            return i;
        }
        i += 1;
    }
    i
}

pub fn parse_reader<R: Read>(reader: R) -> Result<RecordFile> {
    let mut input = String::new();
    BufReader::new(reader).read_to_string(&mut input)?;
    parse_str(&input)
}

pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<RecordFile> {
    let input = std::fs::read_to_string(path.as_ref())?;
    parse_str(&input)
}

/// Serialize records as a complete export file: header, records, `EF`.
pub fn write_file(records: &[Record]) -> String {
    let mut out = String::new();
    out.push_str("FN wosrip\n");
    out.push_str(VERSION_MARKER);
    out.push('\n');
    for record in records {
        record.write_field_tagged(&mut out);
    }
    out.push_str(FILE_TERMINATOR);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
FN Thomson Reuters Web of Science
VR 1.0
PT J
AU Mitchell, TM
TI Never-ending language
   learning
PY 2007
UT WOS:000252277600019
ER
PT J
AU Banko, M
TI Open information extraction
PY 2008
ER
EF
";

    #[test]
    fn test_parses_records_and_continuations() {
        let file = parse_str(SAMPLE).unwrap();
        assert!(file.report.is_clean());
        assert_eq!(file.records.len(), 2);

        let first = &file.records[0];
        assert_eq!(first.record_type(), Some("J"));
        assert_eq!(
            first.get("TI").unwrap(),
            &["Never-ending language".to_string(), "learning".to_string()]
        );
        assert_eq!(first.get("PY").unwrap(), &["2007".to_string()]);
    }

    #[test]
    fn test_round_trip_preserves_mapping() {
        let record = Record::from_fields([
            ("TI", vec!["Line one", "continued line"]),
            ("PY", vec!["2007"]),
        ]);
        let serialized = record.to_field_tagged();
        let reparsed = parse_record(&serialized).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn test_round_trip_with_type_tag_first() {
        let record = Record::from_fields([
            ("PT", vec!["J"]),
            ("AU", vec!["Mitchell, TM", "Banko, M"]),
            ("SC", vec!["Computer Science"]),
        ]);
        let serialized = record.to_field_tagged();
        assert!(serialized.starts_with("PT J\n"));
        assert_eq!(parse_record(&serialized).unwrap(), record);
    }

    #[test]
    fn test_missing_version_marker_is_fatal() {
        let err = parse_str("PT J\nER\nEF\n").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn test_marker_accepted_on_second_line() {
        let file = parse_str("FN Something\nVR 1.0\nPT J\nER\nEF\n").unwrap();
        assert_eq!(file.records.len(), 1);
    }

    #[test]
    fn test_missing_file_terminator_is_degraded_not_fatal() {
        let input = "VR 1.0\nPT J\nPY 2007\nER\n";
        let file = parse_str(input).unwrap();
        assert_eq!(file.records.len(), 1);
        assert!(file.report.missing_file_terminator);
        assert!(file.report.record_errors.is_empty());
    }

    #[test]
    fn test_trailing_content_after_terminator_is_reported() {
        let input = "VR 1.0\nPT J\nER\nEF\nstray line\n";
        let file = parse_str(input).unwrap();
        assert_eq!(file.records.len(), 1);
        assert_eq!(file.report.trailing_lines, 1);
        assert!(!file.report.missing_file_terminator);
    }

    #[test]
    fn test_malformed_line_aborts_only_that_record() {
        let input = "\
VR 1.0
PT J
PY 2007
!! not a field
ER
PT J
PY 2008
ER
EF
";
        let file = parse_str(input).unwrap();
        assert_eq!(file.records.len(), 1);
        assert_eq!(file.records[0].get("PY").unwrap(), &["2008".to_string()]);
        assert_eq!(file.report.record_errors.len(), 1);
        assert!(file.report.record_errors[0].contains("!! not a field"));
    }

    #[test]
    fn test_eof_inside_record_reports_both_conditions() {
        let input = "VR 1.0\nPT J\nPY 2007\n";
        let file = parse_str(input).unwrap();
        assert!(file.records.is_empty());
        assert_eq!(file.report.record_errors.len(), 1);
        assert!(file.report.missing_file_terminator);
    }

    #[test]
    fn test_record_must_open_with_type_tag() {
        let input = "VR 1.0\nAU Mitchell, TM\nER\nPT J\nER\nEF\n";
        let file = parse_str(input).unwrap();
        assert_eq!(file.records.len(), 1);
        assert_eq!(file.report.record_errors.len(), 1);
        assert!(file.report.record_errors[0].contains("does not start with PT"));
    }

    #[test]
    fn test_write_file_round_trips() {
        let records = vec![
            Record::from_fields([("PT", vec!["J"]), ("PY", vec!["1999"])]),
            Record::from_fields([("PT", vec!["J"]), ("TI", vec!["a", "b"])]),
        ];
        let text = write_file(&records);
        let file = parse_str(&text).unwrap();
        assert!(file.report.is_clean());
        assert_eq!(file.records, records);
    }
}
