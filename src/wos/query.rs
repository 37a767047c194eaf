//! Structured search queries and their translation into the catalog's
//! general-search form protocol.
//!
//! A query is an alternating sequence of field terms and boolean operators,
//! submitted as one deterministic form payload. The builder keeps the
//! alternation invariant by construction: every term after the first
//! arrives together with its operator.

use std::fmt;
use tracing::warn;

use crate::error::{Error, Result};

/// Soft limit on the number of field terms per search. The service accepts
/// more but may balk; exceeding it logs a warning instead of failing.
pub const MAX_FIELD_COUNT: usize = 25;

/// Boolean operators the service understands between field terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    And,
    Or,
    Not,
    Same,
    Near,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
            Operator::Not => "NOT",
            Operator::Same => "SAME",
            Operator::Near => "NEAR",
        }
    }
}

impl std::str::FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AND" => Ok(Operator::And),
            "OR" => Ok(Operator::Or),
            "NOT" => Ok(Operator::Not),
            "SAME" => Ok(Operator::Same),
            "NEAR" => Ok(Operator::Near),
            other => Err(Error::InvalidRequest(format!(
                "unknown search operator `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named timespan presets offered by the search form's first radio button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimespanPreset {
    All,
    Latest5Years,
    YearToDate,
    FourWeeks,
    TwoWeeks,
    OneWeek,
}

impl TimespanPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimespanPreset::All => "ALL",
            TimespanPreset::Latest5Years => "Latest5Years",
            TimespanPreset::YearToDate => "YearToDate",
            TimespanPreset::FourWeeks => "4week",
            TimespanPreset::TwoWeeks => "2week",
            TimespanPreset::OneWeek => "1week",
        }
    }
}

/// Publication timespan restriction: a named preset, a single year, or an
/// inclusive year range. Partially redundant with searching the `PY` field;
/// that is the form's design, not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timespan {
    Preset(TimespanPreset),
    Year(u16),
    Range(u16, u16),
}

impl Timespan {
    /// Parse the CLI spelling: a preset name, `2007`, or `1990-2000`.
    pub fn parse(s: &str) -> Result<Self> {
        let preset = match s {
            "ALL" => Some(TimespanPreset::All),
            "Latest5Years" => Some(TimespanPreset::Latest5Years),
            "YearToDate" => Some(TimespanPreset::YearToDate),
            "4week" => Some(TimespanPreset::FourWeeks),
            "2week" => Some(TimespanPreset::TwoWeeks),
            "1week" => Some(TimespanPreset::OneWeek),
            _ => None,
        };
        if let Some(p) = preset {
            return Ok(Timespan::Preset(p));
        }
        if let Some((from, to)) = s.split_once('-') {
            let from = from.parse().map_err(|_| bad_timespan(s))?;
            let to = to.parse().map_err(|_| bad_timespan(s))?;
            return Ok(Timespan::Range(from, to));
        }
        s.parse().map(Timespan::Year).map_err(|_| bad_timespan(s))
    }

    /// The form's four redundant timespan fields. All four are always
    /// posted, exactly like a browser would; only one pair matters.
    fn params(timespan: Option<Timespan>) -> [(String, String); 4] {
        // idle defaults as they appear on the HTML form
        let mut period = "Range Selection";
        let mut range = "ALL".to_string();
        let (mut start_year, mut end_year) = (1900u16, 2000u16);

        match timespan {
            None => {}
            Some(Timespan::Preset(p)) => range = p.as_str().to_string(),
            Some(Timespan::Year(y)) => {
                period = "Year Range";
                (start_year, end_year) = (y, y);
            }
            Some(Timespan::Range(from, to)) => {
                period = "Year Range";
                (start_year, end_year) = (from, to);
            }
        }

        [
            ("period".to_string(), period.to_string()),
            ("range".to_string(), range),
            ("startYear".to_string(), start_year.to_string()),
            ("endYear".to_string(), end_year.to_string()),
        ]
    }
}

fn bad_timespan(s: &str) -> Error {
    Error::InvalidRequest(format!(
        "unknown timespan `{}` (expected a preset, a year, or FROM-TO)",
        s
    ))
}

/// Fixed block of protocol constants the remote form processor expects with
/// every search. Opaque configuration copied from a working browser
/// submission; treated as data and posted verbatim.
const FORM_CONSTANTS: &[(&str, &str)] = &[
    ("input_invalid_notice", "Search Error: Please enter a search term."),
    (
        "exp_notice",
        "Search Error: Patent search term could be found in more than one family (unique patent number required for Expand option) ",
    ),
    ("max_field_notice", "Notice: You cannot add another field."),
    (
        "input_invalid_notice_limits",
        " <br/>Note: Fields displayed in scrolling boxes must be combined with at least one other search field.",
    ),
    ("x", "0"),
    ("y", "0"),
    ("ss_query_language", "auto"),
    ("ss_showsuggestions", "ON"),
    ("ss_numDefaultGeneralSearchFields", "1"),
    ("ss_lemmatization", "On"),
    ("limitStatus", "collapsed"),
    ("update_back2search_link_param", "yes"),
    ("ss_spellchecking", "Suggest"),
    ("ssStatus", "display:none"),
    ("formUpdated", "true"),
];

/// One general-search query: alternating field terms and operators, plus a
/// timespan, edition list, and sort specification.
///
/// Field tags are the service's two-letter codes (`TS` topic, `TI` title,
/// `AU` author, `PY` year, `UT` accession number, ...). Query strings pass
/// through unchecked; the service's globbing applies.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    terms: Vec<(String, String)>,
    operators: Vec<Operator>,
    timespan: Option<Timespan>,
    editions: Vec<String>,
    sort: String,
}

impl SearchQuery {
    /// Start a query from its first field term.
    pub fn new(field: &str, text: &str) -> Self {
        Self {
            terms: vec![(field.to_string(), text.to_string())],
            operators: Vec::new(),
            timespan: None,
            editions: crate::config::ExportConfig::default().editions,
            sort: crate::config::ExportConfig::default().sort,
        }
    }

    /// Append `<op> field=text` to the query.
    pub fn push_term(mut self, op: Operator, field: &str, text: &str) -> Self {
        self.operators.push(op);
        self.terms.push((field.to_string(), text.to_string()));
        self
    }

    pub fn and(self, field: &str, text: &str) -> Self {
        self.push_term(Operator::And, field, text)
    }

    pub fn or(self, field: &str, text: &str) -> Self {
        self.push_term(Operator::Or, field, text)
    }

    pub fn not(self, field: &str, text: &str) -> Self {
        self.push_term(Operator::Not, field, text)
    }

    /// Join several values into the form's `###`-separated enumeration
    /// spelling for a single field term.
    pub fn join_values(values: &[&str]) -> String {
        values.join("###")
    }

    pub fn timespan(mut self, timespan: Timespan) -> Self {
        self.timespan = Some(timespan);
        self
    }

    pub fn editions(mut self, editions: &[&str]) -> Self {
        self.editions = editions.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn sort(mut self, sort: &str) -> Self {
        self.sort = sort.to_string();
        self
    }

    pub fn terms(&self) -> &[(String, String)] {
        &self.terms
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Build the complete form payload for the general-search endpoint.
    ///
    /// Five sections, in order: session identity, the protocol-constant
    /// block, the field/operator terms, the timespan, and sort/editions.
    /// The result is a list of pairs because the editions section repeats
    /// its parameter name.
    pub fn form(&self, sid: &str) -> Vec<(String, String)> {
        let mut form: Vec<(String, String)> = Vec::new();

        // 1. session/product identity
        form.push(("product".into(), "WOS".into()));
        form.push(("action".into(), "search".into()));
        form.push(("search_mode".into(), "GeneralSearch".into()));
        form.push(("SID".into(), sid.to_string()));

        // 2. protocol constants
        form.extend(
            FORM_CONSTANTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        // 3. terms: a select/input/hidInput triple per field, operators
        // interleaved; terms are numbered from 1
        for (i, (field, text)) in self.terms.iter().enumerate() {
            let t = i + 1;
            form.push((format!("value(select{})", t), field.clone()));
            form.push((format!("value(input{})", t), text.clone()));
            form.push((format!("value(hidInput{})", t), String::new()));
            if let Some(op) = self.operators.get(i) {
                form.push((format!("value(bool_{}_{})", t, t + 1), op.as_str().into()));
            }
        }
        if self.terms.len() > MAX_FIELD_COUNT {
            warn!(
                terms = self.terms.len(),
                limit = MAX_FIELD_COUNT,
                "submitting more field terms than the service advertises; it may balk"
            );
        }
        form.push(("fieldCount".into(), self.terms.len().to_string()));
        form.push(("max_field_count".into(), MAX_FIELD_COUNT.to_string()));

        // 4. timespan
        form.extend(Timespan::params(self.timespan));

        // 5. sort and editions (repeated key)
        form.push(("rs_sort_by".into(), self.sort.clone()));
        for edition in &self.editions {
            form.push(("editions".into(), edition.clone()));
        }

        form
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, text)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", self.operators[i - 1])?;
            }
            write!(f, "{}={}", field, text)?;
        }
        Ok(())
    }
}
