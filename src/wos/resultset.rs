//! Server-cached resultsets: bounded export and resumable bulk export.
//!
//! A [`ResultSet`] wraps the (qid, mode) handle a search left in the
//! service's cache. Records come out through the export endpoint, at most
//! 500 per request; [`ResultSet::rip`] drains a whole resultset into a
//! directory of block files, atomically published and safely resumable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::wos::{inspect_url, WosSession};

/// The service refuses to export more than this many records per call.
pub const EXPORT_BLOCK_LIMIT: u64 = 500;

/// Suffix of in-progress block files. A file with this suffix is not data;
/// a successful rip leaves none behind.
pub const TEMP_SUFFIX: &str = ".part";

/// The operation that produced a resultset handle. qid and mode must
/// travel together: redeeming a qid under the wrong mode yields a
/// thematically empty export, not an error, so the pairing is load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    GeneralSearch,
    AdvancedSearch,
    CitedRefList,
    CitingArticles,
    TotalCitingArticles,
    NonSelfCitingTCA,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::GeneralSearch => "GeneralSearch",
            Mode::AdvancedSearch => "AdvancedSearch",
            Mode::CitedRefList => "CitedRefList",
            Mode::CitingArticles => "CitingArticles",
            Mode::TotalCitingArticles => "TotalCitingArticles",
            Mode::NonSelfCitingTCA => "NonSelfCitingTCA",
        }
    }
}

/// Export encodings offered by the "Save to Other File Formats" dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// The flat-file format `crate::records` parses
    #[default]
    FieldTagged,
    /// Same format under the dialog's "other reference software" label
    OtherSoftware,
    Bibtex,
    Html,
    WinTabDelimited,
    MacTabDelimited,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::FieldTagged => "fieldtagged",
            ExportFormat::OtherSoftware => "othersoftware",
            ExportFormat::Bibtex => "bibtex",
            ExportFormat::Html => "html",
            ExportFormat::WinTabDelimited => "winTabUTF8",
            ExportFormat::MacTabDelimited => "macTabUTF8",
        }
    }
}

/// Reference to one server-cached query.
#[derive(Debug, Clone)]
pub struct ResultSetHandle {
    /// Opaque cache identifier assigned by the service
    pub qid: String,
    /// Operation that produced the handle
    pub mode: Mode,
    /// URL of the results page the handle was extracted from
    pub referer: String,
    /// Number of records in the resultset
    pub count: u64,
    /// Whether `count` is an upper-bound estimate rather than exact
    pub estimated: bool,
}

/// Everything exportable, as posted from a working export dialog. The
/// trailing double space is part of the protocol as observed.
const FULL_FIELD_SELECTION: &str = "PMID USAGEIND AUTHORSIDENTIFIERS ACCESSION_NUM FUNDING SUBJECT_CATEGORY JCR_CATEGORY LANG IDS PAGEC SABBR CITREFC ISSN PUBINFO KEYWORDS CITTIMES ADDRS CONFERENCE_SPONSORS DOCTYPE CITREF ABSTRACT CONFERENCE_INFO SOURCE TITLE AUTHORS  ";

/// Cited-reference resultsets cannot produce full records; the service
/// only honors this reduced set for them.
const CITED_REF_FIELD_SELECTION: &str = "ABSTRACT CITTIMES SOURCE TITLE AUTHORS  ";

/// Ordering for exported records (independent of the search sort).
const EXPORT_SORT: &str = "PY.A;LD.D;SO.A;VL.D;PG.A;AU.A";

/// Fixed portion of the export payload. Copied from a working submission;
/// opaque configuration, posted verbatim.
const EXPORT_FORM_BASE: &[(&str, &str)] = &[
    ("IncitesEntitled", "no"),
    ("count_new_items_marked", "0"),
    ("displayCitedRefs", "true"),
    ("displayTimesCited", "true"),
    ("fields_selection", FULL_FIELD_SELECTION),
    ("filters", FULL_FIELD_SELECTION),
    // `format` is the shape of the request, not the output encoding
    ("format", "saveToFile"),
    ("mode", "OpenOutputService"),
    ("product", "WOS"),
    ("mark_id", "WOS"),
    ("colName", "WOS"),
    ("value(record_select_type)", "range"),
    ("viewType", "summary"),
    ("view_name", "WOS-summary"),
    ("selectedIds", ""),
    ("sortBy", EXPORT_SORT),
];

/// Per-mode overrides applied on top of [`EXPORT_FORM_BASE`]. Versioned
/// configuration data, reverse-engineered from the live service; a mode
/// missing from this table must fail fast rather than export under the
/// defaults and come back thematically empty.
const MODE_OVERRIDES: &[(&str, &[(&str, &str)])] = &[
    ("GeneralSearch", &[("search_mode", "GeneralSearch")]),
    ("AdvancedSearch", &[("search_mode", "AdvancedSearch")]),
    (
        "CitedRefList",
        &[
            ("search_mode", "CitedRefList"),
            ("view_name", "WOS-CitedRefList-summary"),
            ("fields_selection", CITED_REF_FIELD_SELECTION),
            ("filters", CITED_REF_FIELD_SELECTION),
        ],
    ),
    (
        "CitingArticles",
        &[
            ("search_mode", "CitingArticles"),
            ("view_name", "WOS-CitingArticles-summary"),
        ],
    ),
    (
        "TotalCitingArticles",
        &[("search_mode", "TotalCitingArticles")],
    ),
    ("NonSelfCitingTCA", &[("search_mode", "NonSelfCitingTCA")]),
];

fn mode_overrides(mode: Mode) -> Result<&'static [(&'static str, &'static str)]> {
    MODE_OVERRIDES
        .iter()
        .find(|(name, _)| *name == mode.as_str())
        .map(|(_, overrides)| *overrides)
        .ok_or_else(|| {
            Error::Config(format!(
                "no export overrides configured for mode {}",
                mode.as_str()
            ))
        })
}

/// Replace `key` everywhere it occurs, or append it.
fn set_param(form: &mut Vec<(String, String)>, key: &str, value: &str) {
    let mut found = false;
    for (k, v) in form.iter_mut() {
        if k == key {
            *v = value.to_string();
            found = true;
        }
    }
    if !found {
        form.push((key.to_string(), value.to_string()));
    }
}

/// Canonical filename for a block covering `[start, end]`.
pub fn block_filename(start: u64, end: u64) -> String {
    format!("records_{:06}-{:06}.isi", start, end)
}

/// Split `[1, bound]` into consecutive inclusive blocks of at most
/// [`EXPORT_BLOCK_LIMIT`] records.
fn plan_blocks(bound: u64) -> Vec<(u64, u64)> {
    let mut blocks = Vec::new();
    let mut start = 1;
    while start <= bound {
        let end = bound.min(start + EXPORT_BLOCK_LIMIT - 1);
        blocks.push((start, end));
        start = end + 1;
    }
    blocks
}

/// Write `bytes` next to `path` under the temporary suffix, then atomically
/// rename into place. The canonical name never refers to a partial file.
fn publish_block(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TEMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    let write = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(e) = write {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Remove leftover temporaries from an interrupted run. They are never
/// valid data; their block is either skipped or exported again.
fn sweep_temporaries(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
            debug!(file = %entry.path().display(), "removing stale temporary");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Per-run provenance file written into the rip target directory. A resume
/// must be ripping the same query; the manifest is how we know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RipManifest {
    /// Human-readable description of the originating query
    pub query: String,
    /// Total record count reported when the resultset was created
    pub count: u64,
    /// Whether that count was an estimate
    pub estimated: bool,
    /// Remote session identifier the resultset belongs to
    pub sid: String,
    /// RFC 3339 timestamp of the run that wrote this manifest
    pub started: String,
}

impl RipManifest {
    pub const FILENAME: &'static str = "manifest.toml";

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Format(format!("unreadable manifest: {}", e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("unwritable manifest: {}", e)))?;
        fs::write(path, text)?;
        Ok(())
    }
}

/// What a `rip` run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RipReport {
    /// Blocks fetched and published this run
    pub exported: usize,
    /// Blocks skipped because their file already existed
    pub skipped: usize,
    /// True when an estimated count ran out before the planned bound
    pub ended_early: bool,
}

/// One server-cached query, bound to the session that created it.
///
/// The session's resultset cache is keyed by SID; a handle does not survive
/// its session, which is why this borrows rather than owns.
pub struct ResultSet<'s> {
    session: &'s WosSession,
    handle: ResultSetHandle,
    description: String,
}

impl<'s> ResultSet<'s> {
    pub(crate) fn new(session: &'s WosSession, handle: ResultSetHandle, description: String) -> Self {
        Self {
            session,
            handle,
            description,
        }
    }

    pub fn handle(&self) -> &ResultSetHandle {
        &self.handle
    }

    /// Provenance string recorded in rip manifests.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Number of records in the resultset. May be an estimate; check
    /// [`ResultSet::is_estimated`] before treating it as exact.
    pub fn len(&self) -> u64 {
        self.handle.count
    }

    pub fn is_empty(&self) -> bool {
        self.handle.count == 0
    }

    pub fn is_estimated(&self) -> bool {
        self.handle.estimated
    }

    pub fn mode(&self) -> Mode {
        self.handle.mode
    }

    /// Export records `[start, end]` (inclusive, 1-based) in `format`.
    ///
    /// Rejects ranges the service would refuse - more than
    /// [`EXPORT_BLOCK_LIMIT`] records, or inverted bounds - before any
    /// network traffic.
    pub fn export(&self, start: u64, end: u64, format: ExportFormat) -> Result<Vec<u8>> {
        if start < 1 || start > end {
            return Err(Error::InvalidRequest(format!(
                "bad export range [{}, {}]",
                start, end
            )));
        }
        if end - start >= EXPORT_BLOCK_LIMIT {
            return Err(Error::InvalidRequest(format!(
                "export range [{}, {}] covers more than {} records",
                start, end, EXPORT_BLOCK_LIMIT
            )));
        }

        let form = self.export_form(start, end, format)?;
        let url = format!(
            "{}/OutboundService.do?action=go",
            self.session.catalog().base
        );
        let response = self.session.proxy().request(
            reqwest::Method::POST,
            &url,
            reqwest::header::HeaderMap::new(),
            Some(form),
        )?;

        // the service answers bad ranges with a happy 200 redirect to an
        // error page; translate before touching the body
        inspect_url(response.url())?;
        Ok(response.bytes()?.to_vec())
    }

    /// The full export payload: base table, then identity and range
    /// parameters, then the mode's overrides.
    fn export_form(&self, start: u64, end: u64, format: ExportFormat) -> Result<Vec<(String, String)>> {
        let sid = self.session.sid()?;
        let mut form: Vec<(String, String)> = EXPORT_FORM_BASE
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        form.push(("save_options".into(), format.as_str().into()));
        form.push(("locale".into(), self.session.export_config().locale.clone()));
        // the service expects every range bound twice, in both spellings
        form.push(("markFrom".into(), start.to_string()));
        form.push(("mark_from".into(), start.to_string()));
        form.push(("markTo".into(), end.to_string()));
        form.push(("mark_to".into(), end.to_string()));
        form.push(("SID".into(), sid.to_string()));
        form.push(("qid".into(), self.handle.qid.clone()));
        form.push((
            "rurl".into(),
            urlencoding::encode(&self.handle.referer).into_owned(),
        ));

        for (key, value) in mode_overrides(self.handle.mode)? {
            set_param(&mut form, key, value);
        }
        Ok(form)
    }

    /// Export the whole resultset into `dir`, at most
    /// [`EXPORT_BLOCK_LIMIT`] records per request, in strictly ascending
    /// block order.
    ///
    /// Already-present block files are skipped without network traffic
    /// unless `overwrite` is set, so an interrupted run resumes by being
    /// run again. Each block lands under a temporary name and is renamed
    /// only after its export fully succeeded; `upper_limit` caps how deep
    /// into the resultset the run goes.
    pub fn rip(&self, dir: &Path, overwrite: bool, upper_limit: Option<u64>) -> Result<RipReport> {
        let bound = match upper_limit {
            Some(limit) => self.handle.count.min(limit),
            None => self.handle.count,
        };
        let blocks = plan_blocks(bound);
        fs::create_dir_all(dir)?;
        sweep_temporaries(dir)?;

        let manifest_path = dir.join(RipManifest::FILENAME);
        if manifest_path.exists() && !overwrite {
            let manifest = RipManifest::load(&manifest_path)?;
            if manifest.query != self.description {
                return Err(Error::InvalidRequest(format!(
                    "directory {} belongs to query `{}`, not `{}`",
                    dir.display(),
                    manifest.query,
                    self.description
                )));
            }
            if let Some((start, end)) = blocks.last() {
                if dir.join(block_filename(*start, *end)).exists() {
                    info!(dir = %dir.display(), "all blocks already present");
                    return Ok(RipReport {
                        skipped: blocks.len(),
                        ..RipReport::default()
                    });
                }
            }
        } else {
            let manifest = RipManifest {
                query: self.description.clone(),
                count: self.handle.count,
                estimated: self.handle.estimated,
                sid: self.session.sid()?.to_string(),
                started: chrono::Utc::now().to_rfc3339(),
            };
            manifest.save(&manifest_path)?;
        }

        let mut report = RipReport::default();
        for (start, end) in blocks {
            let path = dir.join(block_filename(start, end));
            if !overwrite && path.exists() {
                debug!(file = %path.display(), "block already ripped");
                report.skipped += 1;
                continue;
            }
            match self.export(start, end, ExportFormat::FieldTagged) {
                Ok(bytes) => {
                    publish_block(&path, &bytes)?;
                    info!(records = end - start + 1, file = %path.display(), "exported block");
                    report.exported += 1;
                }
                Err(Error::InvalidInput(msg)) if self.handle.estimated => {
                    // an estimated count overshooting the real data is the
                    // normal end condition, not a failure
                    debug!(start, %msg, "estimated resultset ran out");
                    report.ended_early = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

impl std::fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("qid", &self.handle.qid)
            .field("mode", &self.handle.mode)
            .field("count", &self.handle.count)
            .field("estimated", &self.handle.estimated)
            .finish()
    }
}
