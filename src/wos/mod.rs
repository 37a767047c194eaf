//! Client for the Web of Science catalog over a relay session.
//!
//! The service works by caching resultsets server-side: a search does not
//! return records, it returns an opaque handle (`qid`) that later export
//! calls redeem. Everything here is screen-extraction from a service that
//! answers 200 OK for nearly everything and hides its errors in redirect
//! query parameters or HTML containers; [`inspect_url`] and
//! [`classify_error_key`] turn those into typed errors.

mod query;
mod resultset;

pub use query::{Operator, SearchQuery, Timespan, TimespanPreset, MAX_FIELD_COUNT};
pub use resultset::{
    ExportFormat, Mode, ResultSet, ResultSetHandle, RipManifest, RipReport, EXPORT_BLOCK_LIMIT,
};

use reqwest::blocking::Response;
use reqwest::header::{HeaderMap, REFERER};
use reqwest::Method;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CatalogConfig, Config, ExportConfig};
use crate::error::{Error, Result};
use crate::proxy::{Credentials, ProxySession};

/// Marker key in a response's final URL that flags a service-level error
/// delivered by redirect.
const ERROR_REDIRECT_MARKER: &str = "error_display_redirect";
/// Query parameter naming the error kind on an error redirect.
const ERROR_KEY_PARAM: &str = "error_key";
/// Query parameter carrying the human-readable message on an error redirect.
const ERROR_MESSAGE_PARAM: &str = "error_message";

/// Error kinds the service is known to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteErrorKind {
    InvalidInput,
    NoRecordsFound,
}

/// Static mapping from service error key to error kind. The key set is
/// reverse-engineered; anything unlisted falls through to
/// [`Error::RemoteService`] with the raw key preserved.
const ERROR_KEYS: &[(&str, RemoteErrorKind)] = &[
    ("Server.invalidInput", RemoteErrorKind::InvalidInput),
    ("Invalid_Input", RemoteErrorKind::InvalidInput),
    ("Server.noRecordsFound", RemoteErrorKind::NoRecordsFound),
    ("No_Records_Found", RemoteErrorKind::NoRecordsFound),
];

/// Translate a service error key (plus its message) into a typed error.
pub(crate) fn classify_error_key(key: &str, message: &str) -> Error {
    for (known, kind) in ERROR_KEYS {
        if *known == key {
            return match kind {
                RemoteErrorKind::InvalidInput => Error::InvalidInput(if message.is_empty() {
                    key.to_string()
                } else {
                    message.to_string()
                }),
                RemoteErrorKind::NoRecordsFound => Error::NoRecordsFound,
            };
        }
    }
    Error::RemoteService {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Check a response's final URL for the redirect-style error marker. Every
/// response from the service passes through here before its body is used.
pub(crate) fn inspect_url(final_url: &Url) -> Result<()> {
    let mut key = None;
    let mut message = None;
    let mut marked = false;
    for (k, v) in final_url.query_pairs() {
        match k.as_ref() {
            ERROR_REDIRECT_MARKER => marked = true,
            ERROR_KEY_PARAM => key = Some(v.into_owned()),
            ERROR_MESSAGE_PARAM => message = Some(v.into_owned()),
            _ => {}
        }
    }
    if marked {
        return Err(classify_error_key(
            key.as_deref().unwrap_or(""),
            message.as_deref().unwrap_or(""),
        ));
    }
    Ok(())
}

fn selector(css: &str) -> Selector {
    // all callers pass literals
    Selector::parse(css).expect("selector literal parses")
}

/// A response body plus the URL it finally arrived from, post-redirects.
struct Page {
    final_url: Url,
    body: String,
}

/// Resultset coordinates screen-extracted from a search-style results page.
#[derive(Debug)]
struct ExtractedHandle {
    qid: String,
    count: u64,
    estimated: bool,
}

/// Errors the service renders into the page instead of redirecting: the
/// always-present input-error container, or a general error box.
fn body_error(document: &Html) -> Option<Error> {
    for css in ["#client_error_input_message", "div.errorMessage"] {
        if let Some(node) = document.select(&selector(css)).next() {
            let text = node.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                let lowered = text.to_lowercase();
                if lowered.contains("no records") || lowered.contains("did not match") {
                    return Some(Error::NoRecordsFound);
                }
                return Some(Error::RemoteService {
                    key: String::new(),
                    message: text,
                });
            }
        }
    }
    None
}

/// Pull the resultset handle's coordinates out of a results page: the
/// hidden `qid` input and the formatted footer count, whose "approximately"
/// prefix marks an estimate.
fn extract_handle(body: &str) -> Result<ExtractedHandle> {
    let document = Html::parse_document(body);

    if let Some(err) = body_error(&document) {
        return Err(err);
    }

    let qid = document
        .select(&selector(r#"input[name="qid"]"#))
        .next()
        .and_then(|n| n.value().attr("value"))
        .map(str::to_string)
        .ok_or_else(|| Error::RemoteService {
            key: String::new(),
            message: "results page carries no qid input".to_string(),
        })?;

    let formatted = document
        .select(&selector("#footer_formatted_count"))
        .next()
        .map(|n| n.text().collect::<String>())
        .ok_or_else(|| Error::RemoteService {
            key: String::new(),
            message: "results page carries no record count".to_string(),
        })?;
    let formatted = formatted.trim();
    let estimated = formatted.to_lowercase().contains("approximately");
    let count = formatted
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .replace(',', "")
        .parse::<u64>()
        .map_err(|_| Error::RemoteService {
            key: String::new(),
            message: format!("unparseable record count `{}`", formatted),
        })?;

    Ok(ExtractedHandle {
        qid,
        count,
        estimated,
    })
}

/// The export dialog offers four bibliographic field sets to entitled
/// accounts. The dialog lives in a script template, so it needs a second
/// parse; fewer than four options means cited-reference export will come
/// back hollow. Warn, nothing else: the condition is account-level.
fn warn_if_export_restricted(body: &str) {
    let document = Html::parse_document(body);
    let Some(template) = document.select(&selector("#qoContentTemplate")).next() else {
        debug!("no export dialog template on this page");
        return;
    };
    let inner = Html::parse_fragment(&template.text().collect::<String>());
    let options: Vec<String> = inner
        .select(&selector("select#bib_fields option"))
        .map(|o| o.text().collect::<String>().trim().to_string())
        .collect();
    if options.len() != 4 {
        warn!(
            options = options.len(),
            available = %options.join("; "),
            "account does not appear entitled to full citation export"
        );
    }
}

static ACCESSION_RE: OnceLock<regex::Regex> = OnceLock::new();

/// Validate a document accession identifier (`UT` field), e.g.
/// `WOS:000252277600019` or the older `WOS:A1991FE52500003`.
pub fn validate_accession(id: &str) -> Result<()> {
    let re = ACCESSION_RE
        .get_or_init(|| regex::Regex::new(r"^WOS:[0-9A-Z]{15}$").expect("accession pattern parses"));
    if re.is_match(id) {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "`{}` is not a document accession identifier",
            id
        )))
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// An authenticated catalog session: a [`ProxySession`] plus the remote
/// session identifier (`SID`) the catalog assigns, which is distinct from
/// the relay's own cookie and immutable once observed.
pub struct WosSession {
    proxy: ProxySession,
    catalog: CatalogConfig,
    export: ExportConfig,
    sid: Option<String>,
    search_page: Option<String>,
}

impl WosSession {
    pub fn new(proxy: ProxySession, config: &Config) -> Self {
        Self {
            proxy,
            catalog: config.catalog.clone(),
            export: config.export.clone(),
            sid: None,
            search_page: None,
        }
    }

    /// Log in to the relay, then visit the catalog front page like a
    /// browser would to be issued a remote session identifier.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        self.proxy.login(credentials)?;

        let response = self.proxy.get(&self.catalog.front_page)?;
        let final_url = response.url().clone();
        let sid = query_param(&final_url, "SID").ok_or_else(|| Error::RemoteService {
            key: String::new(),
            message: format!("front page landed on {} without a SID", final_url),
        })?;
        self.record_sid(sid)?;
        self.search_page = Some(final_url.to_string());
        debug!(sid = %self.sid.as_deref().unwrap_or(""), "catalog session established");
        Ok(())
    }

    /// Record the remote session identifier. Once set it may only ever be
    /// confirmed; a different value means our cached resultsets are gone.
    fn record_sid(&mut self, sid: String) -> Result<()> {
        match &self.sid {
            None => {
                self.sid = Some(sid);
                Ok(())
            }
            Some(current) if *current == sid => Ok(()),
            Some(current) => Err(Error::SidChanged {
                had: current.clone(),
                saw: sid,
            }),
        }
    }

    /// The remote session identifier, once established.
    pub fn sid(&self) -> Result<&str> {
        self.sid
            .as_deref()
            .ok_or_else(|| Error::State("no catalog session; call login first".to_string()))
    }

    /// URL the front page finally landed on at login; the catalog's search
    /// page for this session.
    pub fn search_page(&self) -> Option<&str> {
        self.search_page.as_deref()
    }

    pub(crate) fn proxy(&self) -> &ProxySession {
        &self.proxy
    }

    pub(crate) fn catalog(&self) -> &CatalogConfig {
        &self.catalog
    }

    pub(crate) fn export_config(&self) -> &ExportConfig {
        &self.export
    }

    /// Submit a general search; the service caches the resultset and this
    /// returns the handle to it.
    pub fn search(&self, query: &SearchQuery) -> Result<ResultSet<'_>> {
        let page = self.submit_search(query)?;
        let extracted = extract_handle(&page.body)?;
        warn_if_export_restricted(&page.body);
        debug!(qid = %extracted.qid, count = extracted.count,
               estimated = extracted.estimated, "search cached");
        Ok(ResultSet::new(
            self,
            ResultSetHandle {
                qid: extracted.qid,
                mode: Mode::GeneralSearch,
                referer: page.final_url.to_string(),
                count: extracted.count,
                estimated: extracted.estimated,
            },
            query.to_string(),
        ))
    }

    /// Convenience topic search.
    pub fn search_topic(&self, topic: &str) -> Result<ResultSet<'_>> {
        self.search(&SearchQuery::new("TS", topic))
    }

    /// Resultset of the references a document cites (its outgoing citation
    /// links). A single specialized lookup; no search form involved.
    pub fn outlinks(&self, document_id: &str) -> Result<ResultSet<'_>> {
        validate_accession(document_id)?;
        let sid = self.sid()?;

        let url = Url::parse_with_params(
            &format!("{}/CitedRefList.do", self.catalog.base),
            &[
                ("product", "WOS"),
                ("search_mode", "CitedRefList"),
                ("action", "search"),
                ("SID", sid),
                ("UT", document_id),
            ],
        )
        .map_err(|e| Error::Config(format!("bad catalog base URL: {}", e)))?;

        let page = self.read_page(self.proxy.get(url.as_str())?)?;
        let extracted = extract_handle(&page.body)?;
        Ok(ResultSet::new(
            self,
            ResultSetHandle {
                qid: extracted.qid,
                mode: Mode::CitedRefList,
                referer: page.final_url.to_string(),
                count: extracted.count,
                estimated: extracted.estimated,
            },
            format!("outlinks {}", document_id),
        ))
    }

    /// Resultset of the articles citing a document (its incoming citation
    /// links). No query parameter reaches the citing-articles view
    /// directly: this searches for the one document, then follows the
    /// citing-articles link off its results page.
    pub fn inlinks(&self, document_id: &str) -> Result<ResultSet<'_>> {
        validate_accession(document_id)?;

        let probe = SearchQuery::new("UT", document_id);
        let page = self.submit_search(&probe)?;

        let href = {
            let document = Html::parse_document(&page.body);
            if let Some(err) = body_error(&document) {
                return Err(err);
            }
            document
                .select(&selector(r#"a[href*="CitingArticles.do"]"#))
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string)
                .ok_or_else(|| Error::RemoteService {
                    key: String::new(),
                    message: format!("no citing-articles link for {}", document_id),
                })?
        };
        let target = page
            .final_url
            .join(&href)
            .map_err(|e| Error::RemoteService {
                key: String::new(),
                message: format!("unresolvable citing-articles link `{}`: {}", href, e),
            })?;

        let citing = self.read_page(self.proxy.get(target.as_str())?)?;
        let extracted = extract_handle(&citing.body)?;
        Ok(ResultSet::new(
            self,
            ResultSetHandle {
                qid: extracted.qid,
                mode: Mode::CitingArticles,
                referer: citing.final_url.to_string(),
                count: extracted.count,
                estimated: extracted.estimated,
            },
            format!("inlinks {}", document_id),
        ))
    }

    fn submit_search(&self, query: &SearchQuery) -> Result<Page> {
        let sid = self.sid()?;
        let url = format!("{}/WOS_GeneralSearch.do", self.catalog.base);
        let referer = format!(
            "{}/WOS_GeneralSearch.do?product=WOS&SID={}&search_mode=GeneralSearch",
            self.catalog.base, sid
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            REFERER,
            referer
                .parse()
                .map_err(|e| Error::Config(format!("bad referer: {}", e)))?,
        );

        let response = self
            .proxy
            .request(Method::POST, &url, headers, Some(query.form(sid)))?;
        self.read_page(response)
    }

    /// Drain a response into a [`Page`], translating redirect-style service
    /// errors on the way.
    fn read_page(&self, response: Response) -> Result<Page> {
        let final_url = response.url().clone();
        inspect_url(&final_url)?;
        let body = response.text()?;
        Ok(Page { final_url, body })
    }

    #[cfg(test)]
    pub(crate) fn test_session(base: &str, sid: &str) -> WosSession {
        use crate::config::RelayConfig;

        let relay = RelayConfig {
            address: "127.0.0.1".to_string(),
            login_url: format!("{}/login", base),
            ..RelayConfig::default()
        };
        let mut proxy = ProxySession::new(relay).expect("test proxy session");
        proxy.force_logged_in("tester");

        let config = Config {
            catalog: CatalogConfig {
                base: base.to_string(),
                front_page: format!("{}/wos", base),
            },
            ..Config::default()
        };
        let mut session = WosSession::new(proxy, &config);
        if !sid.is_empty() {
            session.sid = Some(sid.to_string());
        }
        session
    }

    #[cfg(test)]
    pub(crate) fn test_session_logged_out(base: &str, sid: &str) -> WosSession {
        let mut session = Self::test_session(base, sid);
        let relay = crate::config::RelayConfig {
            address: "127.0.0.1".to_string(),
            ..crate::config::RelayConfig::default()
        };
        session.proxy = ProxySession::new(relay).expect("test proxy session");
        session
    }
}

impl std::fmt::Debug for WosSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WosSession")
            .field("sid", &self.sid)
            .field("proxy", &self.proxy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS_PAGE: &str = r#"<html><body>
<div id="client_error_input_message"> </div>
<form action="/summary.do">
  <input type="hidden" name="qid" value="7"/>
</form>
<span id="footer_formatted_count">1,432</span>
</body></html>"#;

    const ESTIMATED_PAGE: &str = r#"<html><body>
<div id="client_error_input_message"></div>
<input name="qid" value="12"/>
<span id="footer_formatted_count">approximately 22,105</span>
</body></html>"#;

    #[test]
    fn test_extract_handle_exact_count() {
        let handle = extract_handle(RESULTS_PAGE).unwrap();
        assert_eq!(handle.qid, "7");
        assert_eq!(handle.count, 1432);
        assert!(!handle.estimated);
    }

    #[test]
    fn test_extract_handle_estimated_count() {
        let handle = extract_handle(ESTIMATED_PAGE).unwrap();
        assert_eq!(handle.qid, "12");
        assert_eq!(handle.count, 22105);
        assert!(handle.estimated);
    }

    #[test]
    fn test_extract_handle_surfaces_body_error() {
        let page = r#"<html><body>
<div id="client_error_input_message">Search Error: Please enter a search term.</div>
</body></html>"#;
        let err = extract_handle(page).unwrap_err();
        assert!(matches!(err, Error::RemoteService { .. }));
    }

    #[test]
    fn test_extract_handle_maps_no_records_text() {
        let page = r#"<html><body>
<div id="client_error_input_message">Your search did not match any records.</div>
</body></html>"#;
        assert!(matches!(
            extract_handle(page).unwrap_err(),
            Error::NoRecordsFound
        ));
    }

    #[test]
    fn test_error_key_table() {
        assert!(matches!(
            classify_error_key("Server.invalidInput", "range too large"),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            classify_error_key("No_Records_Found", ""),
            Error::NoRecordsFound
        ));
        match classify_error_key("Server.somethingNew", "surprise") {
            Error::RemoteService { key, message } => {
                assert_eq!(key, "Server.somethingNew");
                assert_eq!(message, "surprise");
            }
            other => panic!("expected RemoteService, got {:?}", other),
        }
    }

    #[test]
    fn test_inspect_url_passes_clean_urls() {
        let url = Url::parse("http://apps.webofknowledge.com/summary.do?SID=X&qid=1").unwrap();
        assert!(inspect_url(&url).is_ok());
    }

    #[test]
    fn test_inspect_url_translates_error_redirects() {
        let url = Url::parse(
            "http://apps.webofknowledge.com/error.do?error_display_redirect=yes&error_key=Server.invalidInput&error_message=Bad+range",
        )
        .unwrap();
        assert!(matches!(
            inspect_url(&url).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_validate_accession() {
        assert!(validate_accession("WOS:000252277600019").is_ok());
        assert!(validate_accession("WOS:A1991FE52500003").is_ok());
        assert!(validate_accession("000252277600019").is_err());
        assert!(validate_accession("WOS:00025227760001").is_err());
        assert!(validate_accession("WOS:00025227760001!").is_err());
    }

    #[test]
    fn test_login_extracts_sid_from_redirect() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/login")
            .with_status(200)
            .with_header("set-cookie", "ezproxy=Ticket; path=/")
            .create();
        server
            .mock("GET", "/wos")
            .with_status(302)
            .with_header("location", "/search?SID=4FhguMhJ6eAMjJarZfa&product=WOS")
            .create();
        server
            .mock("GET", mockito::Matcher::Regex("^/search".to_string()))
            .with_status(200)
            .with_body("<html></html>")
            .create();

        let relay = crate::config::RelayConfig {
            address: "127.0.0.1".to_string(),
            login_url: format!("{}/login", server.url()),
            ..crate::config::RelayConfig::default()
        };
        let proxy = ProxySession::new(relay).unwrap();
        let config = Config {
            catalog: CatalogConfig {
                base: server.url(),
                front_page: format!("{}/wos", server.url()),
            },
            ..Config::default()
        };
        let mut session = WosSession::new(proxy, &config);
        session
            .login(&Credentials {
                username: "okeefe".to_string(),
                password: "21234001234567".to_string(),
            })
            .unwrap();
        assert_eq!(session.sid().unwrap(), "4FhguMhJ6eAMjJarZfa");
    }

    #[test]
    fn test_sid_is_immutable_once_set() {
        let mut session = WosSession::test_session("http://127.0.0.1:1", "FIRST");
        assert!(session.record_sid("FIRST".to_string()).is_ok());
        let err = session.record_sid("SECOND".to_string()).unwrap_err();
        assert!(matches!(err, Error::SidChanged { .. }));
        assert_eq!(session.sid().unwrap(), "FIRST");
    }

    #[test]
    fn test_search_before_login_is_a_state_error() {
        let session = WosSession::test_session("http://127.0.0.1:1", "");
        let err = session.search(&SearchQuery::new("TS", "cats")).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_search_returns_general_search_handle() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/WOS_GeneralSearch.do")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("search_mode".into(), "GeneralSearch".into()),
                mockito::Matcher::UrlEncoded("SID".into(), "S1".into()),
                mockito::Matcher::UrlEncoded("value(select1)".into(), "TS".into()),
                mockito::Matcher::UrlEncoded("value(input1)".into(), "cats".into()),
                mockito::Matcher::UrlEncoded("value(bool_1_2)".into(), "OR".into()),
                mockito::Matcher::UrlEncoded("value(select2)".into(), "PY".into()),
                mockito::Matcher::UrlEncoded("editions".into(), "SCI".into()),
            ]))
            .with_status(200)
            .with_body(RESULTS_PAGE)
            .create();

        let session = WosSession::test_session(&server.url(), "S1");
        let query = SearchQuery::new("TS", "cats").or("PY", "2007");
        let results = session.search(&query).unwrap();

        mock.assert();
        assert_eq!(results.handle().mode, Mode::GeneralSearch);
        assert_eq!(results.handle().qid, "7");
        assert_eq!(results.len(), 1432);
        assert!(!results.is_estimated());
        assert_eq!(results.description(), "TS=cats OR PY=2007");
    }

    #[test]
    fn test_outlinks_rejects_bad_accession_without_network() {
        let session = WosSession::test_session("http://127.0.0.1:1", "S1");
        let err = session.outlinks("not-an-id").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_outlinks_returns_cited_ref_handle() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/CitedRefList.do")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("search_mode".into(), "CitedRefList".into()),
                mockito::Matcher::UrlEncoded("UT".into(), "WOS:000252277600019".into()),
                mockito::Matcher::UrlEncoded("SID".into(), "S1".into()),
            ]))
            .with_status(200)
            .with_body(RESULTS_PAGE)
            .create();

        let session = WosSession::test_session(&server.url(), "S1");
        let results = session.outlinks("WOS:000252277600019").unwrap();

        mock.assert();
        assert_eq!(results.handle().mode, Mode::CitedRefList);
        assert_eq!(results.description(), "outlinks WOS:000252277600019");
    }

    #[test]
    fn test_inlinks_follows_citing_articles_link() {
        let mut server = mockito::Server::new();
        let probe_page = r#"<html><body>
<div id="client_error_input_message"></div>
<input name="qid" value="3"/>
<span id="footer_formatted_count">1</span>
<a href="/CitingArticles.do?product=WOS&SID=S1&parentQid=3">42</a>
</body></html>"#;
        let probe = server
            .mock("POST", "/WOS_GeneralSearch.do")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("value(select1)".into(), "UT".into()),
                mockito::Matcher::UrlEncoded(
                    "value(input1)".into(),
                    "WOS:000252277600019".into(),
                ),
            ]))
            .with_status(200)
            .with_body(probe_page)
            .create();
        let citing_page = r#"<html><body>
<div id="client_error_input_message"></div>
<input name="qid" value="4"/>
<span id="footer_formatted_count">42</span>
</body></html>"#;
        let citing = server
            .mock("GET", "/CitingArticles.do")
            .match_query(mockito::Matcher::UrlEncoded("parentQid".into(), "3".into()))
            .with_status(200)
            .with_body(citing_page)
            .create();

        let session = WosSession::test_session(&server.url(), "S1");
        let results = session.inlinks("WOS:000252277600019").unwrap();

        probe.assert();
        citing.assert();
        assert_eq!(results.handle().mode, Mode::CitingArticles);
        assert_eq!(results.handle().qid, "4");
        assert_eq!(results.len(), 42);
    }
}
