//! Relay (EzProxy) session layer.
//!
//! EzProxy is a proxy for HTTP but not an HTTP proxy in the transparent
//! sense: it rewrites hostnames (`http://host/path` becomes
//! `http://host.relay/path`) and gates everything behind an auth cookie it
//! hands out at login. [`ProxySession`] owns that traversal: every request
//! passes through an ordered pipeline of transform stages (user-agent
//! anonymization, then the relay host rewrite) before dispatch, and a login
//! state machine refuses traffic while logged out - the relay would 302 to
//! its login page, which is only confusing when scripting.

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::RelayConfig;
use crate::error::{Error, Result};

/// Relay credentials. Which form field each half lands in is decided by
/// [`RelayConfig`]; some relays swap the conventional meaning of the two.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Login state machine. `LoggingIn` exists only for the single internal
/// request the login exchange itself issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    LoggingIn,
    LoggedIn,
}

/// Readable cookie store shared between the session and its HTTP client.
///
/// The stock reqwest jar is write-only from the outside, but login success
/// is defined by a named cookie showing up, so the session needs reads. The
/// jar is name->value with no domain scoping: every request this session
/// makes traverses the one relay it was built for.
#[derive(Debug, Default)]
pub struct CookieJar {
    inner: Mutex<HashMap<String, String>>,
}

impl CookieJar {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Value of a cookie, if the relay has set it.
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }
}

impl reqwest::cookie::CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &Url) {
        let mut jar = self.lock();
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else { continue };
            // only the name=value pair matters; attributes are dropped
            let Some(pair) = raw.split(';').next() else { continue };
            if let Some((name, value)) = pair.split_once('=') {
                jar.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        let jar = self.lock();
        if jar.is_empty() {
            return None;
        }
        let header = jar
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

/// A request about to be dispatched, as seen by the transform stages.
pub(crate) struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub form: Option<Vec<(String, String)>>,
}

/// One stage of the outbound pipeline. Stages run in the order the session
/// holds them; each may rewrite the URL, headers, or body.
pub(crate) trait RequestStage: Send + Sync {
    fn apply(&self, request: &mut OutboundRequest) -> Result<()>;
}

/// Pins the user agent to a fixed browser string so requests don't carry a
/// library fingerprint.
struct AnonymizeAgent {
    agent: HeaderValue,
}

impl RequestStage for AnonymizeAgent {
    fn apply(&self, request: &mut OutboundRequest) -> Result<()> {
        request.headers.insert(USER_AGENT, self.agent.clone());
        Ok(())
    }
}

/// Appends the relay's domain suffix to the destination host, and to any
/// `Referer` header. Idempotent: a host already under the relay suffix is
/// left alone, so following links screen-extracted from relayed pages does
/// not stack suffixes.
struct RelayRewrite {
    suffix: String,
}

impl RelayRewrite {
    fn rewrite(&self, url: &Url) -> Result<Url> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidRequest(format!("URL without a host: {}", url)))?;
        if host == self.suffix || host.ends_with(&format!(".{}", self.suffix)) {
            return Ok(url.clone());
        }
        let mut rewritten = url.clone();
        rewritten
            .set_host(Some(&format!("{}.{}", host, self.suffix)))
            .map_err(|e| Error::InvalidRequest(format!("cannot relay {}: {}", url, e)))?;
        Ok(rewritten)
    }
}

impl RequestStage for RelayRewrite {
    fn apply(&self, request: &mut OutboundRequest) -> Result<()> {
        request.url = self.rewrite(&request.url)?;

        if let Some(referer) = request.headers.get(REFERER) {
            let raw = referer
                .to_str()
                .map_err(|e| Error::InvalidRequest(format!("unreadable Referer: {}", e)))?;
            let relayed = self.rewrite(&Url::parse(raw).map_err(|e| {
                Error::InvalidRequest(format!("Referer is not a URL ({}): {}", raw, e))
            })?)?;
            let value = HeaderValue::from_str(relayed.as_str())
                .map_err(|e| Error::InvalidRequest(format!("bad Referer after rewrite: {}", e)))?;
            request.headers.insert(REFERER, value);
        }
        Ok(())
    }
}

/// An authenticated traversal of one institutional relay.
///
/// Holds the HTTP client (timeout and certificate policy fixed at
/// construction), the readable cookie jar, the transform pipeline, and the
/// login state. Not for concurrent use: one session per logical flow.
pub struct ProxySession {
    client: Client,
    jar: Arc<CookieJar>,
    stages: Vec<Box<dyn RequestStage>>,
    state: LoginState,
    identity: Option<String>,
    config: RelayConfig,
}

impl ProxySession {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let jar = Arc::new(CookieJar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;

        let agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| Error::Config(format!("invalid user agent: {}", e)))?;

        let stages: Vec<Box<dyn RequestStage>> = vec![
            Box::new(AnonymizeAgent { agent }),
            Box::new(RelayRewrite {
                suffix: config.address.clone(),
            }),
        ];

        Ok(Self {
            client,
            jar,
            stages,
            state: LoginState::LoggedOut,
            identity: None,
            config,
        })
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Username of the authenticated account, once logged in.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Read a cookie out of the shared jar.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.jar.get(name)
    }

    /// Perform the relay's login exchange.
    ///
    /// Success means a 2xx response that left the configured auth cookie in
    /// the jar. On any failure the state rolls back to logged-out.
    pub fn login(&mut self, credentials: &Credentials) -> Result<()> {
        match self.state {
            LoginState::LoggedOut => {}
            LoginState::LoggingIn => {
                return Err(Error::State("login already in progress".to_string()))
            }
            LoginState::LoggedIn => {
                return Err(Error::State("already logged in to the relay".to_string()))
            }
        }

        self.state = LoginState::LoggingIn;
        let form = vec![
            (
                self.config.user_field.clone(),
                credentials.username.clone(),
            ),
            (
                self.config.pass_field.clone(),
                credentials.password.clone(),
            ),
        ];
        let login_url = self.config.login_url.clone();

        let outcome = self.dispatch(Method::POST, &login_url, HeaderMap::new(), Some(form));
        match outcome {
            Ok(_) if self.jar.contains(&self.config.auth_cookie) => {
                self.state = LoginState::LoggedIn;
                self.identity = Some(credentials.username.clone());
                debug!(relay = %self.config.address, user = %credentials.username,
                       "relay session established");
                Ok(())
            }
            Ok(_) => {
                self.state = LoginState::LoggedOut;
                Err(Error::Authentication(format!(
                    "login response did not set the `{}` cookie",
                    self.config.auth_cookie
                )))
            }
            Err(e) => {
                self.state = LoginState::LoggedOut;
                Err(Error::Authentication(e.to_string()))
            }
        }
    }

    /// GET through the relay.
    pub fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, HeaderMap::new(), None)
    }

    /// Form-encoded POST through the relay. The body is a list of pairs,
    /// not a map: the catalog's forms repeat parameter names.
    pub fn post_form(
        &self,
        url: &str,
        headers: HeaderMap,
        form: Vec<(String, String)>,
    ) -> Result<Response> {
        self.request(Method::POST, url, headers, Some(form))
    }

    /// Dispatch a request through the transform pipeline. Requires a
    /// logged-in session; fails without touching the network otherwise.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        form: Option<Vec<(String, String)>>,
    ) -> Result<Response> {
        if self.state != LoginState::LoggedIn {
            return Err(Error::NotAuthenticated);
        }
        self.dispatch(method, url, headers, form)
    }

    fn dispatch(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        form: Option<Vec<(String, String)>>,
    ) -> Result<Response> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidRequest(format!("bad URL `{}`: {}", url, e)))?;
        let mut outbound = OutboundRequest {
            method,
            url,
            headers,
            form,
        };
        for stage in &self.stages {
            stage.apply(&mut outbound)?;
        }

        debug!(method = %outbound.method, url = %outbound.url, "dispatching");
        let mut builder = self
            .client
            .request(outbound.method, outbound.url)
            .headers(outbound.headers);
        if let Some(form) = &outbound.form {
            builder = builder.form(form);
        }
        let response = builder.send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "HTTP {} from {}",
                status,
                response.url()
            )));
        }
        Ok(response)
    }

    #[cfg(test)]
    pub(crate) fn force_logged_in(&mut self, identity: &str) {
        self.state = LoginState::LoggedIn;
        self.identity = Some(identity.to_string());
    }
}

impl fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySession")
            .field("relay", &self.config.address)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_config(address: &str, login_url: &str) -> RelayConfig {
        RelayConfig {
            address: address.to_string(),
            login_url: login_url.to_string(),
            ..RelayConfig::default()
        }
    }

    fn creds() -> Credentials {
        Credentials {
            username: "okeefe".to_string(),
            password: "21234001234567".to_string(),
        }
    }

    #[test]
    fn test_rewrite_appends_relay_suffix() {
        let stage = RelayRewrite {
            suffix: "proxy.lib.uwaterloo.ca".to_string(),
        };
        let url = Url::parse("http://apps.webofknowledge.com/WOS_GeneralSearch.do?x=1").unwrap();
        let out = stage.rewrite(&url).unwrap();
        assert_eq!(
            out.as_str(),
            "http://apps.webofknowledge.com.proxy.lib.uwaterloo.ca/WOS_GeneralSearch.do?x=1"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let stage = RelayRewrite {
            suffix: "proxy.lib.uwaterloo.ca".to_string(),
        };
        let url = Url::parse("http://apps.webofknowledge.com/summary.do").unwrap();
        let once = stage.rewrite(&url).unwrap();
        let twice = stage.rewrite(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_leaves_relay_itself_alone() {
        let stage = RelayRewrite {
            suffix: "127.0.0.1".to_string(),
        };
        let url = Url::parse("http://127.0.0.1:8080/login").unwrap();
        assert_eq!(stage.rewrite(&url).unwrap(), url);
    }

    #[test]
    fn test_rewrite_covers_referer_header() {
        let stage = RelayRewrite {
            suffix: "subzero.lib.uoguelph.ca".to_string(),
        };
        let mut request = OutboundRequest {
            method: Method::GET,
            url: Url::parse("http://apps.webofknowledge.com/a").unwrap(),
            headers: HeaderMap::new(),
            form: None,
        };
        request.headers.insert(
            REFERER,
            HeaderValue::from_static("http://apps.webofknowledge.com/b"),
        );
        stage.apply(&mut request).unwrap();
        assert_eq!(
            request.headers.get(REFERER).unwrap().to_str().unwrap(),
            "http://apps.webofknowledge.com.subzero.lib.uoguelph.ca/b"
        );
    }

    #[test]
    fn test_cookie_jar_parses_set_cookie() {
        use reqwest::cookie::CookieStore;

        let jar = CookieJar::default();
        let url = Url::parse("http://login.proxy.example.edu/login").unwrap();
        let headers = [HeaderValue::from_static(
            "ezproxy=AbCdEf123; path=/; HttpOnly",
        )];
        jar.set_cookies(&mut headers.iter(), &url);

        assert_eq!(jar.get("ezproxy").as_deref(), Some("AbCdEf123"));
        let sent = jar.cookies(&url).unwrap();
        assert_eq!(sent.to_str().unwrap(), "ezproxy=AbCdEf123");
    }

    #[test]
    fn test_request_while_logged_out_is_refused() {
        // no server anywhere; the state check must fire before any I/O
        let session =
            ProxySession::new(relay_config("127.0.0.1", "http://127.0.0.1:1/login")).unwrap();
        let err = session.get("http://apps.webofknowledge.com/wos").unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
    }

    #[test]
    fn test_login_success_sets_state_and_cookie() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/login")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("user".into(), "okeefe".into()),
                mockito::Matcher::UrlEncoded("pass".into(), "21234001234567".into()),
            ]))
            .with_status(200)
            .with_header("set-cookie", "ezproxy=SessionTicket42; path=/")
            .create();

        let mut session = ProxySession::new(relay_config(
            "127.0.0.1",
            &format!("{}/login", server.url()),
        ))
        .unwrap();
        session.login(&creds()).unwrap();

        mock.assert();
        assert_eq!(session.state(), LoginState::LoggedIn);
        assert_eq!(session.identity(), Some("okeefe"));
        assert_eq!(session.cookie("ezproxy").as_deref(), Some("SessionTicket42"));
    }

    #[test]
    fn test_login_respects_swapped_field_names() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/login")
            // Waterloo-style: username travels under `pass`
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("pass".into(), "okeefe".into()),
                mockito::Matcher::UrlEncoded("user".into(), "21234001234567".into()),
            ]))
            .with_status(200)
            .with_header("set-cookie", "ezproxy=T; path=/")
            .create();

        let mut config = relay_config("127.0.0.1", &format!("{}/login", server.url()));
        config.user_field = "pass".to_string();
        config.pass_field = "user".to_string();

        let mut session = ProxySession::new(config).unwrap();
        session.login(&creds()).unwrap();
        mock.assert();
    }

    #[test]
    fn test_login_without_auth_cookie_rolls_back() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/login")
            .with_status(200)
            .with_body("wrong barcode")
            .create();

        let mut session = ProxySession::new(relay_config(
            "127.0.0.1",
            &format!("{}/login", server.url()),
        ))
        .unwrap();

        let err = session.login(&creds()).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(session.state(), LoginState::LoggedOut);

        // and the session stays unusable
        let err = session.get("http://apps.webofknowledge.com/wos").unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
    }

    #[test]
    fn test_login_http_failure_rolls_back() {
        let mut server = mockito::Server::new();
        server.mock("POST", "/login").with_status(503).create();

        let mut session = ProxySession::new(relay_config(
            "127.0.0.1",
            &format!("{}/login", server.url()),
        ))
        .unwrap();

        let err = session.login(&creds()).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert_eq!(session.state(), LoginState::LoggedOut);
    }

    #[test]
    fn test_login_twice_is_a_state_error() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/login")
            .with_status(200)
            .with_header("set-cookie", "ezproxy=T; path=/")
            .create();

        let mut session = ProxySession::new(relay_config(
            "127.0.0.1",
            &format!("{}/login", server.url()),
        ))
        .unwrap();
        session.login(&creds()).unwrap();

        let err = session.login(&creds()).unwrap_err();
        assert!(matches!(err, Error::State(_)));
        // the failed second login must not disturb the live session
        assert_eq!(session.state(), LoginState::LoggedIn);
    }
}
