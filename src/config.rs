//! Configuration management.
//!
//! Everything relay- or service-specific lives here: the relay's domain
//! suffix and login exchange, which form fields carry the credentials, the
//! catalog endpoints, and export options. Values come from an optional TOML
//! file layered under `WOSRIP_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Institutional relay (EzProxy) settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Catalog service endpoints
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Export defaults
    #[serde(default)]
    pub export: ExportConfig,
}

/// Settings for one EzProxy installation.
///
/// The credential field names are per-relay: the stock install posts the
/// username under `user` and the password under `pass`, but some relays
/// swap the two (Waterloo expects the last name under `pass` and the card
/// barcode under `user`). `user_field` always names the form key that
/// receives [`crate::proxy::Credentials::username`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Domain suffix appended to every target host
    #[serde(default = "default_relay_address")]
    pub address: String,

    /// Login endpoint. The default is deliberately host-less; the relay
    /// rewrite stage completes it, same as any other request.
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Form key that carries the username
    #[serde(default = "default_user_field")]
    pub user_field: String,

    /// Form key that carries the password
    #[serde(default = "default_pass_field")]
    pub pass_field: String,

    /// Name of the cookie whose presence marks a successful login
    #[serde(default = "default_auth_cookie")]
    pub auth_cookie: String,

    /// Some relays serve expired or self-signed certificates. Opting out of
    /// verification must be explicit, never assumed.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Per-session request timeout, applied to every request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent presented to the relay and the catalog
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: default_relay_address(),
            login_url: default_login_url(),
            user_field: default_user_field(),
            pass_field: default_pass_field(),
            auth_cookie: default_auth_cookie(),
            accept_invalid_certs: false,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_relay_address() -> String {
    "proxy.lib.uwaterloo.ca".to_string()
}

fn default_login_url() -> String {
    "https://login/login".to_string()
}

fn default_user_field() -> String {
    "user".to_string()
}

fn default_pass_field() -> String {
    "pass".to_string()
}

fn default_auth_cookie() -> String {
    "ezproxy".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    // a plain desktop browser string; the catalog serves degraded pages to
    // anything that looks like a script
    "Mozilla/5.0 (X11; Linux x86_64; rv:36.0) Gecko/20100101 Firefox/36.0".to_string()
}

/// Catalog service endpoints. The service is reverse-engineered and drifts;
/// keeping the URLs in configuration beats recompiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the search/export application
    #[serde(default = "default_catalog_base")]
    pub base: String,

    /// Front page visited after login to obtain the remote session id
    #[serde(default = "default_front_page")]
    pub front_page: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base: default_catalog_base(),
            front_page: default_front_page(),
        }
    }
}

fn default_catalog_base() -> String {
    "http://apps.webofknowledge.com".to_string()
}

fn default_front_page() -> String {
    "http://isiknowledge.com/wos".to_string()
}

/// Export defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Locale sent with every export request
    #[serde(default = "default_locale")]
    pub locale: String,

    /// Database editions searched by default
    #[serde(default = "default_editions")]
    pub editions: Vec<String>,

    /// Default result ordering, in the service's own sort notation:
    /// `{field}.{A|D}` clauses separated by `;`, earlier clauses win
    #[serde(default = "default_sort")]
    pub sort: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            editions: default_editions(),
            sort: default_sort(),
        }
    }
}

fn default_locale() -> String {
    "en_US".to_string()
}

fn default_editions() -> Vec<String> {
    ["SCI", "SSCI", "AHCI", "ISTP", "ISSHP"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

fn default_sort() -> String {
    // most cited, oldest first: the records you care about when bulk
    // exporting are at the front if the rip gets cut short
    "LC.D;PY.A;LD.D;SO.A;VL.D;PG.A;AU.A".to_string()
}

/// Load configuration from a file, layered under `WOSRIP_*` environment
/// variables (e.g. `WOSRIP_RELAY__ADDRESS`).
pub fn load_config(path: &Path) -> Result<Config, config::ConfigError> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("WOSRIP").separator("__"))
        .build()?;

    settings.try_deserialize()
}
