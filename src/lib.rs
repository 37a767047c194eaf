//! # wosrip
//!
//! Bulk exporter for Web of Science bibliographic records, reached through
//! an institutional EzProxy relay.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`proxy`]: relay (EzProxy) session layer - host rewriting, login state
//! - [`wos`]: catalog client - searches, resultset handles, bounded export
//!   and resumable bulk export ("rip")
//! - [`records`]: the flat-file record format the exports come back in
//! - [`config`]: configuration management
//!
//! ## Flow
//!
//! Log a [`proxy::ProxySession`] in through a [`wos::WosSession`], search to
//! obtain a [`wos::ResultSet`], rip it to disk, parse the block files with
//! [`records::parse_file`].

pub mod config;
pub mod error;
pub mod proxy;
pub mod records;
pub mod wos;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use proxy::{Credentials, ProxySession};
pub use records::{Record, RecordFile};
pub use wos::{ResultSet, SearchQuery, WosSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
