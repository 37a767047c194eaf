use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use wosrip::config::{load_config, Config};
use wosrip::proxy::{Credentials, ProxySession};
use wosrip::wos::{Operator, SearchQuery, Timespan, WosSession};

/// Export record metadata from the Web of Science through your
/// institution's library proxy
#[derive(Parser, Debug)]
#[command(name = "wosrip")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bulk-export Web of Science records via an EzProxy relay", long_about = None)]
struct Cli {
    /// Enable verbose logging (-v, -vv for more)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output, including the terms-of-service notice
    #[arg(long, short)]
    quiet: bool,

    /// Configuration file (TOML); relay settings live here
    #[arg(long)]
    config: Option<PathBuf>,

    /// Restrict the publication timespan: a preset (ALL, Latest5Years,
    /// YearToDate, 4week, 2week, 1week), a year, or FROM-TO
    #[arg(long)]
    timespan: Option<String>,

    /// Largest record index to export; a cheap guarantee against chewing
    /// through more of the service's data than you meant to
    #[arg(long)]
    limit: Option<u64>,

    /// Directory to rip into (a per-query subdirectory is created)
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Re-export blocks whose files already exist
    #[arg(long)]
    overwrite: bool,

    /// Your proxy username (for Waterloo: your last name)
    user: String,

    /// Your proxy password (for Waterloo: the 14 digit card barcode)
    barcode: String,

    /// Query terms in the form FD=text, where FD is a two-letter field tag
    /// (TS topic, TI title, AU author, PY year, ...). Multiple terms are
    /// ANDed together.
    #[arg(required = true)]
    query: Vec<String>,
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "wosrip=error"
    } else {
        match cli.verbose {
            0 => "wosrip=info",
            1 => "wosrip=debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn tos_notice() {
    eprintln!("In downloading records from the Web of Science, be aware of the terms of service:");
    eprintln!();
    eprintln!(
        "Thomson Reuters determines a \"reasonable amount\" of data to download by comparing your\n\
         download activity against the average annual download rates for all clients using the\n\
         product in question, and an \"insubstantial portion\" to mean an amount of data that (1)\n\
         would not have significant commercial value of its own and (2) would not substitute for\n\
         access to the product for someone without access."
    );
    eprintln!();
    eprintln!("The authors of this software take no responsibility for your use of it.");
    eprintln!();
}

/// Parse `FD=text` command-line terms and AND-join them into a query.
fn build_query(terms: &[String]) -> Result<SearchQuery> {
    let mut parsed = Vec::with_capacity(terms.len());
    for term in terms {
        let (field, text) = term
            .split_once('=')
            .with_context(|| format!("incorrectly formatted query term `{}`", term))?;
        if field.is_empty() || text.is_empty() {
            bail!("incorrectly formatted query term `{}`", term);
        }
        parsed.push((field, text));
    }

    // sorting gives every distinct search one canonical spelling, which
    // keeps resume directories stable across invocations
    parsed.sort();

    let mut query = SearchQuery::new(parsed[0].0, parsed[0].1);
    for (field, text) in &parsed[1..] {
        query = query.push_term(Operator::And, field, text);
    }
    Ok(query)
}

/// Directory name for a query's results, with filesystem-hostile
/// characters flattened.
fn results_dir_name(query: &SearchQuery) -> String {
    query
        .to_string()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '=' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if !cli.quiet {
        tos_notice();
    }

    let config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let mut query = build_query(&cli.query)?;
    if let Some(spec) = &cli.timespan {
        query = query.timespan(Timespan::parse(spec)?);
    }

    let proxy = ProxySession::new(config.relay.clone())?;
    let mut session = WosSession::new(proxy, &config);
    session.login(&Credentials {
        username: cli.user.clone(),
        password: cli.barcode.clone(),
    })?;
    eprintln!("Logged in to the relay as {}.", cli.user);

    eprintln!("Querying for {}", query);
    let results = session.search(&query)?;
    eprintln!(
        "Got {}{} results",
        if results.is_estimated() {
            "an estimated "
        } else {
            ""
        },
        results.len()
    );

    let dir = cli.out_dir.join(results_dir_name(&query));
    eprintln!("Ripping resultset into {}", dir.display());
    let report = results.rip(&dir, cli.overwrite, cli.limit)?;
    eprintln!(
        "Done: {} block(s) exported, {} skipped{}",
        report.exported,
        report.skipped,
        if report.ended_early {
            " (estimated count ran out early)"
        } else {
            ""
        }
    );
    Ok(())
}
