use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fetch_cache::RequestInit;
use fetch_cache::config::Config;
use tracing::level_filters::LevelFilter;

/// Fetches a URL through a response cache.
///
/// Response metadata is printed to stderr, the body is written to stdout.
///
/// Responses are cached in memory unless a cache directory is given, either via
/// `--cache-dir` or the `cache_dir` option of the configuration file.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// The URL to fetch.
    pub url: String,

    /// The request method.
    #[arg(long, short = 'X', default_value = "GET")]
    pub method: String,

    /// A request header in the form `Name: value`. Can be repeated.
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// A text body to send with the request.
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Only answer from the cache, never go to the network.
    ///
    /// Exits with status 2 if the response is not cached.
    #[arg(long)]
    pub only_if_cached: bool,

    /// Remove the response from the cache after printing it.
    #[arg(long)]
    pub evict: bool,

    /// Path to a YAML configuration file.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// A directory for a persistent cache, overriding the configuration file.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// How long responses stay cached, e.g. `10m`. Overrides the configuration file.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub ttl: Option<Duration>,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long)]
    pub log_level: Option<LevelFilter>,
}

#[derive(Debug)]
pub struct Settings {
    pub url: String,
    pub init: RequestInit,
    pub evict: bool,
    pub config: Config,
}

impl Settings {
    pub fn get() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = Config::get(cli.config.as_deref()).context("invalid configuration")?;
        if let Some(cache_dir) = cli.cache_dir {
            config.cache_dir = Some(cache_dir);
        }
        if let Some(ttl) = cli.ttl {
            config.ttl = Some(ttl);
        }
        if let Some(level) = cli.log_level {
            config.logging.level = level;
        }

        let mut init = RequestInit::default().method(cli.method);
        for header in &cli.headers {
            let (name, value) = parse_header(header)?;
            init = init.header(name, value);
        }
        if cli.only_if_cached {
            init = init.header("Cache-Control", "only-if-cached");
        }
        if let Some(data) = cli.data {
            init = init.body(data);
        }
        init.transport.timeout = Some(config.timeout);

        Ok(Self {
            url: cli.url,
            init,
            evict: cli.evict,
            config,
        })
    }
}

fn parse_header(header: &str) -> Result<(&str, &str)> {
    let Some((name, value)) = header.split_once(':') else {
        bail!("invalid header `{header}`, expected `Name: value`");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("invalid header `{header}`, the name is empty");
    }
    Ok((name, value.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(parse_header("Accept: text/plain").unwrap(), ("Accept", "text/plain"));
        assert_eq!(parse_header("x-empty:").unwrap(), ("x-empty", ""));
        assert_eq!(parse_header("a: b: c").unwrap(), ("a", "b: c"));
        assert!(parse_header("no colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_cli_args() {
        let cli = Cli::try_parse_from([
            "fetchcli",
            "https://example.com",
            "-X",
            "POST",
            "-H",
            "Accept: text/plain",
            "-H",
            "X-Other: 1",
            "--ttl",
            "5m",
            "--log-level",
            "debug",
            "--only-if-cached",
        ])
        .unwrap();

        assert_eq!(cli.url, "https://example.com");
        assert_eq!(cli.method, "POST");
        assert_eq!(cli.headers.len(), 2);
        assert_eq!(cli.ttl, Some(Duration::from_secs(300)));
        assert_eq!(cli.log_level, Some(LevelFilter::DEBUG));
        assert!(cli.only_if_cached);
        assert!(!cli.evict);
    }
}
