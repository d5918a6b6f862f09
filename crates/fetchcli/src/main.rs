use std::process::ExitCode;

use anyhow::{Context, Result};
use fetch_cache::logging::init_logging;
use fetch_cache::metrics::configure_statsd;
use fetch_cache::{CachedResponse, CachingFetch, HttpTransport};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use settings::Settings;

mod settings;

/// The exit code for `--only-if-cached` requests that missed the cache.
const EXIT_NOT_CACHED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let settings = Settings::get()?;
    let config = &settings.config;
    init_logging(&config.logging);

    if let Some(statsd) = &config.metrics.statsd {
        configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let transport = HttpTransport::new(config.timeouts())?;
    let fetch = CachingFetch::new(config.build_store(), transport, config.cache_options());

    let response = fetch
        .fetch(settings.url.as_str(), settings.init)
        .await
        .with_context(|| format!("failed to fetch {}", settings.url))?;
    let Some(response) = response else {
        eprintln!("not cached: {}", settings.url);
        return Ok(ExitCode::from(EXIT_NOT_CACHED));
    };

    let evictor = response.evictor();
    print_response(response).await?;

    if settings.evict {
        evictor.evict().await.context("failed to evict response")?;
        eprintln!("evicted: {}", evictor.key());
    }

    Ok(ExitCode::SUCCESS)
}

/// Prints the metadata to stderr and streams the body to stdout.
async fn print_response(response: CachedResponse) -> Result<()> {
    eprintln!("from-cache: {}", response.from_cache());
    eprintln!("status: {} {}", response.status(), response.status_text());
    eprintln!("key: {}", response.key());

    let mut stdout = tokio::io::stdout();
    let mut body = response.into_body();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("failed to read response body")?;
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;

    Ok(())
}
