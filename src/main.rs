use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod catalog;
mod cli;
mod config;
mod images;
mod lock;
mod recommend;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use catalog::{Catalog, ExportCatalog, HttpCatalog};
use cli::{QueryArgs, SearchInput};
use config::Config;
use images::HttpImageFetcher;
use recommend::{RecommendOptions, RecommendationService, VisualQuery};
use semantic::{ClipEncoder, EncoderPool, Snapshot};

const DEFAULT_LOG_FILTER: &str = "lookalike=info,tower_http=info";

fn open_catalog(config: &Config, export: Option<&Path>) -> anyhow::Result<Arc<dyn Catalog>> {
    match export {
        Some(path) => Ok(Arc::new(ExportCatalog::open(
            path,
            config.catalog.image_url_template.as_deref(),
        )?)),
        None => Ok(Arc::new(HttpCatalog::new(
            &config.catalog.base_url,
            Duration::from_secs(config.catalog.timeout_secs),
        )?)),
    }
}

fn encoder_pool(config: &Config) -> anyhow::Result<Arc<EncoderPool>> {
    let encoder = ClipEncoder::new(&config.encoder, config.models_dir())
        .context("failed to initialize encoder")?;
    let fetcher = HttpImageFetcher::new(Duration::from_secs(config.catalog.fetch_timeout_secs))?;

    let pool = EncoderPool::new(
        Arc::new(encoder),
        Arc::new(fetcher),
        config.encoder.worker_count(),
        Duration::from_millis(config.encoder.timeout_ms),
        config.retrieval.cache_capacity,
    )?;

    Ok(Arc::new(pool))
}

fn options(query: &QueryArgs) -> RecommendOptions {
    RecommendOptions {
        min_similarity: query.min_similarity,
        ..Default::default()
    }
}

fn visual_query(input: SearchInput) -> anyhow::Result<VisualQuery> {
    if let Some(path) = input.image {
        let bytes = std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(VisualQuery::Image(bytes));
    }
    if let Some(url) = input.url {
        return Ok(VisualQuery::ImageUrl(url));
    }
    Ok(VisualQuery::Text(input.text.unwrap_or_default()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let catalog = open_catalog(&config, args.export.as_deref())?;
    let pool = encoder_pool(&config)?;

    let service = || {
        let encoder = pool.encoder();
        let snapshot =
            Snapshot::load_from_dir(&config.data_dir(), &encoder.model_id(), encoder.dimensions());
        RecommendationService::new(catalog.clone(), pool.clone(), snapshot, &config)
    };

    match args.command {
        cli::Command::Build { limit, quiet } => {
            let summary =
                semantic::build::run(catalog.as_ref(), limit, &pool, &config.data_dir(), !quiet)?;
            print_json(&summary)
        }

        cli::Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            web::start_daemon(Arc::new(service()?), listen)
        }

        cli::Command::Similar {
            id,
            query,
            any_category,
        } => {
            let options = RecommendOptions {
                same_category_only: any_category.then_some(false),
                ..options(&query)
            };
            print_json(&service()?.similar_by_product(&id, query.limit, &options)?)
        }

        cli::Command::Search { input, query } => {
            let visual = visual_query(input)?;
            print_json(&service()?.similar_by_image(visual, None, query.limit, &options(&query))?)
        }

        cli::Command::Personalized { ids, query } => {
            print_json(&service()?.personalized(&ids, None, query.limit, &options(&query))?)
        }

        cli::Command::Batch { ids, query } => {
            print_json(&service()?.batch(&ids, query.limit, &options(&query))?)
        }

        cli::Command::Stats {} => print_json(&service()?.stats()),
    }
}
