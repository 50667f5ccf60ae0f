mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use vidshelf::vs_core::config::Config;
use vidshelf::vs_core::events::EventBus;
use vidshelf::vs_core::{JobStatus, MediaId, NewJob, SourceId};
use vidshelf::vs_jobs::{FetcherRegistry, JobOrchestrator};
use vidshelf::vs_library::{FfmpegTranscoder, Library};
use vidshelf::{open_db, Service};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise the verbose flag picks the defaults.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "vidshelf=trace,vs_library=debug,vs_jobs=debug,vs_db=debug,vs_core=debug".to_string()
        } else {
            "vidshelf=info,vs_library=info,vs_jobs=info,vs_db=warn".to_string()
        }
    });

    // Logs go to stderr so command output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run => {
            let config = Config::load_or_default(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let service = Service::start(config).await?;
                service.run_until_shutdown().await?;
                Ok::<(), anyhow::Error>(())
            })
        }
        Commands::Scan { source } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(scan(cli.config.as_deref(), source))
        }
        Commands::List { source, json } => list(cli.config.as_deref(), source, json),
        Commands::Search { query, json } => search(cli.config.as_deref(), &query, json),
        Commands::Jobs { kind, status } => list_jobs(cli.config.as_deref(), kind, status),
        Commands::Fetch {
            kind,
            source,
            target,
            url,
            params,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(fetch(cli.config.as_deref(), kind, source, target, url, params))
        }
        Commands::Convert { media_id } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(convert(cli.config.as_deref(), &media_id))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("vidshelf {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Load the config and the persisted catalog without starting any
/// background tasks.
fn open_library(config_path: Option<&Path>) -> Result<(Config, Arc<Library>)> {
    let config = Config::load_or_default(config_path);
    let db = open_db(&config)?;
    let library = Library::open(&config, db, Arc::new(EventBus::default()))?;
    Ok((config, Arc::new(library)))
}

async fn scan(config_path: Option<&Path>, source: Option<String>) -> Result<()> {
    let (_, library) = open_library(config_path)?;

    let summary = match source {
        Some(id) => {
            let result = library.rescan_source(&SourceId::from(id)).await?;
            vidshelf::vs_library::RescanSummary {
                completed: vec![result],
                failed: Vec::new(),
            }
        }
        None => library.rescan_all().await,
    };

    for done in &summary.completed {
        print!(
            "{}: +{} ~{} -{}",
            done.source_id, done.added, done.updated, done.removed
        );
        if done.unreadable > 0 {
            print!(" ({} unreadable, removals skipped)", done.unreadable);
        }
        println!();
    }
    for failed in &summary.failed {
        println!("{}: FAILED ({})", failed.source_id, failed.message);
    }
    println!("\n{} entries in catalog", library.catalog().len());

    if !summary.failed.is_empty() {
        anyhow::bail!("{} source(s) could not be scanned", summary.failed.len());
    }
    Ok(())
}

fn list(config_path: Option<&Path>, source: Option<String>, json: bool) -> Result<()> {
    let (_, library) = open_library(config_path)?;
    let source = source.map(SourceId::from);
    let items = library.list_items(source.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for item in &items {
        let mut flags = String::new();
        if item.position_secs > 0.0 {
            flags.push_str(&format!(" @{:.0}s", item.position_secs));
        }
        if !item.can_play_directly {
            flags.push_str(" [needs conversion]");
        }
        println!(
            "{}  {}/{}  {} bytes{}",
            item.entry.id, item.entry.source_id, item.entry.rel_path, item.entry.size_bytes, flags
        );
    }
    println!("\n{} entries", items.len());
    Ok(())
}

fn search(config_path: Option<&Path>, query: &str, json: bool) -> Result<()> {
    let (_, library) = open_library(config_path)?;
    let hits = library.catalog().search(query);

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    for entry in &hits {
        println!("{}  {}/{}  {}", entry.id, entry.source_id, entry.rel_path, entry.title);
    }
    println!("\n{} matches", hits.len());
    Ok(())
}

fn list_jobs(config_path: Option<&Path>, kind: Option<String>, status: Option<String>) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let db = open_db(&config)?;
    let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
    let conn = vidshelf::vs_db::pool::get_conn(&db)?;
    let jobs = vidshelf::vs_db::queries::jobs::list_jobs(
        &conn,
        kind.as_deref(),
        status,
        vidshelf::vs_jobs::orchestrator::LIST_LIMIT,
    )?;

    for job in &jobs {
        let name = job.display_name.as_deref().unwrap_or(&job.target_rel_path);
        print!(
            "{}  {:<8} {:<7} {:>5.1}%  {}/{}",
            job.id, job.kind, job.status, job.progress_percent, job.source_id, name
        );
        if let Some(ref error) = job.error_message {
            print!("  ({error})");
        }
        println!();
    }
    println!("\n{} jobs", jobs.len());
    Ok(())
}

async fn fetch(
    config_path: Option<&Path>,
    kind: String,
    source: String,
    target: String,
    url: Option<String>,
    params: Vec<String>,
) -> Result<()> {
    let config = Config::load_or_default(config_path);
    let db = open_db(&config)?;
    let library = Arc::new(Library::open(&config, db.clone(), Arc::new(EventBus::default()))?);
    let fetchers = FetcherRegistry::from_config(&config.fetchers)?;
    let jobs = JobOrchestrator::new(db, library, fetchers, config.jobs.clone());

    let mut map = serde_json::Map::new();
    if let Some(url) = url {
        map.insert("url".into(), url.into());
    }
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("parameter '{param}' is not KEY=VALUE"))?;
        map.insert(key.to_string(), value.into());
    }

    let job = jobs.submit(NewJob {
        kind,
        source_id: SourceId::from(source),
        target_rel_path: target,
        display_name: None,
        params: serde_json::Value::Object(map),
    })?;
    println!("Job {} queued", job.id);

    let mut last_shown = -1.0;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let job = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopping job...");
                break jobs.stop(job.id).await?;
            }
            _ = ticker.tick() => {
                let current = jobs.get_job(job.id)?;
                if current.status.is_terminal() {
                    break current;
                }
                if current.progress_percent != last_shown {
                    last_shown = current.progress_percent;
                    println!(
                        "{:>5.1}%  {}",
                        current.progress_percent,
                        current.phase.as_deref().unwrap_or("")
                    );
                }
            }
        }
    };

    match job.status {
        JobStatus::Done => {
            println!("Done: {}/{}", job.source_id, job.target_rel_path);
            if let Some(media_id) = job.result_media_id {
                println!("Media id: {media_id}");
            }
            Ok(())
        }
        status => anyhow::bail!(
            "job {} ended {}: {}",
            job.id,
            status,
            job.error_message.as_deref().unwrap_or("no error recorded")
        ),
    }
}

async fn convert(config_path: Option<&Path>, media_id: &str) -> Result<()> {
    let (config, library) = open_library(config_path)?;
    let transcoder = FfmpegTranscoder::discover(&config.transcode)?;
    let outcome = library
        .convert_media(&MediaId::from(media_id), &transcoder)
        .await?;
    println!("{}", outcome.message);
    println!("Output: {}", outcome.output_path.display());
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("✓ Configuration parsed");
    println!("  Sources: {}", config.library.sources.len());
    for source in &config.library.sources {
        println!("    {} -> {}", source.id, source.root_path.display());
    }
    println!("  Extensions: {}", config.library.extensions.join(" "));
    println!("  Watch enabled: {}", config.watch.enabled);
    println!("  Database: {}", config.state.db_path.display());
    println!("  Command fetchers: {}", config.fetchers.commands.len());

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ No warnings");
    } else {
        println!("\n{} warning(s):", warnings.len());
        for warning in &warnings {
            println!("  - {warning}");
        }
    }
    Ok(())
}
