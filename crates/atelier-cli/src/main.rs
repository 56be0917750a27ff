//! Command-line driver for the batch pipeline
//!
//! Runs batches against the configured generation endpoint with local
//! filesystem storage under `--state-dir`:
//!
//! ```text
//! <state-dir>/objects/    durable outputs
//! <state-dir>/sessions/   session snapshots
//! <state-dir>/cache/      local source cache
//! ```

use anyhow::{bail, Context, Result};
use atelier_asset::{mime_for_extension, Payload, UserId};
use atelier_core::{
    BatchOrchestrator, BatchReport, Collaborators, CreditLedgerGateway, ItemId, ItemStatus,
    MemoryCreditService, PipelineConfig, RestoreReport,
};
use atelier_gen::{GenerationAdapter, GenerationBackend, GenerationMode, HttpBackend};
use atelier_store::{DurableAssetStore, FileSnapshotBackend, FsObjectStorage, LocalCache};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("atelier")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Resumable, credit-gated batch image generation")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Pipeline configuration file (TOML)"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .global(true)
                .default_value("local")
                .help("User namespace for storage and snapshots"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .default_value(".atelier")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding objects, snapshots and cache"),
        )
        .arg(
            Arg::new("credits")
                .long("credits")
                .global(true)
                .default_value("100")
                .value_parser(value_parser!(u64))
                .help("Starting credit balance of the local account"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("run")
                .about("Queue images and process every pending item")
                .arg(
                    Arg::new("images")
                        .num_args(0..)
                        .value_parser(value_parser!(PathBuf))
                        .help("Source images, or directories of images, to add before running"),
                )
                .arg(
                    Arg::new("views")
                        .long("views")
                        .value_parser(value_parser!(u8))
                        .help("Catalog mode with this many views per item"),
                ),
        )
        .subcommand(Command::new("status").about("Show the restored batch"))
        .subcommand(
            Command::new("retry")
                .about("Re-run one failed item")
                .arg(Arg::new("item").required(true).help("Item id")),
        )
        .subcommand(
            Command::new("urls")
                .about("Print access URLs for an item's outputs")
                .arg(Arg::new("item").required(true).help("Item id")),
        )
        .subcommand(Command::new("reset").about("Clear the batch and its snapshot"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<PipelineConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(PipelineConfig::new()),
    }
}

fn build_adapter(config: &PipelineConfig) -> Result<GenerationAdapter> {
    let generation = &config.generation;
    let Ok(api_key) = std::env::var(&generation.api_key_env) else {
        tracing::warn!(
            env = %generation.api_key_env,
            "no API key set, generation is disabled"
        );
        return Ok(GenerationAdapter::new(Vec::new()));
    };
    let timeout = Duration::from_secs(generation.request_timeout_secs);
    let backends = generation
        .models
        .iter()
        .map(|model| {
            HttpBackend::new(&generation.endpoint, model.as_str(), api_key.as_str(), timeout)
                .map(|b| Arc::new(b) as Arc<dyn GenerationBackend>)
        })
        .collect::<Result<Vec<_>, _>>()
        .context("configuring generation backends")?;
    Ok(GenerationAdapter::new(backends))
}

fn build_orchestrator(
    matches: &ArgMatches,
    config: PipelineConfig,
) -> Result<BatchOrchestrator> {
    let state_dir = matches
        .get_one::<PathBuf>("state-dir")
        .context("missing --state-dir")?;
    let user = UserId::new(
        matches
            .get_one::<String>("user")
            .context("missing --user")?
            .as_str(),
    )?;
    let credits = *matches.get_one::<u64>("credits").context("missing --credits")?;
    let secret = std::env::var("ATELIER_URL_SECRET").unwrap_or_else(|_| "atelier-local".into());

    let cache_dir = config
        .local_cache_dir
        .clone()
        .unwrap_or_else(|| state_dir.join("cache"));
    let parts = Collaborators {
        adapter: build_adapter(&config)?,
        ledger: CreditLedgerGateway::new(Arc::new(MemoryCreditService::new(credits)), user.clone()),
        store: DurableAssetStore::new(
            Arc::new(FsObjectStorage::new(state_dir.join("objects"), &secret)),
            user,
            config.feature,
        ),
        cache: LocalCache::with_spill_dir(config.local_cache_capacity_bytes, cache_dir),
        snapshots: Arc::new(FileSnapshotBackend::new(state_dir.join("sessions"))),
    };
    Ok(BatchOrchestrator::new(config, parts))
}

fn read_image(path: &Path) -> Result<Payload> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let Some(mime) = mime_for_extension(ext) else {
        bail!("unsupported image type: {}", path.display());
    };
    Ok(Payload::new(bytes, mime))
}

/// Expand directories into the image files they contain, sorted by name
fn collect_images(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries = std::fs::read_dir(path)
                .with_context(|| format!("listing {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .and_then(mime_for_extension)
                        .is_some()
                })
                .collect::<Vec<_>>();
            entries.sort();
            out.extend(entries);
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

fn parse_item(args: &ArgMatches) -> Result<ItemId> {
    let raw = args.get_one::<String>("item").context("missing item id")?;
    raw.parse()
        .with_context(|| format!("invalid item id: {raw}"))
}

fn print_restore(report: &RestoreReport) {
    if report.restored > 0 {
        println!(
            "Restored {} item(s), {} reset to queued, {} need re-upload",
            report.restored,
            report.reset.len(),
            report.missing_sources.len()
        );
    }
}

fn print_report(report: &BatchReport) {
    println!("Batch Report:");
    println!("  Succeeded: {}", report.succeeded.len());
    println!("  Failed: {}", report.failed.len());
    println!("  Deferred: {}", report.deferred.len());
    println!("  Billing issues: {}", report.billing_issues.len());
    println!("  Credits debited: {}", report.credits_debited);
}

fn print_items(orchestrator: &BatchOrchestrator) {
    let items = orchestrator.items();
    if items.is_empty() {
        println!("No items.");
        return;
    }
    for item in items {
        println!("{}  {:<10}", item.id, item.status);
        for output in &item.results {
            println!("    {} ({})", output.reference, output.category);
        }
        if let Some(error) = &item.error {
            println!("    error: {error}");
        }
        if let Some(issue) = &item.billing_issue {
            println!("    billing: {issue}");
        }
    }
}

async fn run(orchestrator: &BatchOrchestrator, args: &ArgMatches) -> Result<()> {
    let mode = match args.get_one::<u8>("views") {
        Some(views) => GenerationMode::catalog(*views),
        None => orchestrator.mode(),
    };
    if mode != orchestrator.mode() {
        orchestrator.set_mode(mode.clone()).await;
    }
    if let Some(images) = args.get_many::<PathBuf>("images") {
        let images: Vec<PathBuf> = images.cloned().collect();
        for path in collect_images(&images)? {
            let id = orchestrator.enqueue(read_image(&path)?, mode.clone()).await?;
            println!("Queued {} as {id}", path.display());
        }
    }

    let result = orchestrator.start_batch().await;
    orchestrator.persist_now().await?;
    match result {
        Ok(report) => {
            print_report(&report);
            print_items(orchestrator);
            Ok(())
        }
        Err(e) => {
            print_items(orchestrator);
            bail!("{}", e.user_message())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    let config = load_config(&matches)?;
    let orchestrator = build_orchestrator(&matches, config)?;
    print_restore(&orchestrator.restore().await?);

    match matches.subcommand() {
        Some(("run", args)) => run(&orchestrator, args).await?,
        Some(("status", _)) => print_items(&orchestrator),
        Some(("retry", args)) => {
            let id = parse_item(args)?;
            let report = orchestrator
                .retry_item(id)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            orchestrator.persist_now().await?;
            print_report(&report);
            if let Some(item) = orchestrator.item(id) {
                println!("{id} is now {}", item.status);
                if item.status == ItemStatus::Error {
                    std::process::exit(1);
                }
            }
        }
        Some(("urls", args)) => {
            let id = parse_item(args)?;
            for (reference, url) in orchestrator.display_urls(id).await? {
                println!("{reference}\n    {}  (expires {})", url.url, url.expires_at);
            }
        }
        Some(("reset", _)) => {
            orchestrator.clear_batch().await?;
            println!("Batch cleared.");
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let matches = cli()
            .try_get_matches_from([
                "atelier", "run", "a.png", "b.jpg", "--views", "2", "--user", "u7", "--log-json",
            ])
            .unwrap();
        assert!(matches.get_flag("log-json"));
        assert_eq!(matches.get_one::<String>("user").unwrap(), "u7");
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(run.get_one::<u8>("views"), Some(&2));
        assert_eq!(run.get_many::<PathBuf>("images").unwrap().count(), 2);
    }

    #[test]
    fn directories_expand_to_sorted_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let found = collect_images(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hi").unwrap();
        assert!(read_image(&path).is_err());
    }
}
