mod config;
mod jobs;
mod runtime;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use modx_core::{
    FeatureDetector, ModelRuntime, Orchestrator, QuarantineRegistry, SaeManager, parse_layer_set,
};
use modx_store::{
    ConversionManifest, ConversionReport, ConvertedLayout, Converter, HUB_CACHE_DIR, HubSnapshot,
    JobStore, LayeredSource, LocalSnapshot, load_registry,
};

use crate::config::Settings;
use crate::jobs::JobRegistry;
use crate::runtime::{DetachedRuntime, HttpRuntime};
use crate::server::{AppState, ServiceInfo};

#[derive(Parser)]
#[command(name = "modx", about = "Quarantined-feature monitoring for LLM inference")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert SAEs, load the registry and serve HTTP
    Serve {
        /// Listen address, e.g. 0.0.0.0:8000
        #[arg(long)]
        bind: Option<String>,
    },

    /// Convert SAE checkpoints into the runtime layout
    Convert {
        /// Layers to convert, e.g. "0-31" or "0,1,21"
        #[arg(long)]
        layers: Option<String>,

        /// Reconvert layers that are already converted
        #[arg(long)]
        force: bool,
    },

    /// Show which layers are converted on disk
    Manifest {
        /// Layers to inspect
        #[arg(long)]
        layers: Option<String>,
    },

    /// List the quarantined features
    Features,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => cmd_serve(settings, bind).await,
        Commands::Convert { layers, force } => cmd_convert(&settings, layers.as_deref(), force),
        Commands::Manifest { layers } => cmd_manifest(&settings, layers.as_deref()),
        Commands::Features => cmd_features(&settings),
    }
}

fn layers_or_default(settings: &Settings, layers: Option<&str>) -> Result<Vec<usize>> {
    match layers {
        Some(spec) => parse_layer_set(spec).context("invalid --layers"),
        None => settings.conversion_layers(),
    }
}

/// Layers present in the local snapshot are read in place; the rest are
/// fetched from the hub into its own cache under the snapshot root.
fn source_repository(settings: &Settings) -> Result<LayeredSource> {
    let local = settings.source_layout()?;
    let cache_dir = local.root().join(HUB_CACHE_DIR);
    let source = LayeredSource::new(LocalSnapshot::new(local));
    if settings.hub_offline {
        return Ok(source);
    }
    let hub = HubSnapshot::new(&settings.sae_source_repo, &settings.layer_dir_template)
        .context("invalid hub source")?
        .with_token(settings.hf_token.clone())
        .with_cache_dir(cache_dir);
    Ok(source.with_remote(hub))
}

fn run_conversion(settings: &Settings, layers: &[usize], force: bool) -> Result<ConversionReport> {
    let target = ConvertedLayout::new(settings.layer_layout()?);
    let source = source_repository(settings)?;
    Ok(Converter::new(&target, &source).convert(layers, force))
}

fn load_features(settings: &Settings) -> Result<QuarantineRegistry> {
    load_registry(&settings.quarantined_features_path).context("failed to load quarantine registry")
}

/// Everything that blocks: conversion, the runtime client and the initial
/// model load.
fn build_state(settings: Settings) -> Result<AppState> {
    let registry = Arc::new(load_features(&settings)?);

    let layers = settings.conversion_layers()?;
    let report = run_conversion(&settings, &layers, settings.force_sae_conversion)?;
    let failed = report.failed_required(&[settings.layer]);
    if !failed.is_empty() {
        bail!(
            "SAE conversion failed for the default layer {}; refusing to serve",
            settings.layer
        );
    }

    let runtime: Box<dyn ModelRuntime> = match &settings.runtime_url {
        Some(url) => Box::new(
            HttpRuntime::new(url, settings.runtime_timeout_secs)
                .context("failed to create runtime client")?,
        ),
        None => {
            tracing::warn!("no runtime_url configured; generate requests will answer 503");
            Box::new(DetachedRuntime)
        }
    };

    let detector = FeatureDetector::new(registry, settings.detector_config())?;
    let saes = Arc::new(SaeManager::new(ConvertedLayout::new(settings.layer_layout()?)));
    let orchestrator = Arc::new(Orchestrator::new(
        runtime,
        saes,
        detector,
        settings.pipeline_settings(),
    ));

    if settings.runtime_url.is_some()
        && let Err(e) = orchestrator.load_model(&settings.model_id)
    {
        tracing::error!("initial model load failed: {e}");
    }
    if let Err(e) = orchestrator.saes().get_or_load(settings.layer) {
        tracing::warn!("default SAE not preloaded: {e}");
    }

    let store = match &settings.jobs_db {
        Some(path) => JobStore::open(path)
            .with_context(|| format!("failed to open job store {}", path.display()))?,
        None => JobStore::open_in_memory().context("failed to open job store")?,
    };

    Ok(AppState {
        jobs: JobRegistry::new(store, Arc::clone(&orchestrator)),
        orchestrator,
        info: ServiceInfo {
            model_id: settings.model_id.clone(),
            device: settings.device.clone(),
            sae_base_path: settings.sae_base_path.display().to_string(),
        },
    })
}

async fn cmd_serve(mut settings: Settings, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        settings.bind = bind;
    }
    settings.validate()?;
    let bind = settings.bind.clone();

    let state = tokio::task::spawn_blocking(move || build_state(settings))
        .await
        .context("startup task failed")??;
    server::serve(Arc::new(state), &bind).await
}

fn cmd_convert(settings: &Settings, layers: Option<&str>, force: bool) -> Result<()> {
    let layers = layers_or_default(settings, layers)?;
    let report = run_conversion(settings, &layers, force || settings.force_sae_conversion)?;

    println!("{:<7} outcome", "layer");
    for (layer, outcome) in &report.outcomes {
        println!("{layer:<7} {outcome}");
    }

    let failed = report.failed();
    if !failed.is_empty() {
        bail!("conversion failed for layers {failed:?}");
    }
    Ok(())
}

fn cmd_manifest(settings: &Settings, layers: Option<&str>) -> Result<()> {
    let layers = layers_or_default(settings, layers)?;
    let artifacts = ConvertedLayout::new(settings.layer_layout()?);
    let manifest = ConversionManifest::derive(&artifacts, &layers);
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn cmd_features(settings: &Settings) -> Result<()> {
    let registry = load_features(settings)?;
    for entry in registry.iter() {
        let severity = entry
            .severity
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "-".into());
        println!("{:<8} {:<9} {}", entry.feature_index, severity, entry.description);
    }
    println!("{} quarantined features", registry.len());
    Ok(())
}
