use clap::{Parser, Subcommand};
use haul_config::Config;
use haul_loader::{Driver, JsonExtractor, Loader, SharedLoader, StallTimeout};
use miette::{IntoDiagnostic, miette};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fetch bundle manifests and assets.
#[derive(Parser)]
#[command(name = "haul", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON), layered over haul.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the bundles; overrides `storage.root`.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the manifest and print it as JSON.
    Manifest,
    /// Load one asset from a bundle and print its data as JSON.
    Load {
        /// Bundle key, as listed in the manifest.
        bundle: String,
        /// Asset name inside the bundle.
        asset: String,
    },
}

fn report<E>(err: exn::Exn<E>) -> miette::Report
where
    E: std::error::Error + Send + Sync + 'static,
{
    miette!("{err:?}")
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("HAUL_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).map_err(report)?;
    if let Some(root) = cli.root {
        config.storage.root = root;
    }
    tracing::debug!(config = ?config, "Configuration loaded");

    let loader = SharedLoader::new(Loader::from_config(&config, Arc::new(JsonExtractor::new())).map_err(report)?);
    let driver = Driver::spawn(loader.clone(), config.timing.tick_interval()).map_err(report)?;
    let timeout = StallTimeout::from_config(&config.timing);
    let result = run(&cli.command, &loader, &timeout).await;
    driver.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?).into_diagnostic()?);
    Ok(())
}

async fn run(command: &Command, loader: &SharedLoader, timeout: &StallTimeout) -> miette::Result<Value> {
    let bootstrap = loader.lock().download_manifest().map_err(report)?;
    let manifest = bootstrap.wait(timeout).await;
    {
        // The manifest stays installed after its bundle is released.
        let mut loader = loader.lock();
        let key = loader.options().manifest_key.clone();
        loader.unload(key.as_str());
    }
    let manifest =
        manifest.map_err(report)?.ok_or_else(|| miette!("manifest bundle does not contain a manifest"))?;

    match command {
        Command::Manifest => serde_json::to_value(&*manifest).into_diagnostic(),
        Command::Load { bundle, asset } => {
            let request = loader.lock().request_load::<Value>(bundle.as_str(), asset.as_str()).map_err(report)?;
            let loaded = request.wait(timeout).await.map_err(report)?;
            loader.lock().unload(bundle);
            match loaded {
                Some(value) => Ok((*value).clone()),
                None => miette::bail!("bundle {bundle} has no asset named {asset}"),
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_load() {
        let cli = Cli::parse_from(["haul", "--config", "haul.yaml", "load", "cube0", "Cube"]);
        assert_eq!(cli.config, Some(PathBuf::from("haul.yaml")));
        match cli.command {
            Command::Load { bundle, asset } => {
                assert_eq!(bundle, "cube0");
                assert_eq!(asset, "Cube");
            },
            Command::Manifest => panic!("expected load"),
        }
    }

    #[tokio::test]
    async fn test_manifest_bundle_released_after_run() {
        let bundles = tempfile::tempdir().unwrap();
        let manifest = serde_json::json!({"assets": {"manifest": {"kind": "manifest", "data": {
            "bundles": {"cube0": {"version": "a1"}}
        }}}});
        std::fs::write(bundles.path().join("manifest"), serde_json::to_vec(&manifest).unwrap()).unwrap();
        let mut config = Config::default();
        config.storage.root = bundles.path().to_path_buf();
        config.cache.enabled = false;

        let loader = SharedLoader::new(Loader::from_config(&config, Arc::new(JsonExtractor::new())).unwrap());
        let driver = Driver::spawn(loader.clone(), Duration::from_millis(1)).unwrap();
        let printed = run(&Command::Manifest, &loader, &StallTimeout::default()).await.unwrap();
        assert_eq!(printed["bundles"]["cube0"]["version"], "a1");
        assert!(!loader.lock().is_cached("manifest"));
        assert!(loader.lock().orchestrator().manifest().is_some());
        driver.shutdown().await;
    }
}
