mod config;

use cirrus_controllers::{Context, Manager, StoreCredentialsProvider};
use cirrus_core::{lookup_kind, yaml_documents, ResourceKey};
use cirrus_platform::{HttpRemoteClusterClient, MockPlatform, Platform};
use cirrus_storage::{ObjectStore, RedbBackend};
use clap::{Parser, Subcommand};
use config::ManagerConfig;
use miette::miette;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cirrus", about = "Cirrus vSphere infrastructure reconcilers")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CIRRUS_LOG_JSON")]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every reconciler until interrupted
    Run {
        /// Path to the redb database file
        #[arg(long, env = "CIRRUS_DATA_DIR", default_value = "./cirrus.redb")]
        data_dir: String,
        /// Manager config (YAML)
        #[arg(long, env = "CIRRUS_CONFIG")]
        config: Option<PathBuf>,
        /// Name this manager reports in its logs
        #[arg(long, env = "CIRRUS_NODE_NAME", default_value = "cirrus")]
        node_name: String,
    },
    /// Create or replace objects from a YAML file
    Apply {
        /// YAML file, may hold several documents
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        #[arg(long, env = "CIRRUS_DATA_DIR", default_value = "./cirrus.redb")]
        data_dir: String,
    },
    /// Print stored objects of one kind as YAML
    Get {
        /// Kind name, case-insensitive (e.g. vspherecluster)
        kind: String,
        /// Only this namespace
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(long, env = "CIRRUS_DATA_DIR", default_value = "./cirrus.redb")]
        data_dir: String,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            data_dir,
            config,
            node_name,
        } => run_manager(&node_name, &data_dir, config.as_deref()).await,
        Commands::Apply { file, data_dir } => run_apply(&file, &data_dir),
        Commands::Get {
            kind,
            namespace,
            data_dir,
        } => run_get(&kind, namespace.as_deref(), &data_dir),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Run all controllers against the store until ctrl-c
async fn run_manager(
    node_name: &str,
    data_dir: &str,
    config_path: Option<&Path>,
) -> miette::Result<()> {
    info!("Starting cirrus manager '{}'", node_name);

    let config = ManagerConfig::load(config_path)?;
    let store = open_store(data_dir)?;

    let mut platform = Platform::mock(MockPlatform::new(config.inventory.clone()));
    if let Some(remote) = &config.remote {
        let client =
            HttpRemoteClusterClient::new(remote.accept_invalid_certs, remote.bearer_token.clone())?;
        platform = platform.with_remote(Arc::new(client));
        info!("Using HTTP client for workload API servers");
    }

    let controller_config = config.controller_config();
    let credentials = Arc::new(StoreCredentialsProvider::new(
        store.clone(),
        controller_config.controller_namespace.clone(),
        config.default_credentials.clone(),
    ));
    let ctx = Arc::new(Context::new(store, platform, credentials, controller_config));

    let token = CancellationToken::new();
    let manager = Manager::new(ctx);
    let manager_handle = tokio::spawn(manager.run(token.clone()));

    info!("All controllers started, data dir: {}", data_dir);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(30);
    match tokio::time::timeout(shutdown_timeout, manager_handle).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => warn!("Manager task failed: {}", e),
        Err(_) => warn!("Controllers did not stop within {:?}", shutdown_timeout),
    }

    Ok(())
}

/// Import every document of a YAML file into the store
fn run_apply(file: &Path, data_dir: &str) -> miette::Result<()> {
    let data = std::fs::read_to_string(file)
        .map_err(|e| miette!("Failed to read '{}': {}", file.display(), e))?;
    let documents = yaml_documents(&data)?;
    let store = open_store(data_dir)?;

    for mut document in documents {
        let key = document_key(&mut document)?;
        store.apply_value(&key, document)?;
        println!("{} configured", key);
    }
    Ok(())
}

/// Storage key of an imported document; namespaced kinds default to "default"
fn document_key(document: &mut Value) -> miette::Result<ResourceKey> {
    let kind = document
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| miette!("Document is missing 'kind'"))?;
    let (gvk, namespaced) =
        lookup_kind(kind).ok_or_else(|| miette!("Unknown kind '{}'", kind))?;

    let metadata = document
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| miette!("{} document is missing 'metadata'", gvk.kind))?;
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| miette!("{} document is missing 'metadata.name'", gvk.kind))?
        .to_string();

    if !namespaced {
        metadata.remove("namespace");
        return Ok(ResourceKey::cluster_scoped(gvk, name));
    }
    let namespace = metadata
        .entry("namespace")
        .or_insert_with(|| Value::String("default".to_string()))
        .as_str()
        .unwrap_or("default")
        .to_string();
    Ok(ResourceKey::new(gvk, namespace, name))
}

fn run_get(kind: &str, namespace: Option<&str>, data_dir: &str) -> miette::Result<()> {
    let (gvk, _) = lookup_kind(kind).ok_or_else(|| miette!("Unknown kind '{}'", kind))?;
    let store = open_store(data_dir)?;
    let objects = store.list_values(&gvk, namespace, &BTreeMap::new(), None)?;
    if objects.is_empty() {
        eprintln!("No {} objects found", gvk.kind);
        return Ok(());
    }
    for object in objects {
        print!("---\n{}", cirrus_core::to_yaml(&object)?);
    }
    Ok(())
}

fn open_store(data_dir: &str) -> miette::Result<Arc<ObjectStore>> {
    let backend = RedbBackend::new(Path::new(data_dir))
        .map_err(|e| miette!("Failed to open storage at '{}': {}", data_dir, e))?;
    Ok(Arc::new(ObjectStore::new(Arc::new(backend))))
}
