//! devicelabd — the Device Lab daemon.
//!
//! Single binary that assembles the provisioning control plane:
//! - Record store (redb)
//! - Built-in step executors
//! - Provisioning workflow
//! - Lifecycle controller on the record change feed
//!
//! # Usage
//!
//! ```text
//! devicelabd standalone --data-dir /var/lib/devicelab --config DeviceLab.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use devicelab_core::{LabConfig, PoolEndpoint};
use devicelab_state::{DevicePoolRecord, StateStore};
use devicelab_steps::{BuiltinSteps, IntegrationRouter};
use devicelab_trigger::LifecycleController;
use devicelab_workflow::{ProvisioningWorkflow, WorkflowConfig};

#[derive(Parser)]
#[command(name = "devicelabd", about = "Device Lab daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/devicelab")]
        data_dir: PathBuf,

        /// DeviceLab.toml with workflow settings and pool installs.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Account that pool installs without an explicit account go under.
        #[arg(long, default_value = "default")]
        account: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devicelabd=debug,devicelab=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            config,
            account,
        } => run_standalone(data_dir, config, account).await,
    }
}

async fn run_standalone(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    default_account: String,
) -> anyhow::Result<()> {
    info!("Device Lab daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("devicelab.redb");

    let config = match &config_path {
        Some(path) => LabConfig::from_file(path)?,
        None => LabConfig::default(),
    };

    // ── Initialize subsystems ──────────────────────────────────

    // Record store.
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "record store opened");

    // Declarative pool installs.
    let installed = seed_pools(&state, &config, &default_account)?;
    info!(installed, "pool installs applied");

    // Built-in steps. Integrations for unmanaged pools are registered
    // programmatically when embedding; the standalone daemon starts with
    // an empty router.
    let steps = BuiltinSteps::new(state.clone(), Arc::new(IntegrationRouter::new()));

    // Provisioning workflow.
    let workflow_config = workflow_config_from(&config);
    info!(
        workflow = %workflow_config.workflow_name,
        timeout_secs = workflow_config.timeout.as_secs(),
        wait_secs = workflow_config.wait_time.as_secs(),
        "workflow configured"
    );
    let workflow = Arc::new(ProvisioningWorkflow::new(workflow_config, steps.registry())?);

    // Lifecycle controller on the change feed.
    let changes = state.subscribe();
    let controller = LifecycleController::new(state.clone(), workflow.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let controller_handle = tokio::spawn(async move {
        controller.run(changes, shutdown_rx).await;
    });

    info!("Device Lab daemon running");

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    workflow.shutdown().await;

    let _ = controller_handle.await;

    info!("Device Lab daemon stopped");
    Ok(())
}

/// Upsert the configured pools into the record store. Existing records keep
/// their creation stamp.
fn seed_pools(state: &StateStore, config: &LabConfig, default_account: &str) -> anyhow::Result<u32> {
    let now = now_secs();
    let mut installed = 0;
    for install in &config.pools {
        let account = install.account.as_deref().unwrap_or(default_account);
        let key = devicelab_state::pool_key(account, &install.name);
        let created_at = state
            .get_pool(&key)?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let record = DevicePoolRecord {
            account: account.to_string(),
            name: install.name.clone(),
            description: install.description.clone(),
            pool_type: install.pool_type,
            endpoint: install.endpoint.as_ref().map(|e| PoolEndpoint {
                endpoint_type: e.endpoint_type,
                uri: e.uri.clone(),
            }),
            lock_options: install.lock.as_ref().map(|l| l.to_options()),
            created_at,
            updated_at: now,
        };
        state.put_pool(&record)?;
        info!(pool = %key, pool_type = ?record.pool_type, "pool installed");
        installed += 1;
    }
    Ok(installed)
}

/// Workflow tuning from the config file, falling back to the defaults.
fn workflow_config_from(config: &LabConfig) -> WorkflowConfig {
    let mut workflow_config = WorkflowConfig::default();
    if let Some(settings) = &config.workflow {
        if let Some(name) = &settings.name {
            workflow_config.workflow_name = name.clone();
        }
        if let Some(timeout_secs) = settings.timeout_secs {
            workflow_config.timeout = Duration::from_secs(timeout_secs);
        }
        if let Some(wait_secs) = settings.wait_secs {
            workflow_config.wait_time = Duration::from_secs(wait_secs);
        }
    }
    workflow_config
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
