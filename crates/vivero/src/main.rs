//! Vivero service binary.
//!
//! ## Usage
//!
//! ```bash
//! vivero serve --config vivero.yaml        # Run the pool service
//! vivero serve --bind 0.0.0.0:8000         # Override the listen address
//! vivero check-config vivero.yaml          # Validate a configuration
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;

use recorrer_vivero::{
    router, Clock, Group, LogNotifier, PoolService, Provider, ProviderDirectory, RpcState,
    SimProvider, Store, SystemClock, Template, TemplateId, ViveroConfig, ViveroResult, Workers,
};

#[derive(Debug, Parser)]
#[command(name = "vivero", version, about = "Appliance lifecycle pool service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pool service
    Serve(ServeArgs),
    /// Validate a configuration file and exit
    CheckConfig {
        /// Path to the YAML configuration
        #[arg(default_value = "vivero.yaml")]
        config: PathBuf,
    },
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Path to the YAML configuration
    #[arg(long, default_value = "vivero.yaml")]
    config: PathBuf,
    /// Listen address override
    #[arg(long)]
    bind: Option<String>,
    /// Snapshot file override
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> ViveroResult<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::CheckConfig { config } => {
            let parsed = ViveroConfig::load(&config)?;
            println!(
                "{}: {} users, {} providers, bind {}",
                config.display(),
                parsed.users.len(),
                parsed.providers.len(),
                parsed.bind
            );
            Ok(())
        }
        Commands::Serve(args) => serve(args),
    }
}

fn serve(args: ServeArgs) -> ViveroResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ViveroConfig::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(snapshot) = args.snapshot {
        config.snapshot_path = Some(snapshot);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_async(config))
}

async fn serve_async(config: ViveroConfig) -> ViveroResult<()> {
    let store = match &config.snapshot_path {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "restoring snapshot");
            Arc::new(Store::load_snapshot(path)?)
        }
        _ => Arc::new(Store::new()),
    };
    let providers = Arc::new(ProviderDirectory::new());
    seed(&store, &providers, &config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (service, orders) = PoolService::new(
        store.clone(),
        providers,
        clock,
        config.default_quota.clone(),
    );
    let workers = Workers::new(service.clone(), Arc::new(LogNotifier));
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let handles = workers.spawn(orders, &config.workers, &shutdown);

    let state = Arc::new(RpcState {
        service,
        users: config.users.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "vivero listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    let _ = stop.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    if let Some(path) = &config.snapshot_path {
        store.save_snapshot(path)?;
        info!(path = %path.display(), "snapshot saved");
    }
    Ok(())
}

/// Install configured providers, their simulated clients, and any
/// template seeds that a restored snapshot does not already carry.
fn seed(store: &Store, providers: &ProviderDirectory, config: &ViveroConfig) {
    for provider in &config.providers {
        let mut row = Provider::new(provider.key.as_str());
        row.num_simultaneous_provisioning = provider.num_simultaneous_provisioning;
        row.num_simultaneous_configuring = provider.num_simultaneous_configuring;
        row.appliance_limit = provider.appliance_limit;
        // Snapshot rows win over config defaults
        let _ = store.add_provider(row);

        let sim = Arc::new(SimProvider::new(provider.key.as_str()));
        for template in &provider.templates {
            sim.add_template(template.name.as_str(), template.version.as_deref());
            if store.group(&template.group).is_err() {
                store.upsert_group(Group::new(template.group.as_str()));
            }
            let known = store
                .templates()
                .iter()
                .any(|t| t.provider == provider.key && t.name == template.name);
            if !known {
                let _ = store.insert_template(Template {
                    id: TemplateId(0),
                    provider: provider.key.clone(),
                    template_group: template.group.clone(),
                    name: template.name.clone(),
                    original_name: template.name.clone(),
                    version: template.version.clone(),
                    date: template.date,
                    ready: true,
                    exists: true,
                    usable: true,
                    preconfigured: template.preconfigured,
                    suggested_delete: false,
                    metadata: serde_json::json!({}),
                });
            }
        }
        providers.register(provider.key.as_str(), sim);
    }
}
