use anyhow::{Context, Result};
use hydris::api::{create_router, ApiState};
use hydris::config;
use hydris::controller::{ControllerSupervisor, SupervisorOptions};
use hydris::federation::FederationConnector;
use hydris::loopback::LoopbackTransport;
use hydris::node::NodeIdentity;
use hydris::policy::{reload, PolicyGate};
use hydris::reconcile::Reconciler;
use hydris::rpc::WorldService;
use hydris::snapshot::{manager::SnapshotManager, WorldSnapshot};
use hydris::store::{self, WorldStore};
use hydris::timeline::TimelineBuffer;
use hydris::world::WorldCore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hydris=info".into()),
        )
        .init();

    info!("Hydris starting...");

    let config_path = std::env::var("HYDRIS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = config::load_config(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        config::HydrisConfig::default()
    });

    // Snapshot recovery; a corrupt file fails startup, a missing one does not.
    let persist_path = config.persist.path.clone().map(PathBuf::from);
    let snapshot = match &persist_path {
        Some(path) => WorldSnapshot::load_if_exists(path)
            .with_context(|| format!("loading snapshot {}", path.display()))?,
        None => None,
    };

    // Node identity persists through the snapshot.
    let node = NodeIdentity::restore_or_create(snapshot.as_ref().map(|s| s.node_id.clone()));
    info!(node_id = %node.node_id, "Node identity ready");

    let store = Arc::new(WorldStore::new(&node.node_id, config.store.expiry_grace_ms));
    if let Some(snapshot) = snapshot {
        info!(
            entities = snapshot.entity_count(),
            "Restoring entities from snapshot"
        );
        store.load_entities(snapshot.entities);
    }
    store
        .apply(node.entity())
        .context("publishing local node entity")?;

    let cancel = CancellationToken::new();

    // Policy gate: an invalid initial rule module fails startup; afterwards
    // reloads can only swap in modules that compile.
    let policy = Arc::new(match &config.policy.path {
        Some(path) => PolicyGate::load(Path::new(path))?,
        None => {
            warn!("No policy file configured, admission is unrestricted");
            PolicyGate::permissive()
        }
    });
    reload::spawn_watcher(Arc::clone(&policy), cancel.child_token())?;

    // Background machinery.
    store::spawn_purge(
        Arc::clone(&store),
        Duration::from_millis(config.store.purge_interval_ms),
        cancel.child_token(),
    );
    let timeline = TimelineBuffer::new(
        config.timeline.window_secs * 1_000,
        config.timeline.max_events,
    );
    timeline.spawn_collector(&store, cancel.child_token());
    let reconciler = Reconciler::spawn(Arc::clone(&store), cancel.child_token());

    let core = Arc::new(WorldCore::new(
        Arc::clone(&store),
        Arc::clone(&timeline),
        Arc::clone(&policy),
        reconciler,
        node.clone(),
    ));

    let mut flush_task = None;
    if let Some(path) = persist_path {
        let manager = SnapshotManager::new(
            Arc::clone(&store),
            &node.node_id,
            path,
            Duration::from_secs(config.persist.flush_interval_secs),
        );
        let flush_cancel = cancel.child_token();
        flush_task = Some(tokio::spawn(async move {
            manager.run_flush_loop(flush_cancel).await;
        }));
    } else {
        warn!("No persistence path configured, world state is volatile");
    }

    // In-process transport for co-hosted controllers, and the built-in
    // federation controller riding it.
    let loopback = LoopbackTransport::spawn(
        WorldService::server(Arc::clone(&core)),
        cancel.child_token(),
    );
    let federation_channel = loopback
        .channel()
        .await
        .context("opening loopback channel")?;
    let federation = ControllerSupervisor::new(
        federation_channel,
        Arc::new(FederationConnector::default()),
        SupervisorOptions::default(),
        cancel.child_token(),
    );
    tokio::spawn(async move {
        if let Err(e) = federation.run().await {
            error!(error = %e, "Federation supervisor failed");
        }
    });

    if !config.permissions.allow_local_serial {
        info!("Local serial enumeration disabled by permissions");
    }

    // One listener carries both transports: gRPC over h2c, mounted under
    // its service path, and the path-addressed JSON bridge.
    let grpc = WorldService::server(Arc::clone(&core));
    let rest = create_router(ApiState {
        core: Arc::clone(&core),
    });
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);
    let app = rest
        .route_service("/hydris.v1.World/*rpc", grpc)
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "Serving gRPC + JSON bridge");

    let signal_cancel = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    })
    .await?;

    // Unwind background tasks; the snapshot manager flushes on the way out.
    cancel.cancel();
    if let Some(task) = flush_task {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            warn!("Final snapshot flush did not complete in time");
        }
    }

    info!("Hydris stopped");
    Ok(())
}
