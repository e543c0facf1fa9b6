use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use cache_cluster::cluster::client::HttpCoordinator;
use cache_cluster::cluster::coordinator::ClusterCoordinator;
use cache_cluster::cluster::distribution::DistributionMap;
use cache_cluster::cluster::handlers::*;
use cache_cluster::cluster::protocol::*;
use cache_cluster::cluster::service::CoordinatorService;
use cache_cluster::cluster::types::NodeId;
use cache_cluster::config::NodeConfig;
use cache_cluster::storage::handlers::{
    StorageContext, handle_get, handle_publish, handle_put, handle_query,
};
use cache_cluster::storage::memory::BucketStore;
use cache_cluster::transfer::client::HttpTransport;
use cache_cluster::transfer::handlers::*;
use cache_cluster::transfer::protocol::*;
use cache_cluster::transfer::source::TransferSource;
use cache_cluster::transfer::task::StateTransferTask;
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--coordinator <addr:port>] [--peer <addr:port>]... [--config <file>] [--mirror]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:6000 --peer 127.0.0.1:6001", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:6001 --coordinator 127.0.0.1:6000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut config = NodeConfig::default();
    let mut bind_addr: Option<SocketAddr> = None;
    let mut coordinator: Option<SocketAddr> = None;
    let mut peers: Vec<SocketAddr> = vec![];
    let mut mirror = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                config = NodeConfig::load(&args[i + 1])?;
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--coordinator" if i + 1 < args.len() => {
                coordinator = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--peer" if i + 1 < args.len() => {
                peers.push(args[i + 1].parse()?);
                i += 2;
            }
            "--mirror" => {
                mirror = true;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    // Flags win over the config file.
    if let Some(bind) = bind_addr {
        config.bind = bind;
    }
    if coordinator.is_some() {
        config.coordinator = coordinator;
    }
    config.peers.extend(peers);
    config.started_as_mirror |= mirror;

    let local = NodeId::from(config.bind);
    tracing::info!("Starting cache node {}", local);
    if config.is_coordinator() {
        tracing::info!("Acting as coordinator for {} buckets", config.bucket_count);
    } else {
        tracing::info!("Coordinator: {}", config.coordinator_addr());
    }

    // 1. Bucket table replica and local store:
    let distribution = Arc::new(DistributionMap::new(config.bucket_count));
    let store = Arc::new(BucketStore::with_capacity(
        config.bucket_count,
        config.capacity_bytes,
    ));

    // 2. State transfer, both directions:
    let coordinator_client = Arc::new(HttpCoordinator::new(
        local.clone(),
        config.coordinator_addr(),
        distribution.clone(),
    ));
    let transport = Arc::new(HttpTransport::new(
        local.clone(),
        config.state_transfer.rpc_timeout(),
    ));
    let source = TransferSource::new(
        local.clone(),
        store.clone(),
        distribution.clone(),
        &config.state_transfer,
        config.started_as_mirror,
    );
    let driver = StateTransferTask::new(
        local.clone(),
        config.state_transfer.clone(),
        coordinator_client.clone(),
        transport,
        store.clone(),
    );

    let transfer_ctx = Arc::new(TransferContext {
        source,
        driver: driver.clone(),
        distribution: distribution.clone(),
    });
    let storage_ctx = Arc::new(StorageContext {
        store,
        oracle: distribution.clone(),
        local: local.clone(),
    });

    // 3. HTTP Router:
    let mut app = Router::new()
        .route(ENDPOINT_TRANSFER_BUCKET, post(handle_transfer_bucket))
        .route(ENDPOINT_ACK_TRANSFER, post(handle_ack_transfer))
        .route(ENDPOINT_END_TRANSFER, post(handle_end_transfer))
        .route("/internal/state_transfer/stats/:bucket", get(handle_bucket_stats))
        .route(ENDPOINT_ADMIN_STATE_TRANSFER, post(handle_state_transfer))
        .route(ENDPOINT_ADMIN_DISTRIBUTION, post(handle_distribution))
        .route("/put", post(handle_put))
        .route("/get/:key", get(handle_get))
        .route("/publish", post(handle_publish))
        .route("/query/:prefix", get(handle_query))
        .layer(Extension(transfer_ctx))
        .layer(Extension(storage_ctx));

    // 4. Coordinator duties:
    if config.is_coordinator() {
        let mut members: Vec<NodeId> = config.peers.iter().copied().map(NodeId::from).collect();
        members.push(local.clone());
        members.sort();
        members.dedup();

        // The authoritative table; this node's own view is the replica above.
        let table = Arc::new(DistributionMap::new(config.bucket_count));
        table.assign_round_robin(&members);
        tracing::info!("Initial distribution over {} nodes", members.len());

        let service = CoordinatorService::new(table, members);
        let coordinator_routes = Router::new()
            .route(ENDPOINT_LOCK_BUCKETS, post(handle_lock_buckets))
            .route(ENDPOINT_RELEASE_BUCKETS, post(handle_release_buckets))
            .route(ENDPOINT_ANNOUNCE_TRANSFER, post(handle_announce_transfer))
            .route(ENDPOINT_BUCKETS_TRANSFERRED, post(handle_buckets_transferred))
            .route(ENDPOINT_BUCKET_MAP, get(handle_bucket_map))
            .route(ENDPOINT_PRESENCE, post(handle_presence))
            .route(ENDPOINT_TRANSFER_REPORT, post(handle_transfer_report))
            .route(ENDPOINT_ADMIN_MOVE, post(handle_move_buckets))
            .layer(Extension(service.clone()));
        app = app.merge(coordinator_routes);

        // Members started before the coordinator pick up the table once it is reachable.
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            service.publish().await;
        });
    } else {
        // 5. Fetch the current table from the coordinator:
        let driver = driver.clone();
        let distribution = distribution.clone();
        tokio::spawn(async move {
            match coordinator_client.determine_cluster_status().await {
                Ok(()) => {
                    driver.do_state_transfer(distribution.assignments());
                }
                Err(e) => tracing::warn!("Coordinator not reachable yet: {}", e),
            }
        });
    }

    // 6. Start HTTP server:
    tracing::info!("HTTP server listening on {}", config.bind);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    driver.stop().await;
    tracing::info!("Node {} stopped", local);

    Ok(())
}
