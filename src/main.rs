use meshproxy::access_log::TracingAccessLog;
use meshproxy::admin_listener::AdminListener;
use meshproxy::cluster::{StaticClusterManager, UpstreamProtocol};
use meshproxy::config::ProxyConfig;
use meshproxy::http_pool::HttpConnectionPool;
use meshproxy::listener::Listener;
use meshproxy::proxy::Proxy;
use meshproxy::router::{PathMatch, RouteEntry, RoutingConfig, UpstreamCluster};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting meshproxy");

    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.run_until(run()).await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ProxyConfig::from_env();
    info!(
        "config: proxy={}, admin={}, upstream_protocol={:?}",
        config.listen_addr, config.admin_addr, config.upstream_protocol
    );

    let routing = match &config.routes_path {
        Some(path) => RoutingConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => default_routing(),
    };

    let cluster_manager = Rc::new(StaticClusterManager::new());
    for (name, cluster) in &routing.upstreams {
        cluster_manager.add_cluster(name.clone(), cluster.endpoints.clone());
        match cluster.protocol {
            UpstreamProtocol::Http1 => cluster_manager.register_pool(
                name.clone(),
                Rc::new(HttpConnectionPool::new(name.clone(), cluster.endpoints.clone())),
            ),
            UpstreamProtocol::Http2 => cluster_manager.register_pool(
                name.clone(),
                Rc::new(HttpConnectionPool::http2(name.clone(), cluster.endpoints.clone())),
            ),
            UpstreamProtocol::RpcFamily => {
                warn!(cluster = %name, "no built-in rpc_family pool, cluster will be unreachable");
            }
        }
    }

    let router = Rc::new(routing.build_router());
    let proxy = Rc::new(
        Proxy::new(&config, router, cluster_manager)
            .with_access_log(Rc::new(TracingAccessLog::new())),
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let proxy_listener = Listener::bind(&config.listen_addr, Rc::clone(&proxy)).await?;
    info!("proxy listening on {}", proxy_listener.local_addr());

    let admin_listener = AdminListener::bind(&config.admin_addr).await?;
    info!(
        "admin endpoints on {} (/health, /metrics)",
        admin_listener.local_addr()
    );

    let proxy_task = tokio::task::spawn_local({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = proxy_listener.serve(shutdown_rx).await {
                error!("proxy listener error: {}", e);
            }
        }
    });

    let admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, initiating graceful shutdown");

    let _ = shutdown_tx.send(());
    let _ = proxy_task.await;
    let _ = admin_task.await;

    info!("shutdown complete");
    Ok(())
}

/// Catch-all routing used when no routes file is configured.
fn default_routing() -> RoutingConfig {
    let mut upstreams = HashMap::new();
    upstreams.insert(
        "default".to_string(),
        UpstreamCluster {
            endpoints: vec!["http://127.0.0.1:8080".to_string()],
            protocol: UpstreamProtocol::Http1,
        },
    );

    RoutingConfig {
        routes: vec![RouteEntry::new("default", PathMatch::prefix("/"), "default")],
        upstreams,
        default_cluster: None,
    }
}
