//! Basic proxy example demonstrating minimal setup.
//!
//! Run with:
//! ```bash
//! cargo run --example basic_proxy
//! ```

use meshproxy::access_log::TracingAccessLog;
use meshproxy::cluster::StaticClusterManager;
use meshproxy::config::ProxyConfig;
use meshproxy::http_pool::HttpConnectionPool;
use meshproxy::listener::Listener;
use meshproxy::proxy::Proxy;
use meshproxy::router::RouteTable;
use std::rc::Rc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("starting basic proxy example");

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // One cluster, one endpoint, catch-all route
            let endpoints = vec!["http://127.0.0.1:8080".to_string()];
            let cluster_manager = Rc::new(StaticClusterManager::new());
            cluster_manager.add_cluster("backend", endpoints.clone());
            cluster_manager
                .register_pool("backend", Rc::new(HttpConnectionPool::new("backend", endpoints)));

            let router = Rc::new(RouteTable::new().with_default_cluster("backend"));
            let proxy = Rc::new(
                Proxy::new(&ProxyConfig::default(), router, cluster_manager)
                    .with_access_log(Rc::new(TracingAccessLog::new())),
            );

            let listener = match Listener::bind("127.0.0.1:3000", proxy).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("failed to bind listener: {}", e);
                    return;
                }
            };
            info!("proxying on {} -> http://127.0.0.1:8080", listener.local_addr());

            let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("listener error: {}", e);
            }
        })
        .await;
}
