//! End-to-end tests through the HTTP bridge: listener → engine → HTTP pool
//! → mock upstream server.

use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use meshproxy::cluster::StaticClusterManager;
use meshproxy::config::ProxyConfig;
use meshproxy::http_pool::HttpConnectionPool;
use meshproxy::listener::Listener;
use meshproxy::proxy::Proxy;
use meshproxy::retry::RetryPolicy;
use meshproxy::router::{PathMatch, RouteEntry, RouteTable};
use meshproxy::timeout::TimeoutPolicy;
use std::convert::Infallible;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

async fn mock_upstream_handler(_req: Request<Incoming>) -> Result<Response<String>, Infallible> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body("upstream response".to_string())
        .unwrap())
}

async fn slow_upstream_handler(_req: Request<Incoming>) -> Result<Response<String>, Infallible> {
    // Simulate a slow upstream that takes longer than the route deadline
    tokio::time::sleep(Duration::from_secs(10)).await;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body("slow response".to_string())
        .unwrap())
}

async fn start_mock_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(mock_upstream_handler);
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

async fn start_slow_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(slow_upstream_handler);
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

/// Upstream that answers 503 on the first request and 200 afterwards.
async fn start_flaky_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let hits = Arc::clone(&hits);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        let status = if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body("flaky response".to_string())
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn build_proxy(router: RouteTable, cluster: &str, endpoints: Vec<String>) -> Rc<Proxy> {
    let cluster_manager = Rc::new(StaticClusterManager::new());
    cluster_manager.add_cluster(cluster, endpoints.clone());
    cluster_manager.register_pool(cluster, Rc::new(HttpConnectionPool::new(cluster, endpoints)));

    Rc::new(Proxy::new(
        &ProxyConfig::default(),
        Rc::new(router),
        cluster_manager,
    ))
}

async fn serve_proxy(proxy: Rc<Proxy>) -> (std::net::SocketAddr, broadcast::Sender<()>) {
    let listener = Listener::bind("127.0.0.1:0", proxy).await.unwrap();
    let addr = listener.local_addr();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::task::spawn_local(async move {
        let _ = listener.serve(shutdown_rx).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    (addr, shutdown_tx)
}

#[tokio::test]
async fn test_proxy_basic_request() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let upstream = start_mock_upstream().await;
            let router = RouteTable::new().with_default_cluster("backend");
            let proxy = build_proxy(router, "backend", vec![upstream]);
            let (proxy_addr, shutdown_tx) = serve_proxy(proxy).await;

            let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
            let req = Request::builder()
                .uri(format!("http://{}/test", proxy_addr))
                .body(Empty::<Bytes>::new())
                .unwrap();

            let response = client.request(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"upstream response");

            let _ = shutdown_tx.send(());
        })
        .await;
}

#[tokio::test]
async fn test_proxy_no_route() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // empty routing table: every request is hijacked
            let proxy = build_proxy(RouteTable::new(), "backend", vec![]);
            let (proxy_addr, shutdown_tx) = serve_proxy(proxy).await;

            let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
            let req = Request::builder()
                .uri(format!("http://{}/nowhere", proxy_addr))
                .body(Empty::<Bytes>::new())
                .unwrap();

            let response = client.request(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);

            let _ = shutdown_tx.send(());
        })
        .await;
}

#[tokio::test]
async fn test_proxy_timeout_enforcement() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let upstream = start_slow_upstream().await;
            let route = RouteEntry::new("slow", PathMatch::prefix("/"), "backend")
                .with_retry(RetryPolicy::disabled())
                .with_timeout(TimeoutPolicy {
                    global_timeout_ms: 500,
                    per_try_timeout_ms: 0,
                });
            let proxy = build_proxy(RouteTable::with_routes(vec![route]), "backend", vec![upstream]);
            let (proxy_addr, shutdown_tx) = serve_proxy(proxy).await;

            let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
            let req = Request::builder()
                .uri(format!("http://{}/test", proxy_addr))
                .body(Empty::<Bytes>::new())
                .unwrap();

            let start = std::time::Instant::now();
            let response = client.request(req).await.unwrap();
            let elapsed = start.elapsed();

            assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
            assert!(
                elapsed < Duration::from_secs(2),
                "request should time out quickly"
            );

            let _ = shutdown_tx.send(());
        })
        .await;
}

#[tokio::test]
async fn test_proxy_retries_flaky_upstream() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let upstream = start_flaky_upstream().await;
            let route = RouteEntry::new("flaky", PathMatch::prefix("/"), "backend").with_retry(
                RetryPolicy::new()
                    .with_max_retries(1)
                    .with_base_delay_ms(0)
                    .with_jitter(false),
            );
            let proxy = build_proxy(RouteTable::with_routes(vec![route]), "backend", vec![upstream]);
            let (proxy_addr, shutdown_tx) = serve_proxy(proxy).await;

            let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
            let req = Request::builder()
                .uri(format!("http://{}/test", proxy_addr))
                .body(Empty::<Bytes>::new())
                .unwrap();

            // the first upstream answer is 503; the engine retries and the
            // client only sees the 200
            let response = client.request(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let _ = shutdown_tx.send(());
        })
        .await;
}

#[tokio::test]
async fn test_proxy_forwards_request_body() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            // echo upstream
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(|req: Request<Incoming>| async move {
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            Ok::<_, Infallible>(Response::new(
                                String::from_utf8_lossy(&body).to_string(),
                            ))
                        });
                        let _ = http1::Builder::new().serve_connection(io, service).await;
                    });
                }
            });
            let upstream = format!("http://127.0.0.1:{}", addr.port());

            let router = RouteTable::new().with_default_cluster("backend");
            let proxy = build_proxy(router, "backend", vec![upstream]);
            let (proxy_addr, shutdown_tx) = serve_proxy(proxy).await;

            let client: Client<_, http_body_util::Full<Bytes>> =
                Client::builder(TokioExecutor::new()).build_http();
            let req = Request::builder()
                .method("POST")
                .uri(format!("http://{}/echo", proxy_addr))
                .body(http_body_util::Full::new(Bytes::from_static(b"ping pong")))
                .unwrap();

            let response = client.request(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"ping pong");

            let _ = shutdown_tx.send(());
        })
        .await;
}
