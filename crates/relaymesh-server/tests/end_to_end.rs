//! Nodes, agents and local services wired together over loopback

use axum::body::Bytes;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::SinkExt;
use relaymesh_agent::{Agent, AgentConfig, AgentError, EndpointConfig};
use relaymesh_auth::{EndpointToken, StaticVerifier, Verifier};
use relaymesh_control::ClusterView;
use relaymesh_proto::{endpoint_path_segment, Frame, RpcType, MAX_PAYLOAD_SIZE};
use relaymesh_server::{Node, NodeAddrs, RunningNode, ServerConfig, ENDPOINT_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Local HTTP service an agent forwards to
async fn local_service() -> SocketAddr {
    named_service("svc-1").await
}

/// Local HTTP service whose `/hello` names it
async fn named_service(name: &'static str) -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(move || async move { format!("hello from {}", name) }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "too late"
            }),
        )
        .fallback(|body: Bytes| async move { body });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn node_config(node_id: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.proxy.bind_addr = "127.0.0.1:0".to_string();
    config.upstream.bind_addr = "127.0.0.1:0".to_string();
    config.admin.bind_addr = "127.0.0.1:0".to_string();
    config.cluster.node_id = Some(node_id.to_string());
    config.server.graceful_shutdown_timeout = Duration::from_secs(5);
    config
}

struct TestNode {
    addrs: NodeAddrs,
    node: RunningNode,
}

async fn start_node(
    config: ServerConfig,
    verifier: Option<Arc<dyn Verifier>>,
    view: Option<Arc<ClusterView>>,
) -> TestNode {
    let mut builder = Node::builder(config);
    if let Some(verifier) = verifier {
        builder = builder.verifier(verifier);
    }
    if let Some(view) = view {
        builder = builder.cluster_view(view);
    }
    let node = builder.bind().await.unwrap();
    let addrs = node.addrs().unwrap();
    TestNode {
        addrs,
        node: node.serve(),
    }
}

struct TestAgent {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), AgentError>>,
}

impl TestAgent {
    fn start(upstream: SocketAddr, endpoint: &str, local: SocketAddr, token: Option<&str>) -> Self {
        let agent = Agent::new(AgentConfig {
            server_url: format!("ws://{}", upstream),
            token: token.map(str::to_string),
            endpoints: vec![EndpointConfig {
                id: endpoint.to_string(),
                addr: local.to_string(),
            }],
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..Default::default()
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move { agent.run(run_cancel).await });
        Self { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }

    /// Wait for the agent to give up
    async fn result(self) -> Result<(), AgentError> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("agent did not stop")
            .unwrap()
    }
}

async fn wait_for_endpoint(node: &RunningNode, endpoint: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.registry().lookup(endpoint).is_empty() {
        assert!(
            Instant::now() < deadline,
            "endpoint {} never registered",
            endpoint
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn proxy_get(proxy: SocketAddr, endpoint: &str, path: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("http://{}{}", proxy, path))
        .header(ENDPOINT_HEADER, endpoint)
        .send()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxies_to_registered_upstream() {
    init_tracing();
    let local = local_service().await;
    let node = start_node(node_config("node-a"), None, None).await;
    let agent = TestAgent::start(node.addrs.upstream, "svc-1", local, None);
    wait_for_endpoint(&node.node, "svc-1").await;

    let response = proxy_get(node.addrs.proxy, "svc-1", "/hello").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello from svc-1");

    let response = reqwest::Client::new()
        .post(format!("http://{}/anything?x=1", node.addrs.proxy))
        .header(ENDPOINT_HEADER, "svc-1")
        .body("echo me")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "echo me");

    agent.stop().await;
    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_endpoint_not_permitted_never_registers() {
    init_tracing();
    let local = local_service().await;
    let verifier = StaticVerifier::new()
        .with_token("svc-1-token", EndpointToken::new(vec!["svc-1".to_string()]));
    let node = start_node(node_config("node-a"), Some(Arc::new(verifier)), None).await;

    let agent = TestAgent::start(node.addrs.upstream, "svc-2", local, Some("svc-1-token"));
    let result = agent.result().await;

    assert!(matches!(result, Err(AgentError::Unauthorized(id)) if id == "svc-2"));
    assert!(node.node.registry().lookup("svc-2").is_empty());
    assert!(node.node.registry().is_empty());

    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_token_rejected() {
    init_tracing();
    let local = local_service().await;
    let verifier = StaticVerifier::new().with_token("t", EndpointToken::wildcard());
    let node = start_node(node_config("node-a"), Some(Arc::new(verifier)), None).await;

    let agent = TestAgent::start(node.addrs.upstream, "svc-1", local, None);
    assert!(matches!(
        agent.result().await,
        Err(AgentError::Unauthorized(_))
    ));
    assert!(node.node.registry().is_empty());

    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_dropped_when_token_expires() {
    init_tracing();
    let local = local_service().await;
    let expiry = Utc::now() + chrono::Duration::seconds(2);
    let verifier = StaticVerifier::new().with_token(
        "short-lived",
        EndpointToken::new(vec!["svc-1".to_string()]).with_expiry(expiry),
    );
    let node = start_node(node_config("node-a"), Some(Arc::new(verifier)), None).await;
    let started = Instant::now();

    let agent = TestAgent::start(node.addrs.upstream, "svc-1", local, Some("short-lived"));
    wait_for_endpoint(&node.node, "svc-1").await;

    tokio::time::sleep(Duration::from_secs(3).saturating_sub(started.elapsed())).await;
    assert!(node.node.registry().lookup("svc-1").is_empty());

    // Reconnecting with the expired token is refused
    assert!(matches!(
        agent.result().await,
        Err(AgentError::Unauthorized(_))
    ));

    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_endpoint_fails_fast() {
    init_tracing();
    let node = start_node(node_config("node-a"), None, None).await;

    let started = Instant::now();
    let response = proxy_get(node.addrs.proxy, "svc-3", "/").await;

    assert_eq!(response.status(), 502);
    assert!(started.elapsed() < Duration::from_secs(1));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "endpoint not found");

    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gateway_timeout_bounds_request() {
    init_tracing();
    let local = local_service().await;
    let mut config = node_config("node-a");
    config.proxy.gateway_timeout = Duration::from_secs(1);
    let node = start_node(config, None, None).await;
    let agent = TestAgent::start(node.addrs.upstream, "svc-1", local, None);
    wait_for_endpoint(&node.node, "svc-1").await;

    let started = Instant::now();
    let response = proxy_get(node.addrs.proxy, "svc-1", "/slow").await;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 504);
    assert!(elapsed >= Duration::from_secs(1), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "returned after {:?}", elapsed);

    // The connection survives the abandoned call
    assert_eq!(node.node.registry().lookup("svc-1").len(), 1);
    let response = proxy_get(node.addrs.proxy, "svc-1", "/hello").await;
    assert_eq!(response.status(), 200);

    agent.stop().await;
    node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_forwarded_to_peer_node() {
    init_tracing();
    let local = local_service().await;
    let view = ClusterView::new();
    let node_a = start_node(node_config("node-a"), None, Some(view.clone())).await;
    let node_b = start_node(node_config("node-b"), None, Some(view.clone())).await;

    let agent = TestAgent::start(node_a.addrs.upstream, "svc-1", local, None);
    wait_for_endpoint(&node_a.node, "svc-1").await;
    assert!(node_b.node.registry().is_empty());

    let response = proxy_get(node_b.addrs.proxy, "svc-1", "/hello").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello from svc-1");

    // Once the only connection is gone the peer route disappears too
    agent.stop().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !view.owners("svc-1", "node-b").is_empty() {
        assert!(Instant::now() < deadline, "node-a never withdrew svc-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let response = proxy_get(node_b.addrs.proxy, "svc-1", "/hello").await;
    assert_eq!(response.status(), 502);

    node_a.node.shutdown().await;
    node_b.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_disconnects_upstreams() {
    init_tracing();
    let local = local_service().await;
    let node = start_node(node_config("node-a"), None, None).await;
    let agent = TestAgent::start(node.addrs.upstream, "svc-1", local, None);
    wait_for_endpoint(&node.node, "svc-1").await;

    let registry = node.node.registry().clone();
    tokio::time::timeout(Duration::from_secs(10), node.node.shutdown())
        .await
        .unwrap();

    assert!(registry.is_empty());
    assert!(tokio::net::TcpStream::connect(node.addrs.proxy).await.is_err());

    agent.stop().await;
}

/// Waits until `proxy` answers `endpoint` with `status`
async fn wait_for_status(proxy: SocketAddr, endpoint: &str, status: u16) -> reqwest::Response {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = proxy_get(proxy, endpoint, "/hello").await;
        if response.status() == status {
            return response;
        }
        assert!(
            Instant::now() < deadline,
            "{} never answered {} for {}",
            proxy,
            status,
            endpoint
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_route_keeps_unusual_endpoint_ids_intact() {
    init_tracing();
    let view = ClusterView::new();
    let node_a = start_node(node_config("node-a"), None, Some(view.clone())).await;
    let node_b = start_node(node_config("node-b"), None, Some(view.clone())).await;

    let plain = named_service("svc").await;
    let query_like = named_service("svc?x").await;
    let spaced = named_service("svc 1").await;
    let agents = vec![
        TestAgent::start(node_a.addrs.upstream, "svc", plain, None),
        TestAgent::start(node_a.addrs.upstream, "svc?x", query_like, None),
        TestAgent::start(node_a.addrs.upstream, "svc 1", spaced, None),
    ];
    for endpoint in ["svc", "svc?x", "svc 1"] {
        wait_for_endpoint(&node_a.node, endpoint).await;
    }

    for endpoint in ["svc?x", "svc 1", "svc"] {
        let response = proxy_get(node_b.addrs.proxy, endpoint, "/hello").await;
        assert_eq!(response.status(), 200, "endpoint {}", endpoint);
        assert_eq!(
            response.text().await.unwrap(),
            format!("hello from {}", endpoint)
        );
    }

    for agent in agents {
        agent.stop().await;
    }
    node_a.node.shutdown().await;
    node_b.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_endpoints_discovered_by_polling() {
    init_tracing();
    let local = local_service().await;
    let node_a = start_node(node_config("node-a"), None, None).await;

    let mut config = node_config("node-b");
    config.cluster.peers = vec![format!("node-a={}", node_a.addrs.admin)];
    config.cluster.poll_interval = Duration::from_millis(250);
    let node_b = start_node(config, None, None).await;

    let agent = TestAgent::start(node_a.addrs.upstream, "svc-1", local, None);
    wait_for_endpoint(&node_a.node, "svc-1").await;

    let response = wait_for_status(node_b.addrs.proxy, "svc-1", 200).await;
    assert_eq!(response.text().await.unwrap(), "hello from svc-1");
    assert!(node_b.node.registry().is_empty());

    agent.stop().await;
    wait_for_status(node_b.addrs.proxy, "svc-1", 502).await;

    node_a.node.shutdown().await;
    node_b.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_largest_frame_keeps_listener_connected() {
    init_tracing();
    let node = start_node(node_config("node-a"), None, None).await;

    let url = format!(
        "ws://{}/relaymesh/v1/listener/{}",
        node.addrs.upstream,
        endpoint_path_segment("raw-1")
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    wait_for_endpoint(&node.node, "raw-1").await;

    // A reply nobody waits for, at the largest size a frame may have
    let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE as usize]);
    let frame = Frame::response(999, RpcType::PROXY_HTTP, payload)
        .encode()
        .unwrap();
    socket
        .send(tokio_tungstenite::tungstenite::Message::Binary(frame.to_vec()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node.node.registry().lookup("raw-1").len(), 1);

    drop(socket);
    node.node.shutdown().await;
}
