//! RPC stream behaviour over an in-memory transport

use async_trait::async_trait;
use bytes::Bytes;
use relaymesh_proto::{
    FrameReader, FramedTransport, Handler, RejectingHandler, RpcError, RpcType, Stream,
    Transport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn stream_pair(client: Arc<dyn Handler>, server: Arc<dyn Handler>) -> (Stream, Stream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Stream::new(FramedTransport::new(a), client),
        Stream::new(FramedTransport::new(b), server),
    )
}

/// Echoes the payload back after sleeping for the number of milliseconds it names
struct DelayedEcho;

#[async_trait]
impl Handler for DelayedEcho {
    async fn handle(&self, _rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError> {
        let millis: u64 = std::str::from_utf8(&payload)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(payload)
    }
}

struct Failing;

#[async_trait]
impl Handler for Failing {
    async fn handle(&self, _rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError> {
        if payload.as_ref() == b"panic" {
            panic!("handler blew up");
        }
        Err(RpcError::Remote("upstream refused".to_string()))
    }
}

struct Silent;

#[async_trait]
impl Handler for Silent {
    async fn handle(&self, _rpc_type: RpcType, _payload: Bytes) -> Result<Bytes, RpcError> {
        std::future::pending().await
    }
}

#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl Handler for Counting {
    async fn handle(&self, _rpc_type: RpcType, payload: Bytes) -> Result<Bytes, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}

#[tokio::test]
async fn test_call_round_trip() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(DelayedEcho));

    let reply = client
        .rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"0"))
        .await
        .unwrap();

    assert_eq!(reply, Bytes::from_static(b"0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_calls_match_out_of_order_replies() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(DelayedEcho));

    // Later calls finish first
    let calls = (0..10u64).map(|i| {
        let client = client.clone();
        let payload = Bytes::from(((10 - i) * 20).to_string());
        async move {
            let reply = client.rpc(RpcType::PROXY_HTTP, payload.clone()).await;
            (payload, reply)
        }
    });

    for (payload, reply) in futures::future::join_all(calls).await {
        assert_eq!(reply.unwrap(), payload);
    }
}

#[tokio::test]
async fn test_either_side_can_call() {
    init_tracing();
    let (client, server) = stream_pair(Arc::new(DelayedEcho), Arc::new(DelayedEcho));

    let from_client = client.rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"1"));
    let from_server = server.rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"2"));
    let (a, b) = tokio::join!(from_client, from_server);

    assert_eq!(a.unwrap(), Bytes::from_static(b"1"));
    assert_eq!(b.unwrap(), Bytes::from_static(b"2"));
}

#[tokio::test]
async fn test_handler_error_reaches_caller() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(Failing));

    let err = client
        .rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"x"))
        .await
        .unwrap_err();

    assert_eq!(err, RpcError::Remote("upstream refused".to_string()));
}

#[tokio::test]
async fn test_rejecting_handler_reports_unsupported() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(RejectingHandler));

    let err = client.rpc(RpcType(77), Bytes::new()).await.unwrap_err();

    assert_eq!(
        err,
        RpcError::Remote("unsupported rpc type: rpc_77".to_string())
    );
}

#[tokio::test]
async fn test_handler_panic_becomes_error_and_stream_survives() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(Failing));

    let err = client
        .rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"panic"))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Remote("internal error".to_string()));

    let err = client
        .rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"again"))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Remote("upstream refused".to_string()));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(Silent));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.rpc(RpcType::PROXY_HTTP, Bytes::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close();
    client.close();

    assert_eq!(pending.await.unwrap(), Err(RpcError::ConnectionClosed));
    assert_eq!(
        client.rpc(RpcType::PROXY_HTTP, Bytes::new()).await,
        Err(RpcError::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_remote_close_fails_pending_calls() {
    init_tracing();
    let (client, server) = stream_pair(Arc::new(RejectingHandler), Arc::new(Silent));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.rpc(RpcType::PROXY_HTTP, Bytes::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.close();

    assert_eq!(pending.await.unwrap(), Err(RpcError::ConnectionClosed));
    tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .expect("client stream should close when the peer does");
}

#[tokio::test]
async fn test_abandoned_call_does_not_poison_stream() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(DelayedEcho));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        client.rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"200")),
    )
    .await;
    assert!(abandoned.is_err());

    // The late reply to the abandoned call arrives while this one is in flight
    let reply = client
        .rpc(RpcType::PROXY_HTTP, Bytes::from_static(b"300"))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"300"));
}

#[tokio::test]
async fn test_heartbeats_never_reach_handler() {
    init_tracing();
    let client_handler = Arc::new(Counting::default());
    let server_handler = Arc::new(Counting::default());
    let (client, server) = stream_pair(client_handler.clone(), server_handler.clone());

    let cancel = CancellationToken::new();
    let interval = Duration::from_millis(20);
    let timeout = Duration::from_millis(200);
    let client_monitor = tokio::spawn({
        let (client, cancel) = (client.clone(), cancel.clone());
        async move { client.monitor(cancel, interval, timeout).await }
    });
    let server_monitor = tokio::spawn({
        let (server, cancel) = (server.clone(), cancel.clone());
        async move { server.monitor(cancel, interval, timeout).await }
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();

    assert_eq!(client_monitor.await.unwrap(), Ok(()));
    assert_eq!(server_monitor.await.unwrap(), Ok(()));
    assert_eq!(client_handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(server_handler.calls.load(Ordering::SeqCst), 0);
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_monitor_returns_promptly_when_cancelled() {
    init_tracing();
    let (client, _server) = stream_pair(Arc::new(RejectingHandler), Arc::new(RejectingHandler));

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn({
        let (client, cancel) = (client.clone(), cancel.clone());
        async move {
            client
                .monitor(cancel, Duration::from_secs(10), Duration::from_secs(10))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_millis(500), monitor)
        .await
        .expect("monitor should stop when cancelled")
        .unwrap();
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn test_monitor_detects_silent_peer() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = Stream::new(FramedTransport::new(a), Arc::new(RejectingHandler));

    // The peer reads frames but never answers
    let (mut peer_reader, _peer_writer) = FramedTransport::new(b).split();
    tokio::spawn(async move { while let Ok(Some(_)) = peer_reader.recv().await {} });

    let result = client
        .monitor(
            CancellationToken::new(),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
        .await;

    assert_eq!(result, Err(RpcError::HeartbeatTimeout));
    assert!(client.is_closed());
}
