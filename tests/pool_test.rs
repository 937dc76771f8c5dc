mod support;

use std::time::Duration;

use bytes::Bytes;
use gear_pool::proto::Packet;
use gear_pool::{ConnectionStatus, GearError, ServerPool};
use support::{init_logging, unreachable_address, FakeServer};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

fn submit_packet(function: &str) -> Packet {
    Packet::SubmitJob {
        function: function.into(),
        unique: gear_pool::client::generate_unique_id(),
        payload: Bytes::from_static(b"payload"),
    }
}

#[tokio::test]
async fn test_connect_all_fails_only_when_all_fail() {
    init_logging();
    let mut pool = ServerPool::new([unreachable_address(), unreachable_address()], CONNECT_TIMEOUT);
    assert!(matches!(pool.connect_all().await, Err(GearError::NoServersAvailable)));
    assert_eq!(pool.connected_count(), 0);

    let server = FakeServer::start().await;
    let mut pool = ServerPool::new([unreachable_address(), server.address()], CONNECT_TIMEOUT);
    assert_eq!(pool.connect_all().await.unwrap(), 1);
    assert_eq!(pool.status(0), Some(ConnectionStatus::Failed));
    assert_eq!(pool.status(1), Some(ConnectionStatus::Connected));
}

#[tokio::test]
async fn test_submissions_round_robin_across_servers() {
    init_logging();
    let first = FakeServer::start().await;
    let second = FakeServer::start().await;
    let mut pool = ServerPool::new([first.address(), second.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    let mut strays = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..4 {
        let (server, handle) = pool
            .submit(&submit_packet("reverse"), RESPONSE_TIMEOUT, &mut strays)
            .await
            .unwrap();
        assert!(handle.starts_with("H:fake:"));
        servers.push(server);
    }
    assert_eq!(servers, vec![0, 1, 0, 1]);
    assert_eq!(first.queued_jobs(), 2);
    assert_eq!(second.queued_jobs(), 2);
    assert!(strays.is_empty());
}

#[tokio::test]
async fn test_submit_retries_once_on_next_server() {
    init_logging();
    let first = FakeServer::start().await;
    let second = FakeServer::start().await;
    let mut pool = ServerPool::new([first.address(), second.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    first.shutdown();
    // 等待读取任务观察到EOF
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut strays = Vec::new();
    let (server, _) = pool
        .submit(&submit_packet("reverse"), RESPONSE_TIMEOUT, &mut strays)
        .await
        .unwrap();
    assert_eq!(server, 1);
    assert_eq!(pool.status(0), Some(ConnectionStatus::Failed));
    assert_eq!(second.queued_jobs(), 1);
}

#[tokio::test]
async fn test_failed_server_is_skipped_until_reconnect() {
    init_logging();
    let first = FakeServer::start().await;
    let second = FakeServer::start().await;
    let mut pool = ServerPool::new([first.address(), second.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    pool.mark_failed(0);
    let mut strays = Vec::new();
    for _ in 0..3 {
        let (server, _) = pool
            .submit(&submit_packet("reverse"), RESPONSE_TIMEOUT, &mut strays)
            .await
            .unwrap();
        assert_eq!(server, 1);
    }

    assert_eq!(pool.reconnect_failed().await, vec![0]);
    assert_eq!(pool.connected_count(), 2);
}

#[tokio::test]
async fn test_missing_job_created_marks_connection_failed() {
    init_logging();
    let server = FakeServer::start().await;
    server.set_drop_submissions(true);
    let mut pool = ServerPool::new([server.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    let mut strays = Vec::new();
    let err = pool
        .submit(&submit_packet("reverse"), Duration::from_millis(200), &mut strays)
        .await
        .unwrap_err();
    assert!(matches!(err, GearError::Connection(_)));
    assert_eq!(pool.status(0), Some(ConnectionStatus::Failed));
}

#[tokio::test]
async fn test_broadcast_registration_is_idempotent() {
    init_logging();
    let first = FakeServer::start().await;
    let second = FakeServer::start().await;
    let mut pool = ServerPool::new([first.address(), second.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    assert_eq!(pool.broadcast_registration("reverse", None).await, 2);
    assert_eq!(pool.broadcast_registration("reverse", None).await, 2);
    assert!(first.wait_for_ability("reverse", Duration::from_secs(2)).await);
    assert!(second.wait_for_ability("reverse", Duration::from_secs(2)).await);
    assert_eq!(first.abilities().len(), 1);

    assert_eq!(pool.broadcast_unregistration("reverse").await, 2);
    assert!(first.wait_until(Duration::from_secs(2), |s| s.abilities().is_empty()).await);
    for (_, conn) in pool.connections() {
        assert!(conn.capabilities().is_empty());
    }
}

#[tokio::test]
async fn test_echo_via_send_and_receive() {
    init_logging();
    let server = FakeServer::start().await;
    let mut pool = ServerPool::new([server.address()], CONNECT_TIMEOUT);
    pool.connect_all().await.unwrap();

    pool.send(0, &Packet::EchoReq {
        payload: Bytes::from_static(b"ping"),
    })
    .await
    .unwrap();
    let reply = pool.receive(0, Some(RESPONSE_TIMEOUT)).await.unwrap();
    assert_eq!(reply, Packet::EchoRes {
        payload: Bytes::from_static(b"ping"),
    });
    assert!(pool.try_receive(0).unwrap().is_none());
}
