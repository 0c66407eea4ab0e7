mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_config, init_tracing, refused_endpoint, MockScenic, Reply};
use scenic_bridge::{
    Action, ChannelError, ChannelManager, Command, CorrelationMode, Response, RetryPolicy,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn keys(text: &str) -> Command {
    Action::SendKeys {
        text: Some(text.to_string()),
        key: None,
        modifiers: vec![],
    }
    .into()
}

#[tokio::test]
async fn test_concurrent_replies_reach_their_own_callers() {
    init_tracing();
    const CALLERS: usize = 8;

    // Collect every request first, then answer them newest-first.
    let (listener, endpoint) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();
        while received.len() < CALLERS {
            let line = lines.next_line().await.unwrap().unwrap();
            received.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        for request in received.iter().rev() {
            let reply = json!({ "id": request["id"], "echo": request["text"] });
            write_half
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }
        // Keep the socket open until the client is done.
        let _ = lines.next_line().await;
    });

    let manager = ChannelManager::new(&fast_config(endpoint));
    let channel = manager.acquire().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..CALLERS {
        let channel = Arc::clone(&channel);
        handles.push(tokio::spawn(async move {
            let text = format!("caller-{i}");
            let response = channel
                .send(&keys(&text), Duration::from_secs(2))
                .await
                .unwrap();
            (text, response)
        }));
    }

    for handle in handles {
        let (text, response) = handle.await.unwrap();
        assert_eq!(response, Response::Payload(json!({ "echo": text })));
    }
}

#[tokio::test]
async fn test_serialized_mode_with_identity_blind_remote() {
    // This remote never echoes ids but answers strictly in order.
    let (listener, endpoint) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({ "echo": request["text"] });
            write_half
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        }
    });

    let mut config = fast_config(endpoint);
    config.correlation = CorrelationMode::Serialized;
    let manager = ChannelManager::new(&config);
    let channel = manager.acquire().await.unwrap();

    let a = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send(&keys("a"), Duration::from_secs(2)).await })
    };
    let b = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.send(&keys("b"), Duration::from_secs(2)).await })
    };

    assert_eq!(
        a.await.unwrap().unwrap(),
        Response::Payload(json!({ "echo": "a" }))
    );
    assert_eq!(
        b.await.unwrap().unwrap(),
        Response::Payload(json!({ "echo": "b" }))
    );
}

#[tokio::test]
async fn test_serialized_reply_keeps_its_own_id_field() {
    // Not an echo: the remote reports the id of the element it looked at.
    let mock =
        MockScenic::start(|_| Reply::Raw(r#"{"id":7,"label":"Save"}"#.to_string())).await;
    let mut config = fast_config(mock.endpoint.clone());
    config.correlation = CorrelationMode::Serialized;
    let manager = ChannelManager::new(&config);
    let channel = manager.acquire().await.unwrap();

    let inspect: Command = Action::InspectViewport { detail_level: None }.into();
    for _ in 0..2 {
        let reply = channel
            .send(&inspect, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(reply, Response::Payload(json!({ "id": 7, "label": "Save" })));
    }
    assert_eq!(mock.request_count(), 2);
}

#[tokio::test]
async fn test_tagged_single_request_accepts_foreign_id() {
    let mock =
        MockScenic::start(|_| Reply::Raw(r#"{"id":"btn-1","clicked":true}"#.to_string())).await;
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));
    let channel = manager.acquire().await.unwrap();

    let reply = channel
        .send(&Action::Status.into(), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Response::Payload(json!({ "id": "btn-1", "clicked": true }))
    );
}

#[tokio::test]
async fn test_remote_close_fails_pending_request_immediately() {
    let mock = MockScenic::start(|_| Reply::Hangup).await;
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));
    let channel = manager.acquire().await.unwrap();

    let started = Instant::now();
    let result = channel
        .send(&Action::Status.into(), Duration::from_secs(10))
        .await;

    assert!(
        matches!(result, Err(ChannelError::ConnectionLost { .. })),
        "{result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    // The manager forgets the dead channel on its own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manager.current().is_none());
    assert!(channel.is_closed());
}

/// Drops the connection with a reset instead of an orderly close.
#[allow(deprecated)]
fn reset(stream: tokio::net::TcpStream) {
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    drop(stream);
}

#[tokio::test]
async fn test_connection_reset_surfaces_socket_error() {
    let (listener, endpoint) = common::bind().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        reset(reader.into_inner());
    });

    let manager = ChannelManager::new(&fast_config(endpoint));
    let channel = manager.acquire().await.unwrap();
    let result = channel
        .send(&Action::Status.into(), Duration::from_secs(5))
        .await;

    match result {
        Err(ChannelError::Io { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::ConnectionReset)
        }
        other => panic!("expected socket error, got {other:?}"),
    }
    assert!(channel.is_closed());
}

#[tokio::test]
async fn test_silent_remote_times_out() {
    let mock = MockScenic::start(|_| Reply::Silent).await;
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));
    let channel = manager.acquire().await.unwrap();

    let result = channel
        .send(&Action::Status.into(), Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(ChannelError::CommandTimeout { .. })));
    assert_eq!(channel.in_flight().await, 0);
}

#[tokio::test]
async fn test_retry_against_refused_port_makes_exactly_max_attempts() {
    init_tracing();
    let endpoint = refused_endpoint().await;
    let manager = ChannelManager::new(&fast_config(endpoint));
    let policy = RetryPolicy::new(3, Duration::from_millis(10));

    let result = policy
        .send_with_retry(&manager, &Action::Status.into(), Duration::from_millis(500))
        .await;

    let error = result.unwrap_err();
    assert!(error.is_transport());
    assert!(error.is_connection_refused(), "{error}");
    assert_eq!(manager.connect_attempts(), 3);
}

#[tokio::test]
async fn test_rejection_is_returned_without_retry() {
    let mock = MockScenic::start(|_| Reply::Json(json!({ "error": "nope" }))).await;
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));
    let policy = RetryPolicy::new(3, Duration::from_millis(10));

    let response = policy
        .send_with_retry(&manager, &Action::Status.into(), Duration::from_secs(1))
        .await
        .unwrap();

    assert!(matches!(response, Response::Rejected { ref message, .. } if message == "nope"));
    assert_eq!(mock.request_count(), 1);
    assert_eq!(manager.connect_attempts(), 1);
}

#[tokio::test]
async fn test_retry_reconnects_after_hangup() {
    // First connection is dropped on its first request, later ones answer.
    let first = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let mock = {
        let first = first.clone();
        MockScenic::start(move |_| {
            if first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                Reply::Hangup
            } else {
                Reply::Json(json!({ "status": "ok" }))
            }
        })
        .await
    };
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));
    let policy = RetryPolicy::new(3, Duration::from_millis(10));

    let response = policy
        .send_with_retry(&manager, &Action::Status.into(), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response, Response::Payload(json!({ "status": "ok" })));
    assert_eq!(mock.connection_count(), 2);
}

#[tokio::test]
async fn test_changing_endpoint_closes_old_channel() {
    let first = MockScenic::ok().await;
    let second = MockScenic::ok().await;
    let manager = ChannelManager::new(&fast_config(first.endpoint.clone()));

    let old = manager.acquire().await.unwrap();
    assert!(manager.set_endpoint(second.endpoint.clone()));
    assert!(old.is_closed());
    assert!(!manager.set_endpoint(second.endpoint.clone()));

    let new = manager.acquire().await.unwrap();
    assert_eq!(new.endpoint(), &second.endpoint);
    assert_eq!(second.connection_count(), 1);
}

#[tokio::test]
async fn test_concurrent_acquire_opens_one_socket() {
    let mock = MockScenic::ok().await;
    let manager = ChannelManager::new(&fast_config(mock.endpoint.clone()));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.acquire().await.map(|c| c.generation()) }));
    }
    let mut generations = Vec::new();
    for handle in handles {
        generations.push(handle.await.unwrap().unwrap());
    }

    generations.dedup();
    assert_eq!(generations.len(), 1);
    assert_eq!(manager.connect_attempts(), 1);
}

#[tokio::test]
async fn test_reachability_check_skipped_within_success_window() {
    let mock = MockScenic::ok().await;
    let mut config = fast_config(mock.endpoint.clone());
    // Only the command-success window may answer from memory here.
    config.connection_cache_ttl = Duration::ZERO;
    let manager = ChannelManager::new(&config);
    let policy = RetryPolicy::default();

    assert!(manager.is_reachable(true).await);
    assert!(manager.is_reachable(true).await);
    assert_eq!(manager.connectivity().probe_count(), 2);

    policy
        .send_with_retry(&manager, &Action::Status.into(), Duration::from_secs(1))
        .await
        .unwrap();
    for _ in 0..5 {
        assert!(manager.is_reachable(true).await);
    }
    assert_eq!(manager.connectivity().probe_count(), 2);
}
