//! End-to-end tests over real WebSocket connections on loopback TCP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, connect_async};

use wsmux::transport::websocket;
use wsmux::{MuxError, Role, Session, SessionBuilder, SessionConfig, Stream};

const TIMEOUT: Duration = Duration::from_secs(10);

fn quiet() -> SessionConfig {
    SessionConfig {
        keep_alive_interval_ms: 0,
        ..SessionConfig::default()
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept_session(listener: &TcpListener, builder: SessionBuilder) -> Session {
    let (tcp, _) = listener.accept().await.unwrap();
    let ws = accept_async(tcp).await.unwrap();
    let (sink, source) = websocket::split_tcp(ws);
    builder.spawn(sink, source)
}

async fn connect_session(url: &str, config: SessionConfig) -> Session {
    let (ws, _) = connect_async(url).await.unwrap();
    let (sink, source) = websocket::split_client(ws);
    Session::new(sink, source, Role::Client, config)
}

async fn session_pair(server: SessionBuilder, client: SessionConfig) -> (Session, Session) {
    let (listener, url) = bind().await;
    let (server, client) = tokio::join!(
        accept_session(&listener, server),
        connect_session(&url, client)
    );
    (client, server)
}

/// Echo every byte of `stream` back, then half-close.
async fn echo(stream: Stream) {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        let _ = stream.write(&buf[..n]).await.unwrap();
    }
    stream.close_write().await.unwrap();
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[tokio::test]
async fn ping_pong_over_websocket() {
    let (client, server) = session_pair(Session::builder(Role::Server).config(quiet()), quiet()).await;
    assert!(client.local_addr().is_some());
    assert!(server.local_addr().is_some());

    let stream = client.open().await.unwrap();
    assert_eq!(stream.id(), 1);
    stream.write(b"ping").await.unwrap();

    let peer = timeout(TIMEOUT, server.accept()).await.unwrap().unwrap();
    let mut buf = [0u8; 4];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");
    peer.write(b"pong").await.unwrap();

    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_streams_echo_intact() {
    let (client, server) = session_pair(Session::builder(Role::Server).config(quiet()), quiet()).await;

    let acceptor = tokio::spawn(async move {
        let mut echoes = Vec::new();
        for _ in 0..16 {
            let stream = server.accept().await.unwrap();
            echoes.push(tokio::spawn(echo(stream)));
        }
        for echo in echoes {
            echo.await.unwrap();
        }
        server
    });

    let mut clients = Vec::new();
    for seed in 0..16u8 {
        let client = client.clone();
        clients.push(tokio::spawn(async move {
            let stream = client.open().await.unwrap();
            // larger than the initial credit, so the writer must wait for ACKs
            let data = pattern(300 * 1024 + usize::from(seed), seed);

            let writer = tokio::spawn({
                let stream = stream.clone();
                let data = data.clone();
                async move {
                    let chunk = 1000 + usize::from(seed) * 97;
                    for part in data.chunks(chunk) {
                        let _ = stream.write(part).await.unwrap();
                    }
                    stream.close_write().await.unwrap();
                }
            });
            let echoed = stream.read_to_end().await.unwrap();
            writer.await.unwrap();
            assert_eq!(echoed.len(), data.len());
            assert!(echoed == data, "stream {} corrupted", stream.id());
        }));
    }

    timeout(TIMEOUT, async {
        for handle in clients {
            handle.await.unwrap();
        }
    })
    .await
    .unwrap();
    let server = timeout(TIMEOUT, acceptor).await.unwrap().unwrap();

    // every stream saw FIN both ways, so both tables drain
    timeout(TIMEOUT, async {
        while client.stream_count() > 0 || server.stream_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn remote_close_reaches_callback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let builder = Session::builder(Role::Server).config(quiet()).on_remote_close({
        let calls = Arc::clone(&calls);
        move || {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
        }
    });
    let (client, server) = session_pair(builder, quiet()).await;

    let stream = client.open().await.unwrap();
    let peer = server.accept().await.unwrap();

    client.close().await.unwrap();
    timeout(TIMEOUT, async {
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.is_closed());

    let mut buf = [0u8; 4];
    assert_matches!(peer.read(&mut buf).await, Err(MuxError::SessionClosed));
    assert_matches!(stream.write(b"x").await, Err(MuxError::SessionClosed));
    assert_matches!(server.accept().await, Err(MuxError::SessionClosed));
}

#[tokio::test]
async fn open_times_out_when_peer_never_answers() {
    let (listener, url) = bind().await;
    let silent = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        // read and discard until the client goes away
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = SessionConfig {
        stream_accept_deadline_ms: 100,
        ..quiet()
    };
    let client = connect_session(&url, config).await;

    let err = client.open().await.unwrap_err();
    assert_matches!(err, MuxError::AcceptTimeout(_));
    assert_eq!(client.stream_count(), 0);

    client.close().await.unwrap();
    drop(client);
    timeout(TIMEOUT, silent).await.unwrap().unwrap();
}

#[tokio::test]
async fn dropped_connection_closes_session() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        drop(ws);
    });

    let client = connect_session(&url, quiet()).await;
    server.await.unwrap();

    timeout(TIMEOUT, client.closed()).await.unwrap();
    assert_matches!(client.open().await, Err(MuxError::SessionClosed));
}

#[tokio::test]
async fn keep_alive_pings_do_not_disturb_streams() {
    let config = SessionConfig {
        keep_alive_interval_ms: 20,
        ..SessionConfig::default()
    };
    let (client, server) =
        session_pair(Session::builder(Role::Server).config(config.clone()), config).await;

    let stream = client.open().await.unwrap();
    let peer = server.accept().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    stream.write(b"still here").await.unwrap();
    stream.close_write().await.unwrap();
    assert_eq!(peer.read_to_end().await.unwrap(), b"still here");
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}
