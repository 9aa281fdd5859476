//! # wsmux-echo
//!
//! Echo server and client for wsmux sessions over WebSocket.
//!
//! `serve` accepts WebSocket connections and echoes every stream opened on
//! them. `connect` opens several streams on one connection, sends a message on
//! each and prints what comes back.

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wsmux::logging::{LogFormat, init_subscriber};
use wsmux::transport::websocket;
use wsmux::{Role, Session, SessionConfig, Stream, load_config};

/// Echo server and client for wsmux sessions.
#[derive(Parser, Debug)]
#[command(name = "wsmux-echo", about = "Echo server and client for wsmux sessions")]
struct Cli {
    /// Session config file (JSON). Missing files fall back to defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format: `compact` or `json`.
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every stream.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:9750")]
        listen: SocketAddr,
    },
    /// Open streams against a server and print the echoes.
    Connect {
        /// WebSocket URL of the server.
        #[arg(long, default_value = "ws://127.0.0.1:9750")]
        url: String,

        /// Number of concurrent streams.
        #[arg(long, default_value = "1")]
        streams: usize,

        /// Text written on every stream.
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

/// Accept connections until `shutdown` fires.
async fn serve(listener: TcpListener, config: SessionConfig, shutdown: CancellationToken) {
    loop {
        let (tcp, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        let config = config.clone();
        let shutdown = shutdown.clone();
        drop(tokio::spawn(async move {
            if let Err(e) = serve_connection(tcp, config, shutdown).await {
                tracing::warn!(%peer, error = %e, "connection failed");
            }
        }));
    }
}

async fn serve_connection(
    tcp: TcpStream,
    config: SessionConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let peer = tcp.peer_addr().ok();
    let ws = tokio_tungstenite::accept_async(tcp)
        .await
        .context("WebSocket handshake failed")?;
    let (sink, source) = websocket::split_tcp(ws);
    let session = Session::builder(Role::Server)
        .config(config)
        .on_remote_close(move || tracing::info!(?peer, "client closed connection"))
        .spawn(sink, source);
    tracing::info!(?peer, "session started");

    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = session.close().await;
                break;
            }
            accepted = session.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) if e.is_closed() => break,
                Err(e) => return Err(e.into()),
            },
        };
        drop(tokio::spawn(async move {
            let id = stream.id();
            match echo(&stream).await {
                Ok(bytes) => tracing::debug!(stream_id = id, bytes, "stream echoed"),
                Err(e) => tracing::debug!(stream_id = id, error = %e, "echo stopped"),
            }
        }));
    }
    Ok(())
}

/// Copy a stream back to itself until end of stream, then half-close.
async fn echo(stream: &Stream) -> wsmux::Result<usize> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += stream.write(&buf[..n]).await?;
    }
    stream.close_write().await?;
    Ok(total)
}

/// Send `message` on `streams` concurrent streams and collect the echoes.
async fn connect(
    url: &str,
    streams: usize,
    message: &str,
    config: SessionConfig,
) -> Result<Vec<String>> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (sink, source) = websocket::split_client(ws);
    let session = Session::new(sink, source, Role::Client, config);

    let mut handles = Vec::with_capacity(streams);
    for _ in 0..streams {
        let session = session.clone();
        let message = message.as_bytes().to_vec();
        handles.push(tokio::spawn(async move {
            let stream = session.open().await?;
            let _ = stream.write(&message).await?;
            stream.close_write().await?;
            let echoed = stream.read_to_end().await?;
            Ok::<_, wsmux::MuxError>((stream.id(), echoed))
        }));
    }

    let mut echoes = Vec::with_capacity(streams);
    for handle in handles {
        let (id, echoed) = handle.await.context("stream task panicked")??;
        let text = String::from_utf8_lossy(&echoed).into_owned();
        tracing::debug!(stream_id = id, len = echoed.len(), "echo received");
        echoes.push(text);
    }
    session.close().await.context("failed to close session")?;
    Ok(echoes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_subscriber(&args.log_level, args.log_format);

    let config = load_config(args.config.as_deref()).context("failed to load session config")?;

    match args.command {
        Command::Serve { listen } => {
            let listener = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            tracing::info!(addr = %listener.local_addr()?, "wsmux echo server listening");

            let shutdown = CancellationToken::new();
            let server = tokio::spawn(serve(listener, config, shutdown.clone()));

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("shutting down");
            shutdown.cancel();
            let _ = server.await;
        }
        Command::Connect {
            url,
            streams,
            message,
        } => {
            if streams == 0 {
                bail!("--streams must be at least 1");
            }
            for (i, echo) in connect(&url, streams, &message, config)
                .await?
                .iter()
                .enumerate()
            {
                println!("{i}: {echo}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn quiet() -> SessionConfig {
        SessionConfig {
            keep_alive_interval_ms: 0,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn cli_parses_connect() {
        let cli = Cli::try_parse_from([
            "wsmux-echo",
            "--log-format",
            "json",
            "connect",
            "--streams",
            "3",
            "--message",
            "hi",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Connect {
                streams, message, ..
            } => {
                assert_eq!(streams, 3);
                assert_eq!(message, "hi");
            }
            Command::Serve { .. } => panic!("expected connect"),
        }
    }

    #[test]
    fn cli_rejects_bad_listen_addr() {
        assert!(Cli::try_parse_from(["wsmux-echo", "serve", "--listen", "nowhere"]).is_err());
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, quiet(), shutdown.clone()));

        let echoes = tokio::time::timeout(
            Duration::from_secs(10),
            connect(&url, 4, "hello mux", quiet()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(echoes, vec!["hello mux"; 4]);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connect_to_missing_server_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = connect(&format!("ws://{addr}"), 1, "x", quiet())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to connect"));
    }
}
