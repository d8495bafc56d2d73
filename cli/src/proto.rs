//! Line-delimited JSON event protocol over stdio: one [`ProtoRequest`] per
//! line of stdin, one [`ProtoEvent`] per line of stdout. Meant to sit behind
//! a transport adapter (HTTP/SSE, a long-lived RPC pipe, …) rather than be
//! typed at directly.
//!
//! A stdin-reading task, a processing task, and a stdout-writing task
//! connected by bounded channels, so a slow consumer never blocks the
//! reader from draining stdin.

use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use tabulon_core::bootstrap;
use tabulon_core::config::Config;
use tabulon_core::surface::Surface;
use tabulon_protocol::AgentEvent;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 128;

/// No flags of its own: every request (dataset, thread, message) arrives as
/// a line of JSON on stdin once the loop is running.
#[derive(Debug, Parser)]
pub struct ProtoCli {}

#[derive(Debug, Deserialize)]
struct ProtoRequest {
    dataset_id: String,
    message: String,
    #[serde(default)]
    thread_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ProtoEvent {
    /// Zero-based index of the request this event belongs to, in arrival
    /// order on stdin.
    request_seq: u64,
    #[serde(flatten)]
    event: AgentEvent,
}

fn init_logging() {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub async fn run_main(_cli: ProtoCli) -> anyhow::Result<()> {
    init_logging();

    let config = Config::from_env()?;
    let deps = bootstrap::build_deps(config).await?;
    let surface = Arc::new(Surface::new(Arc::new(deps)));

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<ProtoRequest>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ProtoEvent>(CHANNEL_CAPACITY);

    let stdin_reader_handle = tokio::spawn(async move {
        let stdin = io::stdin();
        let reader = BufReader::new(stdin);
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ProtoRequest>(&line) {
                        Ok(request) => {
                            if incoming_tx.send(request).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("failed to deserialize proto request: {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("failed to read stdin: {e}");
                    break;
                }
            }
        }
        debug!("proto stdin reader finished (EOF)");
    });

    let processor_handle = tokio::spawn(async move {
        let mut request_seq: u64 = 0;
        while let Some(request) = incoming_rx.recv().await {
            let seq = request_seq;
            request_seq += 1;

            let rx = surface.stream(request.dataset_id, request.message, request.thread_id);
            while let Ok(event) = rx.recv().await {
                if outgoing_tx
                    .send(ProtoEvent { request_seq: seq, event })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
        info!("proto processor exited (channel closed)");
    });

    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(event) = outgoing_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if stdout.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdout.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if stdout.flush().await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to serialize proto event: {e}"),
            }
        }
        info!("proto stdout writer exited (channel closed)");
    });

    let _ = tokio::join!(stdin_reader_handle, processor_handle, stdout_writer_handle);
    Ok(())
}
