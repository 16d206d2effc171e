//! Appose reference worker
//!
//! Reads request frames from stdin and writes response frames to stdout.
//! Logs go to stderr, which the parent forwards into its own tracing output.

mod builtins;
mod executor;
mod script;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use appose::protocol::{FrameReader, ProtocolError, Request, Response, TaskId};
use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use executor::{Outbox, run_task};

#[derive(Parser, Debug)]
#[command(name = "appose-worker")]
#[command(about = "Runs Appose task scripts sent over stdin", long_about = None)]
struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,

    /// Worker threads (defaults to the number of cores)
    #[arg(long)]
    threads: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries frames
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)))
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = args.threads {
        builder.worker_threads(threads.max(1));
    }
    let rt = builder.enable_all().build()?;

    info!("Worker {} ready", std::process::id());
    let result = rt.block_on(serve(tokio::io::stdin(), tokio::io::stdout()));
    // The stdin reader may still be parked in a blocking read
    rt.shutdown_background();
    result
}

/// What the stdin reader passes to the dispatch loop
#[derive(Debug)]
enum Inbound {
    Request(Request),
    Closed,
    Invalid(ProtocolError),
}

/// Read frames on a dedicated task so the dispatch loop can select on them
fn spawn_reader<R>(reader: R) -> mpsc::Receiver<Inbound>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut frames = FrameReader::new(reader);
        loop {
            let inbound = match frames.recv::<Request>().await {
                Ok(Some(request)) => Inbound::Request(request),
                Ok(None) => Inbound::Closed,
                Err(e) if e.is_disconnect() => {
                    warn!("Lost connection to parent: {}", e);
                    Inbound::Closed
                }
                Err(e) => Inbound::Invalid(e),
            };
            let last = !matches!(inbound, Inbound::Request(_));
            if tx.send(inbound).await.is_err() || last {
                break;
            }
        }
    });
    rx
}

/// Serve requests until shutdown, end of input, or an unreadable frame
async fn serve<R, W>(reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut inbound = spawn_reader(reader);
    let outbox = Arc::new(Outbox::new(writer));
    let mut running: JoinSet<TaskId> = JoinSet::new();
    let mut cancels: HashMap<TaskId, watch::Sender<bool>> = HashMap::new();

    loop {
        let message = tokio::select! {
            message = inbound.recv() => message.unwrap_or(Inbound::Closed),
            Some(done) = running.join_next() => {
                reap(done, &mut cancels);
                continue;
            }
        };

        match message {
            Inbound::Request(Request::Launch {
                task,
                script,
                inputs,
            }) => {
                if cancels.contains_key(&task) {
                    warn!("Ignoring duplicate launch of task {}", task);
                    continue;
                }
                let (cancel, canceled) = watch::channel(false);
                cancels.insert(task, cancel);
                let outbox = outbox.clone();
                running.spawn(async move {
                    run_task(task, script, inputs, outbox, canceled).await;
                    task
                });
            }
            Inbound::Request(Request::Cancel { task }) => match cancels.get(&task) {
                Some(cancel) => {
                    debug!("Cancel requested for task {}", task);
                    cancel.send_replace(true);
                }
                None => debug!("Cancel for finished or unknown task {}", task),
            },
            Inbound::Request(Request::Shutdown) => {
                info!("Shutdown requested");
                break;
            }
            Inbound::Closed => {
                info!("Parent closed the connection");
                break;
            }
            Inbound::Invalid(e) => {
                error!("Unreadable request: {}", e);
                let crash = Response::Crash {
                    error: format!("unreadable request: {e}"),
                };
                if let Err(e) = outbox.send(&crash).await {
                    warn!("Could not report crash: {}", e);
                }
                break;
            }
        }
    }

    if !running.is_empty() {
        info!("Canceling {} running task(s)", running.len());
    }
    for cancel in cancels.values() {
        cancel.send_replace(true);
    }
    while let Some(done) = running.join_next().await {
        reap(done, &mut cancels);
    }
    Ok(())
}

fn reap(done: Result<TaskId, JoinError>, cancels: &mut HashMap<TaskId, watch::Sender<bool>>) {
    match done {
        Ok(task) => {
            cancels.remove(&task);
        }
        Err(e) => {
            error!("Task panicked: {}", e);
            cancels.retain(|_, cancel| !cancel.is_closed());
        }
    }
}
