//! Per-container host: launches processes on the service's behalf over
//! JSON-RPC on stdin/stdout

use std::io::{self, BufReader, Write};
use std::sync::{mpsc, Arc};

use clap::Parser;
use ironframe::host::{EventPublisher, HostServer, ProcessTracker, HANDSHAKE_OK};
use ironframe::job::JobObject;
use ironframe::messaging::MessageTransport;
use ironframe::process::LocalProcessRunner;

#[derive(Parser)]
#[command(name = "ironframe-host")]
#[command(about = "Process host running inside an IronFrame container", long_about = None)]
struct Cli {
    /// Id of the container this host serves
    container_id: String,
}

/// Environment variable holding the host's log filter
const LOG_ENV: &str = "IRONFRAME_LOG";

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli.container_id) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(container_id: &str) -> ironframe::Result<()> {
    if container_id.trim().is_empty() {
        return Err(ironframe::Error::InvalidArgument(
            "container id cannot be blank".into(),
        ));
    }

    let host_job = join_host_job(container_id)?;

    let transport = MessageTransport::new(BufReader::new(io::stdin()), io::stdout());
    let tracker = Arc::new(ProcessTracker::new(
        transport.clone() as Arc<dyn EventPublisher>,
        host_job,
    ));
    let server = HostServer::new(tracker, Arc::new(LocalProcessRunner::new()));

    let (closed_tx, closed_rx) = mpsc::channel::<()>();
    transport.on_closed(move || {
        let _ = closed_tx.send(());
    });
    server.serve(&transport);
    transport.start()?;

    {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{HANDSHAKE_OK}")?;
        stderr.flush()?;
    }
    init_logging();
    tracing::info!(container = container_id, pid = std::process::id(), "host ready");

    // Either the service closed our stdin or it went away
    let _ = closed_rx.recv();
    tracing::info!(container = container_id, "input closed, shutting down");
    server.kill_all();
    transport.dispose();
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

#[cfg(windows)]
fn join_host_job(container_id: &str) -> ironframe::Result<Option<Arc<dyn JobObject>>> {
    use ironframe::job::{JobObjectFactory, NativeJobObjectFactory};

    let job = NativeJobObjectFactory.create(&format!("{container_id}:host"))?;
    job.assign_current_process()?;
    Ok(Some(job))
}

#[cfg(not(windows))]
fn join_host_job(_container_id: &str) -> ironframe::Result<Option<Arc<dyn JobObject>>> {
    Ok(None)
}
