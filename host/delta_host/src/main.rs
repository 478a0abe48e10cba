mod config;
mod endpoint;

use crate::config::HostConfig;
use crate::endpoint::HttpEndpoint;
use delta_host_runtime::protocol::{
    error_envelope, reader_loop, ready_envelope, tree_envelope, writer_loop,
};
use delta_host_runtime::{
    EngineError, HostBindings, HostEnvelope, JsonCodec, Session, TreeSnapshot, run_session,
};
use std::io;
use std::ops::ControlFlow;
use std::process;
use std::rc::Rc;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("delta_host fatal error: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::from_env();
    init_tracing(&config.log_filter);

    let (tx, rx) = mpsc::sync_channel(config.outbound_queue_cap);
    let writer_handle = thread::spawn(move || writer_loop(io::stdout().lock(), rx));

    tx.send(ready_envelope(config.sid.clone()))
        .map_err(|_| "failed to queue ready envelope")?;

    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(config.inbound_queue_cap);
    let reader_handle = thread::spawn(move || {
        let read_result = reader_loop(io::stdin().lock(), |frame| {
            if inbound_tx.blocking_send(frame).is_ok() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        });

        if let Err(err) = &read_result {
            error!(error = %err, "reader loop terminated with error");
        }

        read_result
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let endpoint = Rc::new(HttpEndpoint::new(config.server_url.clone())?);
    let mut session = Session::open(endpoint, Rc::new(JsonCodec));
    let mut bindings = StdioBindings {
        tx: tx.clone(),
        sid: config.sid.clone(),
        queue_capacity: config.outbound_queue_cap,
        dropped_trees: 0,
    };

    info!(sid = %config.sid, server_url = %config.server_url, "delta host started");
    runtime.block_on(run_session(&mut session, &mut inbound_rx, &mut bindings));
    session.close();

    // Release every sender so the writer drains and exits.
    drop(bindings);
    drop(tx);

    if reader_handle.is_finished() {
        match reader_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "reader thread returned error"),
            Err(err) => warn!(?err, "reader thread join failed"),
        }
    }

    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "writer thread returned error"),
        Err(err) => warn!(?err, "writer thread join failed"),
    }

    Ok(())
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries frames; logs go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

struct StdioBindings {
    tx: SyncSender<HostEnvelope>,
    sid: String,
    queue_capacity: usize,
    dropped_trees: u64,
}

impl HostBindings for StdioBindings {
    fn render_tree(&mut self, snapshot: TreeSnapshot<'_>) {
        let envelope = tree_envelope(
            self.sid.clone(),
            snapshot.script_run_id().map(str::to_string),
            snapshot.state().as_str(),
            snapshot.rendered_elements(),
        );

        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_envelope)) => {
                self.dropped_trees += 1;
                let dropped = self.dropped_trees;
                if dropped == 1 || dropped.is_power_of_two() {
                    warn!(
                        cap = self.queue_capacity,
                        dropped, "host outbound queue full; dropped tree snapshot(s)"
                    );
                }
            }
            Err(TrySendError::Disconnected(_envelope)) => {
                warn!("failed to queue tree snapshot");
            }
        }
    }

    fn report_error(&mut self, err: &EngineError) {
        let envelope = error_envelope(self.sid.clone(), err.code(), err.to_string());
        enqueue_control_envelope(self.tx.clone(), envelope, self.queue_capacity);
    }
}

/// Error reports are never dropped: if the queue is full, a helper thread
/// waits for room instead of blocking the session.
fn enqueue_control_envelope(
    tx: SyncSender<HostEnvelope>,
    envelope: HostEnvelope,
    queue_capacity: usize,
) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(envelope)) => {
            warn!(
                cap = queue_capacity,
                "host outbound queue full; waiting to enqueue control envelope"
            );
            thread::spawn(move || {
                if tx.send(envelope).is_err() {
                    warn!("failed to enqueue control envelope");
                }
            });
        }
        Err(TrySendError::Disconnected(_envelope)) => {
            warn!("failed to enqueue control envelope");
        }
    }
}
