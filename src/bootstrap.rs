// src/bootstrap.rs
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::metrics::{self, WorkerMetrics};
use crate::route::RouteTable;
use crate::syscalls;
use crate::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Builds the worker ring, installs the `ctrlc` shutdown handler, starts
/// every thread, and blocks on the last worker's loop running on the calling
/// thread. Returns once all workers have observed shutdown and exited.
pub fn run(config: ServerConfig, routes: RouteTable) -> ServerResult<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| ServerError::Other(format!("failed to install signal handler: {e}")))?;
    }
    run_with_shutdown(config, routes, shutdown)
}

/// Same as [`run`] but takes an externally owned shutdown flag instead of
/// installing a process-wide signal handler. Lets tests start a pool in a
/// background thread and stop it deterministically.
pub fn run_with_shutdown(
    config: ServerConfig,
    routes: RouteTable,
    shutdown: Arc<AtomicBool>,
) -> ServerResult<()> {
    run_with_shutdown_reporting_port(config, routes, shutdown, None)
}

/// Same as [`run_with_shutdown`], additionally reporting the actual bound
/// port over `port_tx` once the listener is up — useful when `config.port`
/// is `0` and the OS assigns an ephemeral port, as tests do.
pub fn run_with_shutdown_reporting_port(
    config: ServerConfig,
    routes: RouteTable,
    shutdown: Arc<AtomicBool>,
    port_tx: Option<std::sync::mpsc::Sender<u16>>,
) -> ServerResult<()> {
    let config = Arc::new(config);
    let routes = Arc::new(routes);
    let worker_count = config.worker_count;

    let fd_limit = syscalls::raise_and_query_fd_limit()?;
    let capacity = ((fd_limit / worker_count as u64).max(1)) as usize;
    tracing::info!(
        worker_count,
        fd_limit,
        capacity_per_worker = capacity,
        "starting pool"
    );

    let listener_fd = syscalls::create_listen_socket(&config.host, config.port, config.listen_backlog)?;
    if let Some(tx) = port_tx {
        let _ = tx.send(syscalls::local_port(listener_fd)?);
    }

    // Build a ring of pipes: worker i's token_out feeds worker (i+1)%N's token_in.
    let mut pipes = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        pipes.push(syscalls::create_pipe()?);
    }

    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    let worker_metrics: Vec<Arc<WorkerMetrics>> = (0..worker_count).map(|_| WorkerMetrics::new()).collect();

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let token_in = pipes[id].0;
        let token_out = pipes[(id + 1) % worker_count].1;
        let listener = if id == 0 { Some(listener_fd) } else { None };
        let worker = Worker::new(
            id,
            Arc::clone(&config),
            Arc::clone(&routes),
            Arc::clone(&worker_metrics[id]),
            capacity,
            listener,
            token_in,
            token_out,
        )?;
        workers.push(worker);
    }

    metrics::spawn_reporter(
        worker_metrics,
        Arc::clone(&shutdown),
        std::time::Duration::from_secs(crate::config::METRICS_INTERVAL_SECS),
    );

    let mut handles = Vec::with_capacity(worker_count - 1);
    let mut drained = workers.drain(..);
    for id in 0..worker_count.saturating_sub(1) {
        let mut worker = drained.next().expect("worker count mismatch");
        let shutdown = Arc::clone(&shutdown);
        let core_ids = core_ids.clone();
        let handle = thread::Builder::new()
            .name(format!("ringhttpd-worker-{id}"))
            .spawn(move || {
                pin_to_core(&core_ids, id);
                worker.run(shutdown);
            })
            .map_err(|e| ServerError::Other(format!("failed to spawn worker {id}: {e}")))?;
        handles.push(handle);
    }

    // The last worker runs on the calling thread.
    if let Some(mut last) = drained.next() {
        let last_id = worker_count - 1;
        pin_to_core(&core_ids, last_id);
        last.run(Arc::clone(&shutdown));
    }

    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("a worker thread panicked");
        }
    }

    Ok(())
}

fn pin_to_core(core_ids: &[core_affinity::CoreId], worker_id: usize) {
    if core_ids.is_empty() {
        tracing::warn!(worker = worker_id, "no core ids available, running unpinned");
        return;
    }
    let core = core_ids[worker_id % core_ids.len()];
    if !core_affinity::set_for_current(core) {
        tracing::warn!(worker = worker_id, "failed to pin to core, continuing unpinned");
    }
}
