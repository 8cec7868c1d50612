//! Worker pools and delivery disciplines.
//!
//! Both runners share a pool of W workers pulling from one incoming command
//! channel, first come first served. They differ only in how finished
//! handles reach the consumer:
//!
//! ```text
//! unordered:
//!   commands ──▶ [worker × W] ──▶ out (completion order, capacity W)
//!
//! ordered:
//!   commands ──▶ enumerator ──▶ work ──▶ [worker × W]
//!                    │                        │ oneshot per command
//!                    └──▶ slots (cap M·W) ──▶ dispatcher ──▶ out
//! ```
//!
//! The ordered dispatcher drains the slot channel in creation order, so
//! handles emerge in submission order while up to M·W finished commands may
//! wait behind a slow predecessor. A full slot channel blocks the
//! enumerator, which blocks the upstream producer.
//!
//! Cancellation is cooperative: workers and the dispatcher race every
//! output send against the token. In-flight children are not killed; they
//! run to completion and their handles are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::capture;
use crate::cleanup;
use crate::command::Command;
use crate::options::Options;

/// Environment variable carrying the submission index to each child.
pub const PROCESS_INDEX_ENV: &str = "PROCESS_I";

/// Run every command arriving on `commands` and emit one [`Command`] handle
/// per execution. Dispatches to the ordered or unordered discipline based
/// on [`Options::ordered`]. The returned channel closes when the input is
/// exhausted and all workers have finished.
///
/// Cancelling `cancel` stops emission promptly; children already running
/// still complete, their output discarded. Must be called within a tokio
/// runtime.
pub fn run_commands(
    commands: mpsc::Receiver<String>,
    cancel: CancellationToken,
    opts: Options,
) -> mpsc::Receiver<Command> {
    cleanup::install();
    let opts = Arc::new(opts);
    if opts.ordered {
        ordered(commands, cancel, opts)
    } else {
        unordered(commands, cancel, opts)
    }
}

fn index_env(index: u64) -> [(String, String); 1] {
    [(PROCESS_INDEX_ENV.to_string(), index.to_string())]
}

fn unordered(
    commands: mpsc::Receiver<String>,
    cancel: CancellationToken,
    opts: Arc<Options>,
) -> mpsc::Receiver<Command> {
    let workers = opts.workers.max(1);
    let (out_tx, out_rx) = mpsc::channel(workers);
    let commands = Arc::new(Mutex::new(commands));
    let next_index = Arc::new(AtomicU64::new(0));

    for _ in 0..workers {
        let commands = commands.clone();
        let next_index = next_index.clone();
        let out_tx = out_tx.clone();
        let cancel = cancel.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            loop {
                // The index is taken while the receiver is still locked so
                // it matches arrival order.
                let (index, command) = {
                    let mut rx = commands.lock().await;
                    match rx.recv().await {
                        Some(command) => (next_index.fetch_add(1, Ordering::SeqCst), command),
                        None => break,
                    }
                };
                let handle = capture::run(&command, &opts, &index_env(index)).await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = out_tx.send(handle) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Workers hold the only sender clones; the channel closes itself once
    // they all exit.
    out_rx
}

/// One enqueued command in ordered mode: its submission index and the slot
/// its handle will be delivered on.
struct Envelope {
    index: u64,
    command: String,
    slot: oneshot::Sender<Command>,
}

fn ordered(
    mut commands: mpsc::Receiver<String>,
    cancel: CancellationToken,
    opts: Arc<Options>,
) -> mpsc::Receiver<Command> {
    let workers = opts.workers.max(1);
    let lookahead = opts.wait_multiplier.max(1) * workers;

    let (out_tx, out_rx) = mpsc::channel(workers);
    let (slot_tx, mut slot_rx) = mpsc::channel::<oneshot::Receiver<Command>>(lookahead);
    let (work_tx, work_rx) = mpsc::channel::<Envelope>(1);

    // Enumerator: allocate one slot per command, in submission order. When
    // the slot channel is full this blocks, which backpressures upstream.
    tokio::spawn(async move {
        let mut index = 0u64;
        while let Some(command) = commands.recv().await {
            let (tx, rx) = oneshot::channel();
            if slot_tx.send(rx).await.is_err() {
                break;
            }
            if work_tx
                .send(Envelope {
                    index,
                    command,
                    slot: tx,
                })
                .await
                .is_err()
            {
                break;
            }
            index += 1;
        }
    });

    let work_rx = Arc::new(Mutex::new(work_rx));
    for _ in 0..workers {
        let work_rx = work_rx.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            loop {
                let envelope = { work_rx.lock().await.recv().await };
                let Some(Envelope {
                    index,
                    command,
                    slot,
                }) = envelope
                else {
                    break;
                };
                let handle = capture::run(&command, &opts, &index_env(index)).await;
                // The dispatcher may already be gone after cancellation.
                let _ = slot.send(handle);
            }
        });
    }

    // Dispatcher: await each slot in creation order and forward.
    tokio::spawn(async move {
        while let Some(slot) = slot_rx.recv().await {
            // A dropped slot means the worker died; skip it.
            let Ok(handle) = slot.await else { continue };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = out_tx.send(handle) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    out_rx
}
