use crate::mcp::sync::ResourceSyncClient;
use crate::metrics::ControllerMetrics;
use crate::resource_sync::engine::StatusSink;
use crate::resource_sync::record::{DeleteIdentifier, ResourceChange, ResourceRecord};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Merge buffer between the watchers and MCP.
///
/// Within one window the last upsert for an id wins, except that a delete is
/// sticky: once an id is marked deleted, later upserts are ignored until the
/// buffer flushes.
#[derive(Default, Debug)]
pub struct DebounceBuffer {
    entries: HashMap<String, ResourceChange>,
}

impl DebounceBuffer {
    pub fn merge(&mut self, change: ResourceChange) {
        match self.entries.entry(change.id()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_delete() && !change.is_delete() {
                    return;
                }
                occupied.insert(change);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(change);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Split the buffered changes into upserts and deletes, clearing the
    /// buffer.
    pub fn drain(&mut self) -> (Vec<ResourceRecord>, Vec<DeleteIdentifier>) {
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (_, change) in self.entries.drain() {
            match change {
                ResourceChange::Upsert(record) => upserts.push(record),
                ResourceChange::Delete(identifier) => deletes.push(identifier),
            }
        }
        (upserts, deletes)
    }

    /// Put a failed flush back, never clobbering entries that arrived while
    /// the flush was in flight.
    pub fn restore(&mut self, upserts: Vec<ResourceRecord>, deletes: Vec<DeleteIdentifier>) {
        for record in upserts {
            self.entries
                .entry(record.id())
                .or_insert(ResourceChange::Upsert(record));
        }
        for identifier in deletes {
            self.entries
                .entry(identifier.id())
                .or_insert(ResourceChange::Delete(identifier));
        }
    }
}

/// Drain the change channel into a [`DebounceBuffer`] and flush it on the
/// configured window, on channel close and on cancellation.
pub(crate) async fn run_debounce_loop(
    mut rx: mpsc::Receiver<ResourceChange>,
    window: Duration,
    mcp: ResourceSyncClient,
    status: Arc<StatusSink>,
    metrics: Arc<ControllerMetrics>,
    token: CancellationToken,
) {
    let mut buffer = DebounceBuffer::default();
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(change) => buffer.merge(change),
                None => {
                    flush(&mut buffer, &mcp, &status, &metrics).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&mut buffer, &mcp, &status, &metrics).await,
            _ = token.cancelled() => {
                flush(&mut buffer, &mcp, &status, &metrics).await;
                break;
            }
        }
    }
    debug!(msg = "debounce loop stopped");
}

async fn flush(
    buffer: &mut DebounceBuffer,
    mcp: &ResourceSyncClient,
    status: &StatusSink,
    metrics: &ControllerMetrics,
) {
    if buffer.is_empty() {
        return;
    }
    let (upserts, deletes) = buffer.drain();
    // a final flush still runs after the engine token is cancelled; the
    // per-attempt timeout bounds it instead
    let cancel = CancellationToken::new();
    match mcp.sync(&upserts, &deletes, false, &cancel).await {
        Ok(outcome) => {
            metrics.mcp_request_inc("sync", "ok");
            if !outcome.failures.is_empty() {
                // partial failures are not re-enqueued; the next resync
                // repairs them
                warn!(
                    msg = "sync flush reported item failures",
                    failures = outcome.failures.len()
                );
            }
            status.record_flush().await;
        }
        Err(e) => {
            metrics.mcp_request_inc("sync", "error");
            warn!(msg = "sync flush failed, re-enqueueing batch", %e);
            status.record_error(&e.to_string()).await;
            buffer.restore(upserts, deletes);
        }
    }
}
