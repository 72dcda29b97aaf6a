//! Distribution event logging for the CLI

use std::sync::Arc;

use tracing::{info, warn};

use flowtree_core::{DistributionEvent, DistributionTask};

/// Log every event the task emits until the task is dropped
pub async fn run_event_loop(task: Arc<DistributionTask>) {
    let Some(mut rx) = task.events().await else {
        return;
    };

    while let Some(event) = rx.recv().await {
        handle_event(event);
    }
}

fn handle_event(event: DistributionEvent) {
    match event {
        DistributionEvent::ResourceAdded(ev) => match ev.origin {
            Some(peer) => info!(uri = %ev.uri, peer = %peer, "Resource announced"),
            None => info!(uri = %ev.uri, "Resource created"),
        },
        DistributionEvent::ResourceInvalidated(ev) => {
            info!(uri = %ev.uri, peer = %ev.origin, "Resource invalidated");
        }
        DistributionEvent::SizeMismatch(ev) => {
            warn!(
                uri = %ev.uri,
                peer = %ev.peer,
                local = ev.local_chunks,
                reported = ev.reported_chunks,
                "Chunk count mismatch"
            );
        }
        DistributionEvent::ChunkReceived(ev) => {
            info!(uri = %ev.uri, index = ev.index, peer = %ev.from, "Chunk replicated");
        }
    }
}
