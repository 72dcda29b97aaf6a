//! Resource announcement handler
//!
//! Keeps the registry in line with what peers report:
//! - an unknown resource is registered and the announcement forwarded
//! - a known resource with a different chunk count is reported, not fixed
//! - an invalidated resource is dropped, forwarded and deleted from the store

use tracing::{debug, info, warn};

use crate::network::{PeerId, ResourceExists, ResourceInvalidated};
use crate::protocol::{
    DistributionEvent, DistributionTask, Notification, ResourceAddedEvent,
    ResourceInvalidatedEvent, SizeMismatchEvent,
};
use crate::protocol::registry::Entry;
use crate::resource::uri;

impl DistributionTask {
    pub(crate) async fn handle_resource_exists(&self, from: &PeerId, exists: ResourceExists) {
        let key = uri::normalize(&exists.uri);
        if uri::is_root(&key) {
            return;
        }
        let key = uri::trim_trailing_slash(&key).to_string();

        let known = match self.registry.lock().await.get(&key) {
            Some(Entry::Resource(resource)) => Some(resource.clone()),
            Some(Entry::Directory(_)) => return,
            None => None,
        };

        if let Some(resource) = known {
            let local = resource.chunk_count().await;
            if let (Some(local), Some(reported)) = (local, exists.chunk_count) {
                if local != reported {
                    warn!(
                        uri = %key,
                        peer = %from,
                        local_chunks = local,
                        reported_chunks = reported,
                        "chunk count disagreement"
                    );
                    self.emit(DistributionEvent::SizeMismatch(SizeMismatchEvent {
                        uri: key,
                        peer: from.clone(),
                        local_chunks: local,
                        reported_chunks: reported,
                    }))
                    .await;
                    return;
                }
            }
            debug!(uri = %key, peer = %from, "resource already known");
            return;
        }

        if self.register_resource(&key, exists.chunk_count).await.is_none() {
            debug!(uri = %key, peer = %from, "announced path conflicts with registry");
            return;
        }
        info!(uri = %key, peer = %from, chunk_count = ?exists.chunk_count, "resource added by peer");

        self.emit(DistributionEvent::ResourceAdded(ResourceAddedEvent {
            uri: key.clone(),
            origin: Some(from.clone()),
        }))
        .await;
        self.notify_peers_except(&key, Notification::Exists, Some(from))
            .await;
    }

    pub(crate) async fn handle_resource_invalidated(
        &self,
        from: &PeerId,
        invalidated: ResourceInvalidated,
    ) {
        let key = uri::normalize(&invalidated.uri);
        if uri::is_root(&key) {
            return;
        }
        let key = uri::trim_trailing_slash(&key).to_string();

        let removed = {
            let mut registry = self.registry.lock().await;
            match registry.remove(&key) {
                Some(Entry::Resource(resource)) => Some(resource),
                Some(entry) => {
                    registry.insert(key.clone(), entry);
                    None
                }
                None => None,
            }
        };
        let Some(removed) = removed else {
            debug!(uri = %key, peer = %from, "invalidation for unknown resource");
            return;
        };

        removed.clear().await;
        info!(uri = %key, peer = %from, "resource invalidated by peer");

        self.notify_peers_except(&key, Notification::Invalidated, Some(from))
            .await;
        if let Err(e) = self.store.delete_resource(&key).await {
            warn!(error = %e, uri = %key, "failed to delete invalidated chunks");
        }

        self.emit(DistributionEvent::ResourceInvalidated(
            ResourceInvalidatedEvent {
                uri: key,
                origin: from.clone(),
            },
        ))
        .await;
    }
}
