//! Resource namespace operations
//!
//! The registry maps absolute paths to resources or directories. Resource
//! keys never end in `/` and directory keys always do. Directories are mostly
//! implicit: any path with a registered descendant is a directory, and asking
//! about it materializes an entry so a provider can be attached to it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::PeerId;
use crate::resource::{uri, Resource, ResourceError, CHUNK_SIZE};

use super::core::{DistributionTask, Notification};
use super::error::TaskError;
use super::events::{DistributionEvent, ResourceAddedEvent};

/// Directory that holds imported files
pub const FILES_DIR: &str = "/files/";

/// Late-bound resource source attached to a directory
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Produce the resource for `uri`, or `None` if this provider has none
    async fn load_resource(&self, uri: &str, exclude: Option<&PeerId>) -> Option<Arc<Resource>>;
}

/// Directory registry entry
#[derive(Clone)]
pub struct DirectoryEntry {
    pub uri: String,
    pub provider: Option<Arc<dyn ResourceProvider>>,
}

impl std::fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryEntry")
            .field("uri", &self.uri)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Entry {
    Resource(Arc<Resource>),
    Directory(DirectoryEntry),
}

/// Resource path for `uri`, `None` when it names the root
fn resource_key(raw: &str) -> Option<String> {
    let path = uri::normalize(raw);
    if uri::is_root(&path) {
        return None;
    }
    Some(uri::trim_trailing_slash(&path).to_string())
}

/// Nearest ancestor of `path` registered as a resource
fn resource_above(registry: &HashMap<String, Entry>, path: &str) -> Option<String> {
    let mut current = uri::parent_of(path);
    while let Some(parent) = current {
        if uri::is_root(&parent) {
            return None;
        }
        if matches!(registry.get(&parent), Some(Entry::Resource(_))) {
            return Some(parent);
        }
        current = uri::parent_of(&parent);
    }
    None
}

/// A resource key is free when nothing sits at it, below it, or above it as
/// a resource
fn resource_path_free(registry: &HashMap<String, Entry>, key: &str) -> bool {
    let dir = uri::directory_key(key);
    !registry.contains_key(key)
        && !registry.contains_key(&dir)
        && !registry.keys().any(|k| uri::child_under(&dir, k).is_some())
        && resource_above(registry, key).is_none()
}

impl DistributionTask {
    /// Register a new, empty resource and announce it
    ///
    /// Returns `None` if the path is already a resource or a directory
    /// (explicit or implied by a descendant), or lies below a resource.
    pub async fn create_resource(&self, raw_uri: &str) -> Option<Arc<Resource>> {
        let key = resource_key(raw_uri)?;
        let resource = self.register_resource(&key, None).await?;

        self.emit(DistributionEvent::ResourceAdded(ResourceAddedEvent {
            uri: key.clone(),
            origin: None,
        }))
        .await;
        self.notify_peers(&key, Notification::Exists).await;
        Some(resource)
    }

    /// Insert a resource entry unless the path is taken
    pub(crate) async fn register_resource(
        &self,
        key: &str,
        chunk_count: Option<u32>,
    ) -> Option<Arc<Resource>> {
        let resource = self.insert_resource(self.new_resource(key, chunk_count)).await?;
        debug!(uri = %key, chunk_count = ?chunk_count, "resource registered");
        Some(resource)
    }

    async fn insert_resource(&self, resource: Arc<Resource>) -> Option<Arc<Resource>> {
        let key = resource.uri();
        let mut registry = self.registry.lock().await;
        if !resource_path_free(&registry, key) {
            debug!(uri = %key, "resource path taken");
            return None;
        }
        registry.insert(key.to_string(), Entry::Resource(resource.clone()));
        Some(resource)
    }

    /// Register a directory
    ///
    /// Idempotent: an existing directory returns its key again. Returns
    /// `None` when a resource occupies the path or one of its ancestors.
    pub async fn create_directory(&self, raw_uri: &str) -> Option<String> {
        let key = uri::directory_key(raw_uri);
        let mut registry = self.registry.lock().await;

        if !uri::is_root(&key)
            && (registry.contains_key(uri::trim_trailing_slash(&key))
                || resource_above(&registry, &key).is_some())
        {
            return None;
        }
        if !registry.contains_key(&key) {
            registry.insert(
                key.clone(),
                Entry::Directory(DirectoryEntry {
                    uri: key.clone(),
                    provider: None,
                }),
            );
            debug!(uri = %key, "directory created");
        }
        Some(key)
    }

    /// Attach a provider to a directory (explicit or implicit)
    pub async fn set_resource_provider(
        &self,
        dir: &str,
        provider: Arc<dyn ResourceProvider>,
    ) -> bool {
        if !self.is_directory(dir).await {
            warn!(uri = %dir, "cannot set provider: not a directory");
            return false;
        }

        let key = uri::directory_key(dir);
        let mut registry = self.registry.lock().await;
        match registry.get_mut(&key) {
            Some(Entry::Directory(entry)) => {
                entry.provider = Some(provider);
                true
            }
            // the root is a directory without an entry
            _ => {
                registry.insert(
                    key.clone(),
                    Entry::Directory(DirectoryEntry {
                        uri: key,
                        provider: Some(provider),
                    }),
                );
                true
            }
        }
    }

    /// Delete a resource everywhere
    ///
    /// Drops the stored chunks first; if that fails the entry stays
    /// registered and `false` is returned. Otherwise the entry is removed,
    /// its memory released and peers are told to invalidate it. The root and
    /// unknown paths return `false`.
    pub async fn delete_resource(&self, raw_uri: &str) -> bool {
        let Some(key) = resource_key(raw_uri) else {
            return false;
        };

        let resource = match self.registry.lock().await.get(&key) {
            Some(Entry::Resource(resource)) => resource.clone(),
            _ => return false,
        };

        if let Err(e) = self.store.delete_resource(&key).await {
            warn!(error = %e, uri = %key, "failed to delete stored chunks");
            return false;
        }

        {
            let mut registry = self.registry.lock().await;
            if matches!(registry.get(&key), Some(Entry::Resource(r)) if Arc::ptr_eq(r, &resource))
            {
                registry.remove(&key);
            }
        }
        resource.clear().await;

        self.notify_peers(&key, Notification::Invalidated).await;
        info!(uri = %key, "resource deleted");
        true
    }

    /// Delete every descendant of a directory, then the directory itself
    ///
    /// Best effort and not atomic: children that were deleted stay deleted
    /// when a sibling fails, and `false` is returned. The directory entry is
    /// kept in that case. The root directory entry is never removed.
    pub fn delete_directory<'a>(&'a self, raw_uri: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let key = uri::directory_key(raw_uri);
            let mut deleted = true;

            for child in self.get_children(&key).await {
                if self.is_directory(&child).await && !self.delete_directory(&child).await {
                    deleted = false;
                }
                if self.has_resource(&child).await && !self.delete_resource(&child).await {
                    deleted = false;
                }
            }

            if deleted && !uri::is_root(&key) {
                self.registry.lock().await.remove(&key);
            }
            if !deleted {
                warn!(uri = %key, "directory only partially deleted");
            }
            deleted
        })
    }

    async fn has_resource(&self, key: &str) -> bool {
        matches!(
            self.registry.lock().await.get(key),
            Some(Entry::Resource(_))
        )
    }

    /// Whether `uri` is a directory
    ///
    /// True for the root, for registered directories and for any path with a
    /// registered descendant. The last case registers the directory.
    pub async fn is_directory(&self, raw_uri: &str) -> bool {
        let key = uri::directory_key(raw_uri);
        if uri::is_root(&key) {
            return true;
        }

        let mut registry = self.registry.lock().await;
        if matches!(registry.get(&key), Some(Entry::Directory(_))) {
            return true;
        }

        let has_children = registry
            .keys()
            .any(|k| uri::child_under(&key, k).is_some());
        if has_children {
            registry.insert(
                key.clone(),
                Entry::Directory(DirectoryEntry {
                    uri: key,
                    provider: None,
                }),
            );
        }
        has_children
    }

    /// Immediate children of a directory, sorted, without trailing slashes
    pub async fn get_children(&self, raw_uri: &str) -> Vec<String> {
        let key = uri::directory_key(raw_uri);
        let registry = self.registry.lock().await;
        let children: BTreeSet<String> = registry
            .keys()
            .filter_map(|k| uri::child_under(&key, k))
            .collect();
        children.into_iter().collect()
    }

    /// Parent directory of `uri`, `None` for the root
    pub fn get_parent(&self, raw_uri: &str) -> Option<String> {
        uri::parent_of(&uri::normalize(raw_uri))
    }

    /// Look up a resource
    ///
    /// A directory with a provider hands the lookup to the provider. When
    /// `exclude` is set it is recorded on the resource so its next remote
    /// fetch skips that peer.
    pub async fn get_resource(
        &self,
        raw_uri: &str,
        exclude: Option<PeerId>,
    ) -> Option<Arc<Resource>> {
        let path = uri::normalize(raw_uri);

        let (found, provider) = {
            let registry = self.registry.lock().await;
            match registry.get(uri::trim_trailing_slash(&path)) {
                Some(Entry::Resource(resource)) => (Some(resource.clone()), None),
                _ => match registry.get(&uri::directory_key(&path)) {
                    Some(Entry::Directory(dir)) => (None, dir.provider.clone()),
                    _ => (None, None),
                },
            }
        };

        let resource = match (found, provider) {
            (Some(resource), _) => resource,
            (None, Some(provider)) => provider.load_resource(&path, exclude.as_ref()).await?,
            (None, None) => return None,
        };

        if exclude.is_some() {
            resource.set_exclude_host(exclude).await;
        }
        Some(resource)
    }

    /// Register `/files/` and every resource already in the chunk store
    ///
    /// Resources with a recorded size come back with that size. Returns the
    /// number of resources registered.
    pub async fn init_from_store(&self) -> Result<usize, TaskError> {
        self.create_directory(FILES_DIR).await;

        let mut registered = 0;
        for stored in self.store.list_resources().await? {
            let Some(key) = resource_key(&stored) else {
                continue;
            };
            let resource = match self.store.query_resource_size(&key).await {
                Ok(Some(total)) => Arc::new(Resource::with_total_bytes(
                    key.as_str(),
                    self.ctx.clone(),
                    total,
                )),
                Ok(None) => self.new_resource(&key, None),
                Err(e) => {
                    warn!(error = %e, uri = %key, "resource size query failed");
                    self.new_resource(&key, None)
                }
            };
            if self.insert_resource(resource).await.is_some() {
                registered += 1;
            }
        }

        debug!(resources = registered, "registry loaded from store");
        Ok(registered)
    }

    /// Open a byte sink that replaces the contents of `uri`
    ///
    /// The resource is created if needed. Bytes written to the returned
    /// stream are chunked and stored by a loader task; dropping or shutting
    /// down the stream ends the load, after which the resource is announced
    /// again with its final size. The handle resolves to the bytes loaded.
    pub async fn open_writer(
        self: &Arc<Self>,
        raw_uri: &str,
    ) -> Result<(DuplexStream, JoinHandle<Result<u64, ResourceError>>), TaskError> {
        self.check_running().await?;

        let resource = match self.get_resource(raw_uri, None).await {
            Some(resource) => resource,
            None => self
                .create_resource(raw_uri)
                .await
                .ok_or_else(|| TaskError::InvalidInput(raw_uri.to_string()))?,
        };

        let (writer, reader) = tokio::io::duplex(CHUNK_SIZE);
        let task = Arc::clone(self);
        let loader = tokio::spawn(async move {
            let result = resource.load_from_stream(reader).await;
            match &result {
                Ok(bytes) => {
                    info!(uri = %resource.uri(), bytes, "resource loaded");
                    task.notify_peers(resource.uri(), Notification::Exists).await;
                }
                Err(e) => warn!(error = %e, uri = %resource.uri(), "resource load failed"),
            }
            result
        });

        Ok((writer, loader))
    }

    /// Evict least recently used resources until the cache is under its limit
    ///
    /// Evicted resources stay registered; their chunks are reloaded from the
    /// store or peers on the next read. Returns the number evicted.
    pub async fn check_full(&self) -> usize {
        let cache = &self.ctx.cache;
        if !cache.is_over() {
            return 0;
        }

        let mut resources: Vec<Arc<Resource>> = {
            let registry = self.registry.lock().await;
            registry
                .values()
                .filter_map(|entry| match entry {
                    Entry::Resource(resource) => Some(resource.clone()),
                    Entry::Directory(_) => None,
                })
                .collect()
        };
        resources.sort_by_key(|r| r.last_access());

        let mut evicted = 0;
        for resource in resources {
            if !cache.is_over() {
                break;
            }
            let released = resource.clear().await;
            if released > 0 {
                debug!(uri = %resource.uri(), bytes = released, "evicted resource");
                evicted += 1;
            }
        }

        info!(
            evicted,
            cached = cache.total(),
            max = cache.max_bytes(),
            "cache eviction finished"
        );
        evicted
    }
}
