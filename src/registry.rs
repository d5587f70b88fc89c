//! Ownership table from video elements to enhancers, plus the short-lived
//! stash for enhancers whose element left the page.
//!
//! Every mutation of the table happens synchronously under one lock before any
//! await, which is what keeps a single enhancer per element even when
//! discovery events race.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::enhancer::{EnhancerContext, VideoEnhancer, VideoId};
use crate::host::{HostBus, HostMessage};
use crate::video::{ElementKey, VideoSource};

/// How long a detached enhancer waits for its video to come back.
pub const STASH_TTL: Duration = Duration::from_secs(2);

/// How a video was matched to an enhancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    Existing,
    /// A stashed enhancer with the same source URL was revived.
    Revived,
    Created,
}

struct StashEntry {
    serial: u64,
    source: Url,
    enhancer: VideoEnhancer,
    expiry: JoinHandle<()>,
}

#[derive(Default)]
struct Tables {
    by_element: HashMap<ElementKey, VideoId>,
    enhancers: BTreeMap<VideoId, VideoEnhancer>,
    stash: Vec<StashEntry>,
}

struct RegistryInner {
    context: EnhancerContext,
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    next_serial: AtomicU64,
    stash_ttl: Duration,
}

#[derive(Clone)]
pub struct EnhancerRegistry {
    inner: Arc<RegistryInner>,
}

impl EnhancerRegistry {
    pub fn new(context: EnhancerContext) -> Self {
        Self::with_stash_ttl(context, STASH_TTL)
    }

    pub fn with_stash_ttl(context: EnhancerContext, stash_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                context,
                tables: Mutex::new(Tables::default()),
                next_id: AtomicU64::new(1),
                next_serial: AtomicU64::new(1),
                stash_ttl,
            }),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock_tables(&self.inner)
    }

    pub fn get(&self, element: ElementKey) -> Option<VideoEnhancer> {
        let tables = self.tables();
        let id = tables.by_element.get(&element)?;
        tables.enhancers.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables().by_element.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stashed_count(&self) -> usize {
        self.tables().stash.len()
    }

    pub fn is_stashed(&self, source: &Url) -> bool {
        self.tables().stash.iter().any(|entry| &entry.source == source)
    }

    pub fn enhancers(&self) -> Vec<VideoEnhancer> {
        self.tables().enhancers.values().cloned().collect()
    }

    /// Finds or creates the enhancer for `video`. A stashed enhancer with the
    /// same source URL is revived and re-pointed at the new element.
    pub async fn discover(&self, video: Arc<dyn VideoSource>) -> (VideoEnhancer, Discovery) {
        let (enhancer, discovery) = self.register(&video);
        if discovery == Discovery::Revived {
            if let Err(error) = enhancer.reattach(video).await {
                warn!(id = %enhancer.id(), error = %format!("{error:#}"), "reattach failed");
            }
        }
        (enhancer, discovery)
    }

    fn register(&self, video: &Arc<dyn VideoSource>) -> (VideoEnhancer, Discovery) {
        let element = video.element_key();
        let mut tables = self.tables();
        if let Some(existing) = tables
            .by_element
            .get(&element)
            .and_then(|id| tables.enhancers.get(id))
        {
            return (existing.clone(), Discovery::Existing);
        }

        if let Some(source) = video.source_url() {
            if let Some(index) = tables.stash.iter().position(|entry| entry.source == source) {
                let entry = tables.stash.remove(index);
                entry.expiry.abort();
                info!(id = %entry.enhancer.id(), %source, "reviving stashed enhancer");
                tables.by_element.insert(element, entry.enhancer.id());
                tables
                    .enhancers
                    .insert(entry.enhancer.id(), entry.enhancer.clone());
                return (entry.enhancer, Discovery::Revived);
            }
        }

        let id = VideoId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let enhancer = VideoEnhancer::new(id, Arc::clone(video), self.inner.context.clone());
        tables.by_element.insert(element, id);
        tables.enhancers.insert(id, enhancer.clone());
        debug!(%id, element, "registered enhancer");
        (enhancer, Discovery::Created)
    }

    /// Requests enhancement for `video`. The enhancer is registered before any
    /// asynchronous setup, so racing calls share one enhancer and one activation.
    pub async fn enhance(&self, video: Arc<dyn VideoSource>) -> Result<VideoEnhancer> {
        let (enhancer, _) = self.discover(video).await;
        if enhancer.phase() == crate::enhancer::EnhancerPhase::Inactive {
            enhancer.toggle_enhancement().await?;
        }
        Ok(enhancer)
    }

    /// The element left the page. Active enhancers with a source URL are
    /// stashed for [`STASH_TTL`]; everything else is destroyed now.
    pub async fn detach(&self, element: ElementKey) {
        let to_destroy = {
            let mut tables = self.tables();
            let Some(id) = tables.by_element.remove(&element) else {
                return;
            };
            let Some(enhancer) = tables.enhancers.remove(&id) else {
                return;
            };
            match enhancer.source_url().filter(|_| enhancer.is_active()) {
                Some(source) => {
                    enhancer.detach();
                    let serial = self.inner.next_serial.fetch_add(1, Ordering::SeqCst);
                    let expiry = spawn_expiry(
                        Arc::downgrade(&self.inner),
                        serial,
                        self.inner.stash_ttl,
                    );
                    info!(%id, %source, ttl = ?self.inner.stash_ttl, "stashing enhancer");
                    tables.stash.push(StashEntry {
                        serial,
                        source,
                        enhancer,
                        expiry,
                    });
                    None
                }
                None => Some(enhancer),
            }
        };
        if let Some(enhancer) = to_destroy {
            enhancer.destroy().await;
        }
    }

    /// Reloads settings and forwards them to active enhancers, optionally only
    /// those running `mode_id`. Returns how many renderers changed.
    pub async fn update_settings(&self, mode_id: Option<&str>) -> Result<usize> {
        let settings = self.inner.context.settings.load().await?;
        let mut updated = 0;
        for enhancer in self.enhancers() {
            if !enhancer.is_active() {
                continue;
            }
            if let Some(scope) = mode_id {
                if enhancer.current_mode_id().as_deref() != Some(scope) {
                    continue;
                }
            }
            match enhancer.update_settings(&settings).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(id = %enhancer.id(), error = %format!("{error:#}"), "settings update failed")
                }
            }
        }
        info!(updated, scope = ?mode_id, "settings update applied");
        Ok(updated)
    }

    /// Consumes host messages until the bus closes or the registry is dropped.
    pub fn listen(&self, bus: &HostBus) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let message = match receiver.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "host messages dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let registry = EnhancerRegistry { inner };
                match message {
                    HostMessage::SettingsUpdated { mode_id } => {
                        if let Err(error) = registry.update_settings(mode_id.as_deref()).await {
                            warn!(error = %format!("{error:#}"), "failed to apply settings update");
                        }
                    }
                    HostMessage::OpenOptionsPage => {
                        debug!("options page requested; handled by the host");
                    }
                }
            }
            debug!("host listener stopped");
        })
    }

    /// Destroys every registered and stashed enhancer.
    pub async fn destroy_all(&self) {
        let enhancers: Vec<VideoEnhancer> = {
            let mut tables = self.tables();
            tables.by_element.clear();
            let stashed = std::mem::take(&mut tables.stash).into_iter().map(|entry| {
                entry.expiry.abort();
                entry.enhancer
            });
            let registered = std::mem::take(&mut tables.enhancers).into_values();
            registered.chain(stashed).collect()
        };
        for enhancer in enhancers {
            enhancer.destroy().await;
        }
    }
}

fn lock_tables(inner: &RegistryInner) -> MutexGuard<'_, Tables> {
    inner
        .tables
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_expiry(inner: Weak<RegistryInner>, serial: u64, ttl: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let expired = {
            let mut tables = lock_tables(&inner);
            tables
                .stash
                .iter()
                .position(|entry| entry.serial == serial)
                .map(|index| tables.stash.remove(index))
        };
        if let Some(entry) = expired {
            info!(id = %entry.enhancer.id(), source = %entry.source, "stash expired; destroying enhancer");
            entry.enhancer.destroy().await;
        }
    })
}
