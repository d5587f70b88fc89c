//! Per-video enhancement state machine.
//!
//! A [`VideoEnhancer`] owns the overlay of one video and at most one renderer.
//! It is created on discovery, becomes active when the user turns enhancement
//! on, and may be detached and re-pointed at an equivalent element while its
//! renderer keeps running.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};
use url::Url;

use crate::catalog_loader::CatalogLoader;
use crate::effect_chain;
use crate::errors::{Notification, RendererError};
use crate::overlay::{ControlState, InitProgress, Overlay, OverlayFactory};
use crate::renderer::{
    Renderer, RendererCallbacks, RendererConfiguration, RendererOptions,
};
use crate::settings::{Settings, SettingsStore};
use crate::video::VideoSource;

/// Stable identity assigned to a video on first discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VideoId(pub u64);

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "video-{}", self.0)
    }
}

/// The renderer operations an enhancer relies on.
#[async_trait]
pub trait RenderSession: Send + Sync {
    async fn update_configuration(&self, config: RendererConfiguration) -> Result<bool>;

    async fn update_video_source(&self, video: Arc<dyn VideoSource>) -> Result<()>;

    async fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

#[async_trait]
impl RenderSession for Renderer {
    async fn update_configuration(&self, config: RendererConfiguration) -> Result<bool> {
        Renderer::update_configuration(self, config).await
    }

    async fn update_video_source(&self, video: Arc<dyn VideoSource>) -> Result<()> {
        Renderer::update_video_source(self, video).await
    }

    async fn destroy(&self) {
        Renderer::destroy(self).await;
    }

    fn is_destroyed(&self) -> bool {
        Renderer::is_destroyed(self)
    }
}

#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn create(
        &self,
        options: RendererOptions,
    ) -> Result<Arc<dyn RenderSession>, RendererError>;
}

/// Creates real GPU renderers.
#[derive(Debug, Default)]
pub struct GpuRendererFactory;

#[async_trait]
impl RendererFactory for GpuRendererFactory {
    async fn create(
        &self,
        options: RendererOptions,
    ) -> Result<Arc<dyn RenderSession>, RendererError> {
        let renderer = Renderer::create(options).await?;
        Ok(Arc::new(renderer))
    }
}

/// Collaborators shared by every enhancer of a page.
#[derive(Clone)]
pub struct EnhancerContext {
    pub settings: Arc<dyn SettingsStore>,
    pub catalog: Arc<CatalogLoader>,
    pub renderers: Arc<dyn RendererFactory>,
    pub overlays: Arc<dyn OverlayFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancerPhase {
    Inactive,
    /// Activation is in flight.
    Requested,
    Active,
    Destroyed,
}

struct EnhancerState {
    phase: EnhancerPhase,
    session: Option<Arc<dyn RenderSession>>,
    mode_id: Option<String>,
}

struct Inner {
    id: VideoId,
    context: EnhancerContext,
    video: Mutex<Arc<dyn VideoSource>>,
    overlay: Arc<dyn Overlay>,
    state: Mutex<EnhancerState>,
    /// Bumped whenever the current session ends; stale continuations compare
    /// against it and back out.
    generation: AtomicU64,
    detached: AtomicBool,
}

#[derive(Clone)]
pub struct VideoEnhancer {
    inner: Arc<Inner>,
}

impl VideoEnhancer {
    pub fn new(id: VideoId, video: Arc<dyn VideoSource>, context: EnhancerContext) -> Self {
        let overlay = context.overlays.create(video.as_ref());
        overlay.set_control(ControlState::Idle);
        debug!(%id, element = video.element_key(), "enhancer created");
        Self {
            inner: Arc::new(Inner {
                id,
                context,
                video: Mutex::new(video),
                overlay,
                state: Mutex::new(EnhancerState {
                    phase: EnhancerPhase::Inactive,
                    session: None,
                    mode_id: None,
                }),
                generation: AtomicU64::new(0),
                detached: AtomicBool::new(false),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, EnhancerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> VideoId {
        self.inner.id
    }

    pub fn video(&self) -> Arc<dyn VideoSource> {
        Arc::clone(
            &self
                .inner
                .video
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn source_url(&self) -> Option<Url> {
        self.video().source_url()
    }

    pub fn overlay(&self) -> Arc<dyn Overlay> {
        Arc::clone(&self.inner.overlay)
    }

    pub fn phase(&self) -> EnhancerPhase {
        self.state().phase
    }

    pub fn is_active(&self) -> bool {
        self.phase() == EnhancerPhase::Active
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase() == EnhancerPhase::Destroyed
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::SeqCst)
    }

    pub fn current_mode_id(&self) -> Option<String> {
        self.state().mode_id.clone()
    }

    pub fn session(&self) -> Option<Arc<dyn RenderSession>> {
        self.state().session.clone()
    }

    pub fn ptr_eq(&self, other: &VideoEnhancer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Turns enhancement off when active, otherwise starts it. A second call
    /// while activation is in flight is ignored.
    pub async fn toggle_enhancement(&self) -> Result<()> {
        let phase = {
            let mut state = self.state();
            let phase = state.phase;
            if phase == EnhancerPhase::Inactive {
                state.phase = EnhancerPhase::Requested;
            }
            phase
        };
        match phase {
            EnhancerPhase::Inactive => {}
            EnhancerPhase::Active => {
                info!(id = %self.id(), "disabling enhancement");
                self.disable().await;
                return Ok(());
            }
            EnhancerPhase::Requested => {
                debug!(id = %self.id(), "activation already in progress");
                return Ok(());
            }
            EnhancerPhase::Destroyed => return Ok(()),
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);

        info!(id = %self.id(), "starting enhancement");
        self.inner.overlay.set_control(ControlState::Enhancing);

        match self.activate(generation).await {
            Ok(Some((session, mode_id))) => {
                let accepted = {
                    let mut state = self.state();
                    let current = state.phase == EnhancerPhase::Requested
                        && self.inner.generation.load(Ordering::SeqCst) == generation;
                    if current {
                        state.phase = EnhancerPhase::Active;
                        state.session = Some(Arc::clone(&session));
                        state.mode_id = Some(mode_id);
                    }
                    current
                };
                if !accepted {
                    session.destroy().await;
                    return Ok(());
                }
                self.inner.overlay.set_applied(true);
                self.inner.overlay.set_control(ControlState::Active);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(failure) => {
                error!(id = %self.id(), error = %format!("{failure:#}"), "failed to start enhancement");
                self.disable().await;
                self.inner.overlay.set_control(ControlState::Retry);
                self.inner.overlay.notify(Notification::from_error(&failure));
                Err(failure)
            }
        }
    }

    /// Loads settings and the algorithm library, then builds a renderer.
    /// Returns `None` when the enhancer was disabled or destroyed meanwhile.
    async fn activate(
        &self,
        generation: u64,
    ) -> Result<Option<(Arc<dyn RenderSession>, String)>> {
        let context = &self.inner.context;
        let (settings, library) = tokio::try_join!(
            async { context.settings.load().await.context("failed to load settings") },
            async {
                context
                    .catalog
                    .load()
                    .await
                    .context("failed to load the enhancement algorithms")
            },
        )?;
        if self.is_stale(generation) {
            return Ok(None);
        }

        let video = self.video();
        let mode = settings.selected_mode();
        let effects = settings.effects_for(mode);
        let native = video.native_dimensions();
        let target = settings.target_dimensions(native);
        let canvas = self.inner.overlay.canvas();
        canvas.resize(target);
        info!(
            id = %self.id(),
            mode = mode.name(),
            chain = %effect_chain::effect_chain_summary(&effects),
            %native,
            %target,
            "building renderer"
        );

        let options = RendererOptions {
            video,
            canvas,
            effects,
            target,
            library,
            cross_origin_fix: settings.cross_origin_fix,
            callbacks: self.callbacks(generation),
        };
        let session = context.renderers.create(options).await?;

        if self.is_stale(generation) {
            debug!(id = %self.id(), "enhancement cancelled during setup; releasing renderer");
            session.destroy().await;
            return Ok(None);
        }
        Ok(Some((session, mode.id().to_owned())))
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) != generation || self.is_destroyed()
    }

    fn callbacks(&self, generation: u64) -> RendererCallbacks {
        let on_error = {
            let weak = Arc::downgrade(&self.inner);
            Arc::new(move |failure: RendererError| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    VideoEnhancer { inner }
                        .handle_renderer_error(generation, failure)
                        .await;
                });
            })
        };
        let on_first_frame = {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.overlay.show_canvas();
                }
            })
        };
        let on_progress = {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            Arc::new(move |progress: InitProgress| {
                if let Some(inner) = weak.upgrade() {
                    inner.overlay.report_progress(progress);
                }
            })
        };
        RendererCallbacks {
            on_error,
            on_first_frame,
            on_progress,
        }
    }

    async fn handle_renderer_error(&self, generation: u64, failure: RendererError) {
        if self.is_stale(generation) {
            debug!(id = %self.id(), %failure, "ignoring error from a previous renderer");
            return;
        }
        error!(id = %self.id(), %failure, code = failure.code(), "renderer runtime error");
        if let Some(notification) = failure.notification() {
            self.inner.overlay.notify(notification);
        }
        self.disable().await;
    }

    /// Applies changed settings to the running renderer. Returns `false` when
    /// nothing is running or nothing changed.
    pub async fn update_settings(&self, settings: &Settings) -> Result<bool> {
        let Some(session) = self.session() else {
            return Ok(false);
        };
        let mode = settings.selected_mode();
        let native = self.video().native_dimensions();
        let config = RendererConfiguration {
            effects: settings.effects_for(mode),
            target: settings.target_dimensions(native),
        };
        let changed = session.update_configuration(config).await?;
        self.state().mode_id = Some(mode.id().to_owned());
        if changed {
            info!(id = %self.id(), mode = mode.name(), "renderer updated to new settings");
        }
        Ok(changed)
    }

    /// The element left the page. The renderer keeps running until the
    /// enhancer is reattached or destroyed.
    pub fn detach(&self) {
        if !self.inner.detached.swap(true, Ordering::SeqCst) {
            debug!(id = %self.id(), "enhancer detached");
            self.inner.overlay.hide_canvas();
        }
    }

    /// Re-points the enhancer at an equivalent element.
    pub async fn reattach(&self, video: Arc<dyn VideoSource>) -> Result<()> {
        {
            let mut current = self
                .inner
                .video
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = Arc::clone(&video);
        }
        self.inner.detached.store(false, Ordering::SeqCst);
        if let Some(session) = self.session() {
            session
                .update_video_source(video)
                .await
                .context("failed to move renderer to the reattached video")?;
            self.inner.overlay.show_canvas();
        }
        info!(id = %self.id(), "enhancer reattached");
        Ok(())
    }

    /// Stops the renderer and reverts the overlay to its idle state.
    async fn disable(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = {
            let mut state = self.state();
            if state.phase != EnhancerPhase::Destroyed {
                state.phase = EnhancerPhase::Inactive;
            }
            state.mode_id = None;
            state.session.take()
        };
        if let Some(session) = session {
            session.destroy().await;
        }
        self.inner.overlay.hide_canvas();
        self.inner.overlay.set_applied(false);
        self.inner.overlay.set_control(ControlState::Idle);
    }

    /// Disables enhancement and removes the overlay. Safe to call repeatedly.
    pub async fn destroy(&self) {
        {
            let mut state = self.state();
            if state.phase == EnhancerPhase::Destroyed {
                return;
            }
            state.phase = EnhancerPhase::Destroyed;
        }
        info!(id = %self.id(), "destroying enhancer");
        self.disable().await;
        self.inner.overlay.remove();
    }
}

impl std::fmt::Debug for VideoEnhancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoEnhancer")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .field("detached", &self.is_detached())
            .finish()
    }
}
