//! UI affordance attached to each discovered video: the enable control, the
//! canvas that covers the video and the notification area.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info};

use crate::canvas::{Canvas, OffscreenCanvas};
use crate::errors::Notification;
use crate::schema::Dimensions;
use crate::video::VideoSource;

/// What the enable/disable control shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    /// Activation in flight. The control is busy and ignores clicks.
    Enhancing,
    Active,
    /// Previous activation failed; clicking tries again.
    Retry,
}

impl ControlState {
    pub fn is_busy(self) -> bool {
        self == Self::Enhancing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum InitProgress {
    AcquiringGpu,
    LoadingEffect { index: usize, total: usize },
    Ready,
}

pub trait Overlay: Send + Sync {
    fn canvas(&self) -> Arc<dyn Canvas>;

    fn set_control(&self, state: ControlState);

    fn set_applied(&self, applied: bool);

    fn show_canvas(&self);

    fn hide_canvas(&self);

    fn notify(&self, notification: Notification);

    fn report_progress(&self, progress: InitProgress) {
        debug!(?progress, "initialization progress");
    }

    /// Detaches every element the overlay added to the page.
    fn remove(&self);
}

pub trait OverlayFactory: Send + Sync {
    fn create(&self, video: &dyn VideoSource) -> Arc<dyn Overlay>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySnapshot {
    pub control: ControlState,
    pub applied: bool,
    pub canvas_visible: bool,
    pub removed: bool,
    pub notifications: Vec<Notification>,
    pub progress: Vec<InitProgress>,
}

/// Overlay that records what a page overlay would display.
pub struct HeadlessOverlay {
    canvas: Arc<OffscreenCanvas>,
    state: Mutex<OverlaySnapshot>,
}

impl HeadlessOverlay {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            canvas: Arc::new(OffscreenCanvas::new(dimensions)),
            state: Mutex::new(OverlaySnapshot {
                control: ControlState::Idle,
                applied: false,
                canvas_visible: false,
                removed: false,
                notifications: Vec::new(),
                progress: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OverlaySnapshot> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn offscreen_canvas(&self) -> Arc<OffscreenCanvas> {
        Arc::clone(&self.canvas)
    }

    pub fn snapshot(&self) -> OverlaySnapshot {
        self.lock().clone()
    }
}

impl Overlay for HeadlessOverlay {
    fn canvas(&self) -> Arc<dyn Canvas> {
        self.canvas.clone()
    }

    fn set_control(&self, state: ControlState) {
        self.lock().control = state;
    }

    fn set_applied(&self, applied: bool) {
        self.lock().applied = applied;
    }

    fn show_canvas(&self) {
        self.lock().canvas_visible = true;
    }

    fn hide_canvas(&self) {
        self.lock().canvas_visible = false;
    }

    fn notify(&self, notification: Notification) {
        info!(message = %notification.message, action = ?notification.action, "notification");
        self.lock().notifications.push(notification);
    }

    fn report_progress(&self, progress: InitProgress) {
        self.lock().progress.push(progress);
    }

    fn remove(&self) {
        let mut state = self.lock();
        state.removed = true;
        state.canvas_visible = false;
    }
}

/// Creates a [`HeadlessOverlay`] per video and keeps a handle to each so callers
/// can inspect them.
#[derive(Default)]
pub struct HeadlessOverlayFactory {
    created: Mutex<Vec<(u64, Arc<HeadlessOverlay>)>>,
}

impl HeadlessOverlayFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent overlay created for the element.
    pub fn overlay_for(&self, element_key: u64) -> Option<Arc<HeadlessOverlay>> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|(key, _)| *key == element_key)
            .map(|(_, overlay)| Arc::clone(overlay))
    }

    pub fn created_count(&self) -> usize {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl OverlayFactory for HeadlessOverlayFactory {
    fn create(&self, video: &dyn VideoSource) -> Arc<dyn Overlay> {
        let overlay = Arc::new(HeadlessOverlay::new(video.native_dimensions()));
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((video.element_key(), Arc::clone(&overlay)));
        overlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_overlay_records_state() {
        let overlay = HeadlessOverlay::new(Dimensions::new(64, 36));
        overlay.set_control(ControlState::Enhancing);
        overlay.show_canvas();
        overlay.notify(Notification::new("boom"));
        overlay.report_progress(InitProgress::AcquiringGpu);

        let snapshot = overlay.snapshot();
        assert_eq!(snapshot.control, ControlState::Enhancing);
        assert!(snapshot.control.is_busy());
        assert!(snapshot.canvas_visible);
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.progress, vec![InitProgress::AcquiringGpu]);

        overlay.remove();
        let snapshot = overlay.snapshot();
        assert!(snapshot.removed);
        assert!(!snapshot.canvas_visible);
    }

    #[test]
    fn progress_serializes_with_phase_tag() {
        let json = serde_json::to_string(&InitProgress::LoadingEffect { index: 2, total: 4 })
            .expect("serialize");
        assert_eq!(json, r#"{"phase":"loading_effect","index":2,"total":4}"#);
    }
}
