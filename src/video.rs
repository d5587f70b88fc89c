//! Host video element abstraction and a synthetic implementation.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::schema::Dimensions;

/// Opaque identity of a host video element.
pub type ElementKey = u64;

/// Playback readiness, ordered like the media element states it mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub dimensions: Dimensions,
    /// Tightly packed RGBA8, `dimensions.width * 4` bytes per row.
    pub rgba: Arc<[u8]>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameAccessError {
    #[error("video frame pixels are cross-origin protected")]
    CrossOrigin,
    #[error("video frame could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    fn element_key(&self) -> ElementKey;

    fn source_url(&self) -> Option<Url>;

    fn ready_state(&self) -> ReadyState;

    fn native_dimensions(&self) -> Dimensions;

    /// Pixels of the frame currently on screen, or `None` before the first frame.
    fn current_frame(&self) -> Result<Option<VideoFrame>, FrameAccessError>;

    /// Resolves once enough data is buffered to keep playing (`HaveFutureData`).
    async fn wait_until_loaded(&self);

    /// Per-frame callback. Stays pending while the video is paused.
    async fn next_frame(&self) -> u64;

    /// Reloads the element with an anonymous cross-origin request.
    async fn reload_anonymous_cors(&self) -> Result<()>;
}

struct SyntheticState {
    native: Dimensions,
    frame_override: Option<Dimensions>,
    url: Option<Url>,
    playing: bool,
    tainted: bool,
    cors_reload_clears_taint: bool,
    cors_reloads: u32,
    still: Option<RgbaImage>,
    scaled_still: Option<(Dimensions, Arc<[u8]>)>,
}

/// Procedural or still-image video used by the CLI, benches and tests.
///
/// Frames advance through [`SyntheticVideo::advance`] or a playback task from
/// [`SyntheticVideo::play`]. Every control that a real page could change under
/// the renderer (resolution, taint, readiness) is exposed.
pub struct SyntheticVideo {
    key: ElementKey,
    state: Mutex<SyntheticState>,
    ready: watch::Sender<ReadyState>,
    frames: watch::Sender<u64>,
}

static NEXT_ELEMENT_KEY: AtomicU64 = AtomicU64::new(1);

impl SyntheticVideo {
    pub fn new(native: Dimensions, url: Option<Url>) -> Arc<Self> {
        Arc::new(Self::build(native, url, None))
    }

    /// Still image repeated on every frame, rescaled to the current native size.
    pub fn from_image(path: &Path, url: Option<Url>) -> Result<Arc<Self>> {
        let still = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?
            .to_rgba8();
        let native = Dimensions::new(still.width(), still.height());
        info!(path = %path.display(), %native, "loaded still video frame");
        Ok(Arc::new(Self::build(native, url, Some(still))))
    }

    fn build(native: Dimensions, url: Option<Url>, still: Option<RgbaImage>) -> Self {
        let (ready, _) = watch::channel(ReadyState::HaveEnoughData);
        let (frames, _) = watch::channel(0);
        Self {
            key: NEXT_ELEMENT_KEY.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SyntheticState {
                native,
                frame_override: None,
                url,
                playing: true,
                tainted: false,
                cors_reload_clears_taint: true,
                cors_reloads: 0,
                still,
                scaled_still: None,
            }),
            ready,
            frames,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyntheticState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.ready.send_replace(state);
    }

    /// Presents the next frame if playing. Returns the new frame sequence.
    pub fn advance(&self) -> u64 {
        if !self.lock().playing {
            return *self.frames.borrow();
        }
        let mut sequence = 0;
        self.frames.send_modify(|value| {
            *value += 1;
            sequence = *value;
        });
        sequence
    }

    pub fn pause(&self) {
        self.lock().playing = false;
    }

    pub fn resume(&self) {
        self.lock().playing = true;
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    pub fn frame_sequence(&self) -> u64 {
        *self.frames.borrow()
    }

    /// Spawns a task that advances at `fps` until the video is dropped.
    pub fn play(self: &Arc<Self>, fps: f64) -> JoinHandle<()> {
        let video: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(video) = video.upgrade() else {
                    break;
                };
                video.advance();
            }
        })
    }

    /// Adaptive-bitrate style resolution switch.
    pub fn set_native_dimensions(&self, native: Dimensions) {
        let mut state = self.lock();
        debug!(from = %state.native, to = %native, "synthetic video resolution switch");
        state.native = native;
    }

    /// Makes frames report `dimensions` while metadata still reports the old size.
    pub fn set_frame_dimensions(&self, dimensions: Option<Dimensions>) {
        self.lock().frame_override = dimensions;
    }

    pub fn set_source_url(&self, url: Option<Url>) {
        self.lock().url = url;
    }

    pub fn set_tainted(&self, tainted: bool, cors_reload_clears_taint: bool) {
        let mut state = self.lock();
        state.tainted = tainted;
        state.cors_reload_clears_taint = cors_reload_clears_taint;
    }

    pub fn cors_reloads(&self) -> u32 {
        self.lock().cors_reloads
    }
}

fn procedural_frame(dimensions: Dimensions, sequence: u64) -> Vec<u8> {
    let width = dimensions.width as usize;
    let height = dimensions.height as usize;
    let shift = (sequence % 256) as usize;
    let mut rgba = vec![0_u8; width * height * 4];
    for (index, pixel) in rgba.chunks_exact_mut(4).enumerate() {
        let x = index % width;
        let y = index / width;
        pixel[0] = ((x * 255 / width.max(1) + shift) % 256) as u8;
        pixel[1] = ((y * 255 / height.max(1)) % 256) as u8;
        pixel[2] = if (x / 16 + y / 16) % 2 == 0 { 220 } else { 40 };
        pixel[3] = 255;
    }
    rgba
}

#[async_trait]
impl VideoSource for SyntheticVideo {
    fn element_key(&self) -> ElementKey {
        self.key
    }

    fn source_url(&self) -> Option<Url> {
        self.lock().url.clone()
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.borrow()
    }

    fn native_dimensions(&self) -> Dimensions {
        self.lock().native
    }

    fn current_frame(&self) -> Result<Option<VideoFrame>, FrameAccessError> {
        if self.ready_state() < ReadyState::HaveCurrentData {
            return Ok(None);
        }
        let sequence = self.frame_sequence();
        let mut state = self.lock();
        if state.tainted {
            return Err(FrameAccessError::CrossOrigin);
        }
        let dimensions = state.frame_override.unwrap_or(state.native);
        let rgba: Arc<[u8]> = match &state.still {
            Some(still) => match &state.scaled_still {
                Some((cached, pixels)) if *cached == dimensions => Arc::clone(pixels),
                _ => {
                    let scaled = image::imageops::resize(
                        still,
                        dimensions.width,
                        dimensions.height,
                        image::imageops::FilterType::Triangle,
                    );
                    let pixels: Arc<[u8]> = scaled.into_raw().into();
                    state.scaled_still = Some((dimensions, Arc::clone(&pixels)));
                    pixels
                }
            },
            None => procedural_frame(dimensions, sequence).into(),
        };
        Ok(Some(VideoFrame {
            dimensions,
            rgba,
            sequence,
        }))
    }

    async fn wait_until_loaded(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this only ends on readiness.
        let _ = ready
            .wait_for(|state| *state >= ReadyState::HaveFutureData)
            .await;
    }

    async fn next_frame(&self) -> u64 {
        let mut frames = self.frames.subscribe();
        frames.borrow_and_update();
        if frames.changed().await.is_err() {
            return *frames.borrow();
        }
        let sequence = *frames.borrow_and_update();
        sequence
    }

    async fn reload_anonymous_cors(&self) -> Result<()> {
        let mut state = self.lock();
        state.cors_reloads += 1;
        if state.cors_reload_clears_taint {
            state.tainted = false;
        }
        info!(
            video = self.key,
            reloads = state.cors_reloads,
            "reloaded video with anonymous cross-origin request"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_states_are_ordered() {
        assert!(ReadyState::HaveNothing < ReadyState::HaveMetadata);
        assert!(ReadyState::HaveCurrentData < ReadyState::HaveFutureData);
        assert!(ReadyState::HaveFutureData < ReadyState::HaveEnoughData);
    }

    #[test]
    fn frames_match_native_size_unless_overridden() {
        let video = SyntheticVideo::new(Dimensions::new(32, 16), None);
        let frame = video.current_frame().unwrap().expect("frame");
        assert_eq!(frame.dimensions, Dimensions::new(32, 16));
        assert_eq!(frame.rgba.len(), 32 * 16 * 4);

        video.set_frame_dimensions(Some(Dimensions::new(64, 32)));
        let frame = video.current_frame().unwrap().expect("frame");
        assert_eq!(frame.dimensions, Dimensions::new(64, 32));
        assert_eq!(video.native_dimensions(), Dimensions::new(32, 16));
    }

    #[test]
    fn no_frame_before_current_data() {
        let video = SyntheticVideo::new(Dimensions::new(8, 8), None);
        video.set_ready_state(ReadyState::HaveMetadata);
        assert_eq!(video.current_frame().unwrap(), None);
    }

    #[test]
    fn paused_video_does_not_advance() {
        let video = SyntheticVideo::new(Dimensions::new(8, 8), None);
        assert_eq!(video.advance(), 1);
        video.pause();
        assert_eq!(video.advance(), 1);
        video.resume();
        assert_eq!(video.advance(), 2);
    }

    #[tokio::test]
    async fn cors_reload_clears_taint_when_allowed() {
        let video = SyntheticVideo::new(Dimensions::new(8, 8), None);
        video.set_tainted(true, true);
        assert_eq!(video.current_frame(), Err(FrameAccessError::CrossOrigin));
        video.reload_anonymous_cors().await.unwrap();
        assert!(video.current_frame().is_ok());
        assert_eq!(video.cors_reloads(), 1);

        video.set_tainted(true, false);
        video.reload_anonymous_cors().await.unwrap();
        assert_eq!(video.current_frame(), Err(FrameAccessError::CrossOrigin));
    }

    #[tokio::test]
    async fn next_frame_resolves_on_advance() {
        let video = SyntheticVideo::new(Dimensions::new(8, 8), None);
        let waiter = {
            let video = Arc::clone(&video);
            tokio::spawn(async move { video.next_frame().await })
        };
        tokio::task::yield_now().await;
        video.advance();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
