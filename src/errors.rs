use std::fmt;
use std::time::Duration;

use anyhow::Error;
use serde::Serialize;
use thiserror::Error as ThisError;

/// How long a fatal-error notification stays on screen before it dismisses itself.
pub const NOTIFICATION_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeErrorKind {
    /// Frame copy did not fit the capture surface. Usually a resolution switch the
    /// loop has not observed yet.
    SizeMismatch,
    Surface,
    Validation,
    OutOfMemory,
    RecoveryFailed,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SizeMismatch => "size mismatch",
            Self::Surface => "surface",
            Self::Validation => "validation",
            Self::OutOfMemory => "out of memory",
            Self::RecoveryFailed => "recovery failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum RendererError {
    #[error("renderer initialization failed: {message}")]
    Initialization { message: String },
    #[error("frame processing failed ({kind}): {message}")]
    Runtime {
        kind: RuntimeErrorKind,
        recoverable: bool,
        message: String,
    },
    #[error("{}", cross_origin_message(.fix_enabled))]
    CrossOrigin { fix_enabled: bool },
    #[error("GPU device lost: {message}")]
    DeviceLost { intentional: bool, message: String },
}

fn cross_origin_message(fix_enabled: &bool) -> &'static str {
    if *fix_enabled {
        "video frames are cross-origin protected and reloading with anonymous CORS did not help"
    } else {
        "video frames are cross-origin protected; enable the cross-origin fix in settings and retry"
    }
}

impl RendererError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
        }
    }

    /// Only size mismatches are worth a resize-and-retry; every other runtime
    /// failure is terminal for the renderer.
    pub fn runtime(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self::Runtime {
            kind,
            recoverable: kind == RuntimeErrorKind::SizeMismatch,
            message: message.into(),
        }
    }

    /// Same error with its retry budget spent.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::Runtime { kind, message, .. } => Self::Runtime {
                kind,
                recoverable: false,
                message,
            },
            other => other,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "RENDERER_INIT_FAILED",
            Self::Runtime {
                kind: RuntimeErrorKind::SizeMismatch,
                ..
            } => "RENDERER_SIZE_MISMATCH",
            Self::Runtime {
                kind: RuntimeErrorKind::RecoveryFailed,
                ..
            } => "RENDERER_RECOVERY_FAILED",
            Self::Runtime { .. } => "RENDERER_RUNTIME_ERROR",
            Self::CrossOrigin { .. } => "RENDERER_CROSS_ORIGIN",
            Self::DeviceLost { .. } => "RENDERER_DEVICE_LOST",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Runtime {
                recoverable: true,
                ..
            }
        )
    }

    /// User-facing rendering of a fatal error. Recoverable conditions never notify.
    pub fn notification(&self) -> Option<Notification> {
        if self.is_recoverable() {
            return None;
        }
        let notification = Notification::new(self.to_string());
        match self {
            Self::CrossOrigin { fix_enabled: false } => {
                Some(notification.with_action(NotificationAction::OpenOptions))
            }
            Self::DeviceLost {
                intentional: true, ..
            } => None,
            _ => Some(notification),
        }
    }
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum BenchmarkError {
    #[error("no GPU adapter available for benchmarking")]
    NoAdapter,
    #[error("no tier succeeded: {reason}")]
    NoTierSucceeded { reason: String },
    #[error("GPU device lost during benchmark")]
    DeviceLost,
}

impl BenchmarkError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAdapter => "BENCHMARK_NO_ADAPTER",
            Self::NoTierSucceeded { .. } => "BENCHMARK_NO_TIER",
            Self::DeviceLost => "BENCHMARK_DEVICE_LOST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum CatalogLoadError {
    #[error("algorithm library loading timed out after {0:?}")]
    Timeout(Duration),
    #[error("algorithm library provider failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    OpenOptions,
}

/// Dismissible, auto-expiring message shown to the user for fatal conditions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
    #[serde(with = "duration_millis")]
    pub expires_after: Duration,
    pub dismissible: bool,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action: None,
            expires_after: NOTIFICATION_TTL,
            dismissible: true,
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Picks the most specific message available in an error chain.
    pub fn from_error(error: &Error) -> Self {
        match find_renderer_error(error) {
            Some(renderer_error) => renderer_error
                .notification()
                .unwrap_or_else(|| Self::new(renderer_error.to_string())),
            None => Self::new(format!("Enhancement failed: {error:#}")),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

pub fn find_renderer_error(error: &Error) -> Option<&RendererError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<RendererError>())
}

pub fn find_benchmark_error(error: &Error) -> Option<&BenchmarkError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<BenchmarkError>())
}

/// Stable machine code for the first typed error in the chain.
pub fn error_code(error: &Error) -> &'static str {
    if let Some(renderer_error) = find_renderer_error(error) {
        return renderer_error.code();
    }
    if let Some(benchmark_error) = find_benchmark_error(error) {
        return benchmark_error.code();
    }
    if error
        .chain()
        .any(|cause| cause.downcast_ref::<CatalogLoadError>().is_some())
    {
        return "CATALOG_LOAD_FAILED";
    }
    "INTERNAL_ERROR"
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn only_size_mismatch_is_recoverable() {
        assert!(RendererError::runtime(RuntimeErrorKind::SizeMismatch, "x").is_recoverable());
        assert!(!RendererError::runtime(RuntimeErrorKind::Validation, "x").is_recoverable());
        assert!(!RendererError::initialization("x").is_recoverable());
    }

    #[test]
    fn recoverable_errors_do_not_notify() {
        let error = RendererError::runtime(RuntimeErrorKind::SizeMismatch, "copy out of bounds");
        assert_eq!(error.notification(), None);
    }

    #[test]
    fn escalated_size_mismatch_notifies() {
        let error = RendererError::runtime(RuntimeErrorKind::SizeMismatch, "copy out of bounds")
            .into_fatal();
        assert!(!error.is_recoverable());
        assert_eq!(error.code(), "RENDERER_SIZE_MISMATCH");
        assert!(error.notification().is_some());
    }

    #[test]
    fn disabled_cross_origin_fix_points_at_settings() {
        let notification = RendererError::CrossOrigin { fix_enabled: false }
            .notification()
            .expect("fatal error should notify");
        assert_eq!(notification.action, Some(NotificationAction::OpenOptions));
        assert_eq!(notification.expires_after, NOTIFICATION_TTL);
        assert!(notification.dismissible);
        assert!(notification.message.contains("cross-origin fix"));
    }

    #[test]
    fn renderer_error_is_found_through_context() {
        let error = Err::<(), _>(RendererError::initialization("no suitable GPU adapter found"))
            .context("failed to enhance video")
            .unwrap_err();
        let found = find_renderer_error(&error).expect("typed error should be found");
        assert_eq!(found.code(), "RENDERER_INIT_FAILED");
        assert_eq!(error_code(&error), "RENDERER_INIT_FAILED");
    }

    #[test]
    fn untyped_errors_map_to_internal_code() {
        let error = anyhow::anyhow!("boom");
        assert_eq!(error_code(&error), "INTERNAL_ERROR");
        assert!(Notification::from_error(&error).message.contains("boom"));
    }
}
