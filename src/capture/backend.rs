use std::fmt;

use serde::Serialize;
use tracing::info;

const DEFAULT_DISPLAY: &str = ":0.0";

/// How the encoder grabs the screen on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureBackend {
    /// X11-style grab with explicit geometry and display target.
    WindowingSystemCapture { display: String },
    /// Compositor-provided capture stream (Wayland/PipeWire).
    CompositorCapture,
}

impl CaptureBackend {
    /// Inspect the session environment. Call once at startup.
    pub fn detect() -> Self {
        let backend = Self::detect_from(
            std::env::var("XDG_SESSION_TYPE").ok().as_deref(),
            std::env::var("WAYLAND_DISPLAY").ok().as_deref(),
            std::env::var("DISPLAY").ok().as_deref(),
        );
        info!("Capture backend: {}", backend);
        backend
    }

    pub fn detect_from(
        session_type: Option<&str>,
        wayland_display: Option<&str>,
        display: Option<&str>,
    ) -> Self {
        let display = display.filter(|d| !d.is_empty());

        let wayland = match session_type.map(str::to_ascii_lowercase).as_deref() {
            Some("wayland") => true,
            Some("x11") => false,
            _ => wayland_display.is_some_and(|d| !d.is_empty()) && display.is_none(),
        };

        if wayland {
            CaptureBackend::CompositorCapture
        } else {
            CaptureBackend::WindowingSystemCapture {
                display: display.unwrap_or(DEFAULT_DISPLAY).to_string(),
            }
        }
    }
}

impl fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBackend::WindowingSystemCapture { display } => {
                write!(f, "windowing-system capture on {}", display)
            }
            CaptureBackend::CompositorCapture => write!(f, "compositor capture"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_type_wins() {
        assert_eq!(
            CaptureBackend::detect_from(Some("wayland"), None, Some(":1")),
            CaptureBackend::CompositorCapture
        );
        assert_eq!(
            CaptureBackend::detect_from(Some("x11"), Some("wayland-0"), Some(":1")),
            CaptureBackend::WindowingSystemCapture { display: ":1".into() }
        );
    }

    #[test]
    fn falls_back_to_display_variables() {
        assert_eq!(
            CaptureBackend::detect_from(None, Some("wayland-0"), None),
            CaptureBackend::CompositorCapture
        );
        assert_eq!(
            CaptureBackend::detect_from(Some("tty"), Some("wayland-0"), Some(":0")),
            CaptureBackend::WindowingSystemCapture { display: ":0".into() }
        );
    }

    #[test]
    fn default_display_when_unset() {
        assert_eq!(
            CaptureBackend::detect_from(None, None, Some("")),
            CaptureBackend::WindowingSystemCapture { display: ":0.0".into() }
        );
    }
}
