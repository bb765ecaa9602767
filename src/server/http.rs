use std::path::{Component, Path, PathBuf};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::{CastError, Result};

/// Bytes read from disk per body chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct ServerState {
    pub media_path: PathBuf,
    pub web_root: Option<PathBuf>,
}

impl ServerState {
    fn media_dir(&self) -> Option<&Path> {
        self.media_path.parent().filter(|dir| !dir.as_os_str().is_empty())
    }
}

pub fn router(media_route: &str, state: ServerState) -> Router {
    Router::new()
        .route(media_route, get(serve_media))
        .fallback(serve_file)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// `/stream.<ext>` for the given media file.
pub fn media_route_for(media_path: &Path) -> String {
    match media_path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => format!("/stream.{}", ext),
        None => "/stream".to_string(),
    }
}

async fn serve_media(State(state): State<ServerState>) -> Response {
    match stream_file(&state.media_path).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Segments beside the playlist first, then the static web root.
async fn serve_file(State(state): State<ServerState>, uri: Uri) -> Response {
    let request_path = uri.path();

    let mut roots = state.media_dir().into_iter().chain(state.web_root.as_deref());
    let result = loop {
        let Some(root) = roots.next() else {
            break Err(CastError::NotFound(request_path.to_string()));
        };
        match resolve_within(root, request_path) {
            Ok(path) if path.is_file() => break stream_file(&path).await,
            Ok(_) | Err(CastError::NotFound(_)) => continue,
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Resolve `request_path` under `root`, refusing anything that ends up outside it.
///
/// `..` is applied lexically first, so `/a/../b` is fine but `/../b` is not.
/// The result is then canonicalized and checked again, which catches symlinks
/// pointing out of the root.
pub fn resolve_within(root: &Path, request_path: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in request_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if !relative.pop() {
                    warn!("Rejected path escaping root: {}", request_path);
                    return Err(CastError::AccessDenied(request_path.to_string()));
                }
            }
            segment => {
                let mut components = Path::new(segment).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(_)), None) if !segment.contains('\\') => {
                        relative.push(segment)
                    }
                    _ => return Err(CastError::AccessDenied(request_path.to_string())),
                }
            }
        }
    }

    let root = root
        .canonicalize()
        .map_err(|_| CastError::NotFound(root.display().to_string()))?;
    let resolved = root
        .join(&relative)
        .canonicalize()
        .map_err(|_| CastError::NotFound(request_path.to_string()))?;

    if !resolved.starts_with(&root) {
        warn!("Rejected path resolving outside root: {}", request_path);
        return Err(CastError::AccessDenied(request_path.to_string()));
    }
    Ok(resolved)
}

pub fn content_type_for(path: &Path) -> String {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        _ => mime_guess::from_path(path).first_or_octet_stream().to_string(),
    }
}

async fn stream_file(path: &Path) -> Result<Response> {
    let file = File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CastError::NotFound(path.display().to_string()),
        _ => CastError::Io(e),
    })?;
    debug!("Serving {}", path.display());

    let chunks = futures::stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(file)))
            }
            Err(e) => Some((Err::<Bytes, std::io::Error>(e), None)),
        }
    });

    Ok((
        [
            (header::CONTENT_TYPE, content_type_for(path)),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

impl IntoResponse for CastError {
    fn into_response(self) -> Response {
        let status = match &self {
            CastError::AccessDenied(_) => StatusCode::FORBIDDEN,
            CastError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("lancast-http-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/receiver.js"), "// receiver").unwrap();
        root
    }

    #[test]
    fn resolves_paths_inside_root() {
        let root = web_root();
        let resolved = resolve_within(&root, "/assets/./../assets/receiver.js").unwrap();
        assert!(resolved.ends_with("assets/receiver.js"));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn rejects_parent_escape() {
        let root = web_root();
        for path in ["/../etc/passwd", "/assets/../../etc/passwd", "/..", "/a\\..\\b"] {
            let err = resolve_within(&root, path).unwrap_err();
            assert!(matches!(err, CastError::AccessDenied(_)), "{}: {}", path, err);
        }
        std::fs::remove_dir_all(root).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let root = web_root();
        let outside = std::env::temp_dir().join(format!("lancast-outside-{}", uuid::Uuid::new_v4()));
        std::fs::write(&outside, "secret").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("leak")).unwrap();

        let err = resolve_within(&root, "/leak").unwrap_err();
        assert!(matches!(err, CastError::AccessDenied(_)));

        std::fs::remove_dir_all(root).unwrap();
        std::fs::remove_file(outside).unwrap();
    }

    #[test]
    fn missing_files_are_not_found() {
        let root = web_root();
        let err = resolve_within(&root, "/nope.js").unwrap_err();
        assert!(matches!(err, CastError::NotFound(_)));
        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn hls_content_types() {
        assert_eq!(content_type_for(Path::new("stream.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for(Path::new("segment_00001.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("receiver.html")), "text/html");
    }

    #[tokio::test]
    async fn router_maps_errors_to_status_codes() {
        use axum::http::Request;
        use tower::ServiceExt;

        let root = web_root();
        let state = ServerState {
            media_path: root.join("media").join("stream.m3u8"),
            web_root: Some(root.clone()),
        };

        let status_of = |uri: &'static str| {
            let app = router("/stream.m3u8", state.clone());
            async move {
                app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap()
                    .status()
            }
        };

        assert_eq!(status_of("/stream.m3u8").await, StatusCode::NOT_FOUND);
        assert_eq!(status_of("/assets/receiver.js").await, StatusCode::OK);
        assert_eq!(status_of("/../secret").await, StatusCode::FORBIDDEN);
        assert_eq!(status_of("/missing.css").await, StatusCode::NOT_FOUND);

        std::fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn media_route_uses_extension() {
        assert_eq!(media_route_for(Path::new("/tmp/x/stream.m3u8")), "/stream.m3u8");
        assert_eq!(media_route_for(Path::new("/tmp/x/capture.mp4")), "/stream.mp4");
    }
}
