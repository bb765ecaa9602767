//! LAN HTTP server for the active stream.

pub mod http;

pub use http::{resolve_within, CHUNK_SIZE};

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::network::local_lan_address;
use crate::{CastError, Result, StreamHandle};

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Serves one media resource (plus optional static files) at a time.
pub struct StreamServer {
    config: ServerConfig,
    handle: Option<StreamHandle>,
    running: Option<RunningServer>,
}

impl StreamServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handle: None,
            running: None,
        }
    }

    /// Bind and start serving `media_path`. Returns the address receivers
    /// should use and the bound port. A running server is stopped first.
    pub async fn start(&mut self, media_path: &Path) -> Result<(IpAddr, u16)> {
        if self.running.is_some() {
            warn!("Stream server already running, restarting it");
            self.stop().await;
        }

        let bind_addr = SocketAddr::new(self.config.bind_host, self.config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| CastError::Bind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();

        let local_address = if self.config.bind_host.is_unspecified() {
            local_lan_address()
        } else {
            self.config.bind_host
        };

        let media_route = http::media_route_for(media_path);
        let app = http::router(
            &media_route,
            http::ServerState {
                media_path: media_path.to_path_buf(),
                web_root: self.config.web_root.clone(),
            },
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("Stream server error: {}", e);
            }
        });

        let handle = StreamHandle {
            local_address,
            port,
            filesystem_root: self.config.web_root.clone(),
            active_media_path: media_path.to_path_buf(),
            media_route,
        };
        info!("Stream server listening on {} ({})", bind_addr.ip(), handle.stream_url());

        self.handle = Some(handle);
        self.running = Some(RunningServer {
            shutdown: shutdown_tx,
            task,
        });
        Ok((local_address, port))
    }

    /// Stop serving. Open streaming responses get the stop grace period to
    /// finish before the server task is aborted. No-op when not running.
    pub async fn stop(&mut self) {
        self.handle = None;
        let Some(RunningServer { shutdown, mut task }) = self.running.take() else {
            return;
        };

        let _ = shutdown.send(());
        match time::timeout(self.config.stop_grace(), &mut task).await {
            Ok(_) => info!("Stream server stopped"),
            Err(_) => {
                warn!(
                    "Stream server did not drain within {:?}, aborting",
                    self.config.stop_grace()
                );
                task.abort();
            }
        }
    }

    pub fn handle(&self) -> Option<&StreamHandle> {
        self.handle.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn stream_url(&self) -> Option<String> {
        self.handle.as_ref().map(StreamHandle::stream_url)
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind_host: "127.0.0.1".parse().unwrap(),
            stop_grace_ms: 500,
            ..ServerConfig::default()
        }
    }

    fn media_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lancast-server-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn raw_get(port: u16, target: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", target);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_playlist_and_segments() {
        let dir = media_dir();
        std::fs::write(dir.join("stream.m3u8"), "#EXTM3U\n#EXTINF:2.0,\nsegment_00000.ts\n").unwrap();
        std::fs::write(dir.join("segment_00000.ts"), vec![0x47u8; 3 * CHUNK_SIZE + 17]).unwrap();

        let mut server = StreamServer::new(loopback_config());
        let (address, port) = server.start(&dir.join("stream.m3u8")).await.unwrap();
        assert_eq!(address.to_string(), "127.0.0.1");
        assert!(port > 0);

        let url = server.stream_url().unwrap();
        assert_eq!(url, format!("http://127.0.0.1:{}/stream.m3u8", port));

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"],
            "application/vnd.apple.mpegurl"
        );
        assert!(response.text().await.unwrap().starts_with("#EXTM3U"));

        let segment = reqwest::get(format!("http://127.0.0.1:{}/segment_00000.ts", port))
            .await
            .unwrap();
        assert_eq!(segment.headers()["content-type"], "video/mp2t");
        assert_eq!(segment.bytes().await.unwrap().len(), 3 * CHUNK_SIZE + 17);

        server.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn missing_media_is_404() {
        let dir = media_dir();
        let mut server = StreamServer::new(loopback_config());
        let (_, port) = server.start(&dir.join("stream.m3u8")).await.unwrap();

        let response = reqwest::get(format!("http://127.0.0.1:{}/stream.m3u8", port))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        server.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn parent_escape_is_403() {
        let dir = media_dir();
        let web_root = dir.join("www");
        std::fs::create_dir_all(&web_root).unwrap();
        std::fs::write(dir.join("private.txt"), "do not serve").unwrap();

        let mut server = StreamServer::new(ServerConfig {
            web_root: Some(web_root),
            ..loopback_config()
        });
        let (_, port) = server.start(&dir.join("stream.m3u8")).await.unwrap();

        let response = raw_get(port, "/../private.txt").await;
        assert!(response.starts_with("HTTP/1.1 403"), "{}", response);
        assert!(!response.contains("do not serve"));

        server.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn serves_static_files_from_web_root() {
        let dir = media_dir();
        let web_root = dir.join("www");
        std::fs::create_dir_all(&web_root).unwrap();
        std::fs::write(web_root.join("receiver.html"), "<html></html>").unwrap();

        let mut server = StreamServer::new(ServerConfig {
            web_root: Some(web_root.clone()),
            ..loopback_config()
        });
        let (_, port) = server.start(&dir.join("media").join("stream.m3u8")).await.unwrap();
        assert_eq!(server.handle().unwrap().filesystem_root, Some(web_root));

        let response = reqwest::get(format!("http://127.0.0.1:{}/receiver.html", port))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "text/html");

        server.stop().await;
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = StreamServer::new(ServerConfig {
            port,
            ..loopback_config()
        });
        let err = server.start(Path::new("/tmp/stream.m3u8")).await.unwrap_err();
        assert!(matches!(err, CastError::Bind { .. }), "{}", err);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut never_started = StreamServer::new(loopback_config());
        never_started.stop().await;
        assert!(!never_started.is_running());

        let dir = media_dir();
        let mut server = StreamServer::new(loopback_config());
        let (_, port) = server.start(&dir.join("stream.m3u8")).await.unwrap();
        server.stop().await;
        server.stop().await;

        assert!(!server.is_running());
        assert!(server.handle().is_none());
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
