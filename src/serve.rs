//! Development server with live reload.
//!
//! Serves the build directory over HTTP while a watcher thread keeps
//! it fresh:
//!
//! - Static file serving with `index.html` resolution for `/`-suffixed
//!   URLs
//! - A reload listener injected into every served HTML document
//! - One well-known path (`/_/event-source`) holding a long-lived
//!   event-stream connection per browser tab
//! - Graceful shutdown on Ctrl+C
//!
//! `reload()` pushes one message to every held connection and closes
//! it; the injected listener reloads the page, and the fresh page
//! connects again.

use std::fs;
use std::io::{self, Cursor, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tiny_http::{Header, Request, Response, Server, StatusCode};

use crate::build::{self, ArtifactStore};
use crate::bundler::{BuildError, EsbuildCli};
use crate::config::SiteConfig;
use crate::log;
use crate::logger::log_diagnostics;
use crate::pages::resolve_pages;
use crate::paths::ProjectPaths;
use crate::render::worker::{RenderTask, render_in_worker};
use crate::render::{NodeBackend, RenderBackend};
use crate::watch;

// ============================================================================
// Constants
// ============================================================================

/// Well-known path held open for reload notifications.
pub const EVENT_SOURCE_PATH: &str = "/_/event-source";

/// Event-stream message pushed to every client on reload.
const RELOAD_MESSAGE: &[u8] = b"data: reload\n\n";

/// Try binding to port, retry with incremented port if in use.
const MAX_PORT_RETRIES: u16 = 10;

fn reload_snippet() -> String {
    format!(
        "\n  <script>\n    const source = new EventSource(\"{EVENT_SOURCE_PATH}\");\n    source.onmessage = () => location.reload();\n  </script>\n"
    )
}

// ============================================================================
// Server Entry Point
// ============================================================================

/// Build the project, start serving it, and keep it fresh.
///
/// The initial build and render are fatal; once serving, rebuild and
/// render failures are logged and the previously served output stays
/// untouched. Blocks until Ctrl+C.
pub fn serve_site(project_dir: PathBuf, interface: &str, port: u16) -> Result<()> {
    let paths = ProjectPaths::new(project_dir);
    let config = SiteConfig::from_path(&paths.config_file)?;
    let pages = resolve_pages(&paths.project_dir, &config.pages, config.build.allow_unmatched)?;

    let bundler = Box::new(EsbuildCli::locate()?);
    let backend: Arc<dyn RenderBackend> = Arc::new(NodeBackend::locate()?);
    let store = Arc::new(ArtifactStore::new());

    let build_result =
        build::build(bundler, &paths, &config, &pages, store.clone()).map_err(|err| {
            if let BuildError::Failed { diagnostics } = &err {
                log_diagnostics(diagnostics);
            }
            err
        })?;

    render_in_worker(
        backend.clone(),
        RenderTask {
            paths: paths.clone(),
            config: config.clone(),
            pages: pages.clone(),
            artifacts: store.latest(),
        },
    )?;

    let interface: IpAddr = interface
        .parse()
        .with_context(|| format!("Invalid interface `{interface}`"))?;
    let (server, addr) = try_bind_port(interface, port, MAX_PORT_RETRIES)?;
    let server = Arc::new(server);

    let live_reload = LiveReload::new();

    // Ctrl+C: drop held clients and unblock the accept loop.
    let server_for_signal = Arc::clone(&server);
    let reload_for_signal = live_reload.clone();
    ctrlc::set_handler(move || {
        log!("serve"; "shutting down...");
        reload_for_signal.stop();
        server_for_signal.unblock();
    })
    .context("Failed to set Ctrl+C handler")?;

    log!("serve"; "http://{}", addr);

    {
        let context = watch::WatchContext {
            build: build_result,
            backend,
            store,
            paths: paths.clone(),
            config,
            pages,
            live_reload: live_reload.clone(),
        };

        thread::spawn(move || {
            if let Err(err) = watch::watch_for_changes(context) {
                log!("watch"; "{err}");
            }
        });
    }

    // Handle requests in main thread (blocks until Ctrl+C).
    for request in server.incoming_requests() {
        if request.url() == EVENT_SOURCE_PATH {
            respond_event_source(request, &live_reload);
            continue;
        }

        if let Err(err) = handle_request(request, &paths.build_dir) {
            log!("serve"; "request error: {err}");
        }
    }

    Ok(())
}

/// Try to bind to a port, retrying with incremented port numbers if in
/// use.
fn try_bind_port(
    interface: IpAddr,
    base_port: u16,
    max_retries: u16,
) -> Result<(Server, SocketAddr)> {
    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        let addr = SocketAddr::new(interface, port);

        match Server::http(addr) {
            Ok(server) => {
                if offset > 0 {
                    log!("serve"; "port {} in use, using {} instead", base_port, port);
                }
                return Ok((server, addr));
            }
            Err(_) if offset + 1 < max_retries => {
                continue;
            }
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "Failed to bind after {} attempts (ports {}-{}): {}",
                    max_retries,
                    base_port,
                    port,
                    err
                ));
            }
        }
    }
    unreachable!()
}

// ============================================================================
// Live Reload
// ============================================================================

/// Registry of held event-stream connections.
///
/// Connections are appended on arrival and drained wholesale by
/// `reload()` and `stop()`; the list never shrinks any other way.
#[derive(Clone, Default)]
pub struct LiveReload {
    clients: Arc<Mutex<Vec<mpsc::Sender<()>>>>,
}

impl LiveReload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send one reload message to every held connection and close it.
    /// Clients reconnect after reloading.
    pub fn reload(&self) {
        for client in self.clients.lock().drain(..) {
            let _ = client.send(());
        }
    }

    /// Close every held connection without notifying.
    pub fn stop(&self) {
        self.clients.lock().clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    fn register(&self) -> mpsc::Receiver<()> {
        let (sender, receiver) = mpsc::channel();
        self.clients.lock().push(sender);
        receiver
    }
}

/// Body of a held event-stream response. Blocks until the reload
/// channel fires, yields the message once, then reports end of stream.
/// A dropped sender ends the stream silently.
struct EventStream {
    receiver: mpsc::Receiver<()>,
    pending: Vec<u8>,
    done: bool,
}

impl EventStream {
    fn new(receiver: mpsc::Receiver<()>) -> Self {
        Self {
            receiver,
            pending: Vec::new(),
            done: false,
        }
    }
}

impl Read for EventStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            if self.done {
                return Ok(0);
            }

            if self.receiver.recv().is_ok() {
                self.pending.extend_from_slice(RELOAD_MESSAGE);
            }
            self.done = true;

            if self.pending.is_empty() {
                return Ok(0);
            }
        }

        let count = buf.len().min(self.pending.len());
        buf[..count].copy_from_slice(&self.pending[..count]);
        self.pending.drain(..count);

        Ok(count)
    }
}

/// Answer an event-source request: headers now, body when `reload()`
/// fires. The response is written from its own thread so the held
/// connection never blocks the accept loop.
fn respond_event_source(request: Request, live_reload: &LiveReload) {
    let stream = EventStream::new(live_reload.register());

    thread::spawn(move || {
        let response = Response::new(
            StatusCode(200),
            vec![
                Header::from_bytes("Cache-Control", "no-cache").unwrap(),
                Header::from_bytes("Content-Type", "text/event-stream").unwrap(),
            ],
            stream,
            None,
            None,
        );

        let _ = request.respond(response);
    });
}

// ============================================================================
// Request Handling
// ============================================================================

/// Map a request URL onto a build-dir-relative file path. `None`
/// rejects the request outright.
fn resolve_request_path(url: &str) -> Option<String> {
    let decoded = urlencoding::decode(url).ok()?;

    // Cache-busting query strings do not name different files.
    let path = decoded.split('?').next().unwrap_or_default();

    let mut rel = path.to_string();
    if rel.ends_with('/') {
        rel.push_str("index.html");
    }

    let rel = rel.trim_start_matches('/').to_string();

    let escapes = Path::new(&rel)
        .components()
        .any(|component| matches!(component, Component::ParentDir));

    if escapes { None } else { Some(rel) }
}

/// Handle a single static-file request.
fn handle_request(request: Request, build_dir: &Path) -> Result<()> {
    let Some(rel) = resolve_request_path(request.url()) else {
        return serve_not_found(request);
    };

    let local_path = build_dir.join(rel);
    let content_type = guess_content_type(&local_path);

    match fs::read(&local_path) {
        Ok(content) => {
            let content = if content_type.starts_with("text/html") {
                inject_reload_listener(content)
            } else {
                content
            };

            let response = Response::from_data(content)
                .with_header(Header::from_bytes("Content-Type", content_type).unwrap());
            request.respond(response)?;
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => serve_not_found(request),
        Err(_) => serve_unexpected_error(request),
    }
}

/// Insert the reload listener just before the first closing body tag.
/// Documents without one are served unmodified.
fn inject_reload_listener(content: Vec<u8>) -> Vec<u8> {
    let needle = b"</body>";
    let Some(index) = content
        .windows(needle.len())
        .position(|window| window == needle)
    else {
        return content;
    };

    let snippet = reload_snippet();
    let mut injected = Vec::with_capacity(content.len() + snippet.len());
    injected.extend_from_slice(&content[..index]);
    injected.extend_from_slice(snippet.as_bytes());
    injected.extend_from_slice(&content[index..]);

    injected
}

fn serve_not_found(request: Request) -> Result<()> {
    let response = Response::new(
        StatusCode(404),
        vec![Header::from_bytes("Content-Type", "text/html").unwrap()],
        Cursor::new("File not found"),
        Some(14),
        None,
    );
    request.respond(response)?;
    Ok(())
}

fn serve_unexpected_error(request: Request) -> Result<()> {
    let response = Response::new(
        StatusCode(500),
        vec![Header::from_bytes("Content-Type", "text/html").unwrap()],
        Cursor::new("Unexpected error"),
        Some(16),
        None,
    );
    request.respond(response)?;
    Ok(())
}

// ============================================================================
// Content Type Detection
// ============================================================================

/// Guess MIME content type from file extension.
///
/// Returns `application/octet-stream` for unknown extensions.
fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("xml") => "application/xml; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    #[test]
    fn test_resolve_request_path() {
        assert_eq!(resolve_request_path("/").as_deref(), Some("index.html"));
        assert_eq!(
            resolve_request_path("/blog/").as_deref(),
            Some("blog/index.html")
        );
        assert_eq!(
            resolve_request_path("/style.css?v=123").as_deref(),
            Some("style.css")
        );
        assert_eq!(
            resolve_request_path("/my%20page.html").as_deref(),
            Some("my page.html")
        );
        assert_eq!(resolve_request_path("/../etc/passwd"), None);
        assert_eq!(resolve_request_path("/a/%2e%2e/%2e%2e/secret"), None);
    }

    #[test]
    fn test_inject_before_first_body_close() {
        let html = b"<html><body>one</body><body>two</body></html>".to_vec();
        let injected = inject_reload_listener(html);
        let text = String::from_utf8(injected).unwrap();

        let snippet_at = text.find("<script>").unwrap();
        let first_close = text.find("</body>").unwrap();
        assert!(snippet_at < first_close);
        assert_eq!(text.matches("EventSource").count(), 1);
    }

    #[test]
    fn test_inject_without_body_tag_is_noop() {
        let content = b"<svg>not html</svg>".to_vec();
        assert_eq!(inject_reload_listener(content.clone()), content);
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(
            guess_content_type(Path::new("a/index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            guess_content_type(Path::new("mica-client.js")),
            "application/javascript; charset=utf-8"
        );
        assert_eq!(guess_content_type(Path::new("logo.png")), "image/png");
        assert_eq!(
            guess_content_type(Path::new("mystery.bin")),
            "application/octet-stream"
        );
    }

    fn spawn_test_server(
        build_dir: PathBuf,
        live_reload: LiveReload,
    ) -> (Arc<Server>, u16, thread::JoinHandle<()>) {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();

        let accept_server = server.clone();
        let handle = thread::spawn(move || {
            for request in accept_server.incoming_requests() {
                if request.url() == EVENT_SOURCE_PATH {
                    respond_event_source(request, &live_reload);
                    continue;
                }

                let _ = handle_request(request, &build_dir);
            }
        });

        (server, port, handle)
    }

    fn request_raw(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        write!(
            stream,
            "GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();

        read_until_quiet(&mut stream)
    }

    fn connect_event_source(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        write!(
            stream,
            "GET {EVENT_SOURCE_PATH} HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n"
        )
        .unwrap();

        stream
    }

    fn read_until_quiet(stream: &mut TcpStream) -> String {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];

        while Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(count) => {
                    collected.extend_from_slice(&buf[..count]);
                    // Chunked responses end with a zero-length chunk.
                    if collected.windows(5).any(|window| window == b"0\r\n\r\n") {
                        break;
                    }
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    if !collected.is_empty() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        String::from_utf8_lossy(&collected).into_owned()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);

        while Instant::now() < deadline {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }

        panic!("condition not met in time");
    }

    #[test]
    fn test_serves_files_with_injected_listener() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("index.html"),
            "<html><body>hello</body></html>",
        )
        .unwrap();

        let (server, port, handle) =
            spawn_test_server(dir.path().to_path_buf(), LiveReload::new());

        let ok = request_raw(port, "/");
        assert!(ok.contains("200"));
        assert!(ok.contains("hello"));
        assert!(ok.contains("EventSource"));

        let missing = request_raw(port, "/missing.css");
        assert!(missing.contains("404"));
        assert!(missing.contains("File not found"));

        server.unblock();
        let _ = handle.join();
    }

    #[test]
    fn test_live_reload_notifies_each_client_once_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let live_reload = LiveReload::new();

        let (server, port, handle) =
            spawn_test_server(dir.path().to_path_buf(), live_reload.clone());

        let mut first = connect_event_source(port);
        let mut second = connect_event_source(port);

        wait_for(|| live_reload.client_count() == 2);

        live_reload.reload();

        let first_body = read_until_quiet(&mut first);
        let second_body = read_until_quiet(&mut second);

        for body in [&first_body, &second_body] {
            assert!(body.contains("200"));
            assert!(body.contains("text/event-stream"));
            assert_eq!(body.matches("data: reload").count(), 1);
        }

        assert_eq!(live_reload.client_count(), 0);

        server.unblock();
        let _ = handle.join();
    }

    #[test]
    fn test_stop_closes_clients_without_notifying() {
        let dir = tempfile::tempdir().unwrap();
        let live_reload = LiveReload::new();

        let (server, port, handle) =
            spawn_test_server(dir.path().to_path_buf(), live_reload.clone());

        let mut client = connect_event_source(port);
        wait_for(|| live_reload.client_count() == 1);

        live_reload.stop();

        let body = read_until_quiet(&mut client);
        assert!(!body.contains("data: reload"));
        assert_eq!(live_reload.client_count(), 0);

        server.unblock();
        let _ = handle.join();
    }
}
