//! HTTP command transport
//!
//! A thin hyper front end: a command-form endpoint feeding the pipeline, an
//! information endpoint, and optional static directory serving. The handler
//! collection knows how to self-test itself for the maintenance report.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConfigError, DaemonError};
use crate::limiter::RateLimiter;
use crate::lockdown::{self, StartupTime};
use crate::pipeline::CommandPipeline;
use crate::stats::MetricsSink;

/// Upper bound on an inbound request body
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Configuration of the HTTP daemon
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpDaemonConfig {
    /// Listen address
    #[serde(rename = "Address", default = "default_address")]
    pub address: String,

    /// Listener port
    #[serde(rename = "Port", default)]
    pub port: u16,

    /// Requests admitted per source IP per second
    #[serde(rename = "PerIPLimit", default = "default_per_ip_limit")]
    pub per_ip_limit: u32,

    /// URL prefix to filesystem directory mapping
    #[serde(rename = "ServeDirectories", default)]
    pub serve_directories: HashMap<String, String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_per_ip_limit() -> u32 {
    10
}

impl HttpDaemonConfig {
    /// Validate the section
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "HTTPDaemon.Port must be positive".into(),
            ));
        }
        if self.per_ip_limit == 0 {
            return Err(ConfigError::ValidationError(
                "HTTPDaemon.PerIPLimit must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Endpoint configuration for the HTTP daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpHandlersConfig {
    /// Path of the command form endpoint
    #[serde(rename = "CommandFormEndpoint", default)]
    pub command_form_endpoint: Option<String>,

    /// Path of the runtime information endpoint
    #[serde(rename = "InformationEndpoint", default)]
    pub information_endpoint: Option<String>,
}

/// The configured endpoints plus static directories, self-testable for the
/// maintenance report.
pub struct HandlerCollection {
    handlers: HttpHandlersConfig,
    serve_directories: HashMap<String, String>,
}

impl HandlerCollection {
    /// Assemble the collection from configuration
    #[must_use]
    pub fn new(handlers: HttpHandlersConfig, serve_directories: HashMap<String, String>) -> Self {
        Self {
            handlers,
            serve_directories,
        }
    }

    /// Verify every configured piece is usable: endpoint paths are rooted
    /// and served directories exist.
    pub fn self_test(&self) -> Result<(), String> {
        for endpoint in [
            &self.handlers.command_form_endpoint,
            &self.handlers.information_endpoint,
        ]
        .into_iter()
        .flatten()
        {
            if !endpoint.starts_with('/') {
                return Err(format!("endpoint {endpoint:?} must begin with /"));
            }
        }
        for (prefix, dir) in &self.serve_directories {
            if !Path::new(dir).is_dir() {
                return Err(format!("served directory {dir:?} for {prefix:?} is missing"));
            }
        }
        Ok(())
    }
}

/// The HTTP daemon
pub struct HttpDaemon {
    config: HttpDaemonConfig,
    handlers: Arc<HandlerCollection>,
    pipeline: Arc<CommandPipeline>,
    limiter: Arc<RateLimiter>,
    sink: Arc<MetricsSink>,
    startup: Arc<StartupTime>,
    running: AtomicBool,
    stop_notify: Notify,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl HttpDaemon {
    /// Build the daemon; validates configuration.
    pub fn new(
        config: HttpDaemonConfig,
        handlers: Arc<HandlerCollection>,
        pipeline: Arc<CommandPipeline>,
        sink: Arc<MetricsSink>,
        startup: Arc<StartupTime>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.per_ip_limit)),
            config,
            handlers,
            pipeline,
            sink,
            startup,
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            local_addr: RwLock::new(None),
        })
    }

    /// Rate limiter handle, for the supervisor's sweeper wiring
    #[must_use]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Bound address once running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Run the listener until stopped or lockdown.
    pub async fn start_and_block(&self) -> Result<(), DaemonError> {
        if lockdown::is_locked_down() {
            return Err(DaemonError::Lockdown);
        }
        self.running.store(true, Ordering::SeqCst);

        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| DaemonError::Bind {
            listener: format!("httpd {addr}"),
            source: e,
        })?;
        *self.local_addr.write() = listener.local_addr().ok();
        info!(addr = ?listener.local_addr().ok(), "HTTP daemon listening");

        let mut lockdown_tick = tokio::time::interval(crate::dns::LOCKDOWN_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = lockdown_tick.tick() => {
                    if lockdown::is_locked_down() {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(DaemonError::Lockdown);
                    }
                }
                () = self.stop_notify.notified() => {
                    info!("HTTP daemon stopping");
                    return Ok(());
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.limiter.register(&peer.ip().to_string()) {
                                let context = RequestContext {
                                    handlers: Arc::clone(&self.handlers),
                                    pipeline: Arc::clone(&self.pipeline),
                                    sink: Arc::clone(&self.sink),
                                    startup: Arc::clone(&self.startup),
                                };
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        let context = context.clone();
                                        async move { context.serve(req).await }
                                    });
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!(client = %peer, error = %err, "HTTP connection error");
                                    }
                                });
                            }
                        }
                        Err(err) => debug!(error = %err, "accept error"),
                    }
                }
            }
        }
    }

    /// Signal the daemon loop to stop; idempotent.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.stop_notify.notify_one();
        }
    }
}

#[derive(Clone)]
struct RequestContext {
    handlers: Arc<HandlerCollection>,
    pipeline: Arc<CommandPipeline>,
    sink: Arc<MetricsSink>,
    startup: Arc<StartupTime>,
}

impl RequestContext {
    async fn serve(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let started = Instant::now();
        let path = request.uri().path().to_string();

        let response = if Some(&path) == self.handlers.handlers.command_form_endpoint.as_ref() {
            self.serve_command_form(request).await?
        } else if Some(&path) == self.handlers.handlers.information_endpoint.as_ref() {
            self.serve_information()
        } else if let Some(response) = self.serve_static(&path).await {
            response
        } else {
            text_response(StatusCode::NOT_FOUND, "not found")
        };

        self.sink.record("httpd", started.elapsed());
        Ok(response)
    }

    async fn serve_command_form(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        match *request.method() {
            Method::GET => Ok(html_response(COMMAND_FORM_HTML)),
            Method::POST => {
                let body = request.into_body().collect().await?.to_bytes();
                if body.len() > MAX_BODY_SIZE {
                    return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
                }
                let Some(cmd) = form_field(&body, "cmd") else {
                    return Ok(text_response(StatusCode::BAD_REQUEST, "missing cmd field"));
                };
                let output = match self.pipeline.invoke(&cmd).await {
                    Ok(response) => response,
                    Err(err) => err.to_string(),
                };
                Ok(text_response(StatusCode::OK, &output))
            }
            _ => Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            )),
        }
    }

    fn serve_information(&self) -> Response<Full<Bytes>> {
        let info = format!(
            "toolhost {}\nuptime: {}s\nrequests handled: {}\n",
            crate::VERSION,
            self.startup.uptime().as_secs(),
            self.sink.total_count(),
        );
        text_response(StatusCode::OK, &info)
    }

    async fn serve_static(&self, path: &str) -> Option<Response<Full<Bytes>>> {
        for (prefix, dir) in &self.handlers.serve_directories {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                let Some(file_path) = sanitise_relative_path(dir, rest) else {
                    return Some(text_response(StatusCode::FORBIDDEN, "forbidden"));
                };
                return Some(match tokio::fs::read(&file_path).await {
                    Ok(content) => Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from(content)))
                        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "")),
                    Err(_) => text_response(StatusCode::NOT_FOUND, "not found"),
                });
            }
        }
        None
    }
}

const COMMAND_FORM_HTML: &str = "<html><body><form action=\"#\" method=\"post\">\
<input type=\"password\" name=\"cmd\" size=\"80\"/>\
<input type=\"submit\" value=\"Run\"/></form></body></html>";

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn html_response(body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html"),
    );
    response
}

/// Pull one field out of a urlencoded form body.
fn form_field(body: &[u8], name: &str) -> Option<String> {
    let body = std::str::from_utf8(body).ok()?;
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == name {
                return Some(percent_decode(value));
            }
        }
    }
    None
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = [bytes[i + 1], bytes[i + 2]];
                match std::str::from_utf8(&hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Join a request path onto a served directory, refusing traversal.
fn sanitise_relative_path(dir: &str, rest: &str) -> Option<PathBuf> {
    let rest = rest.trim_start_matches('/');
    let relative = Path::new(rest);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(Path::new(dir).join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;
    use crate::mailer::MailClient;
    use crate::toolbox::FeatureSet;

    // ========================================================================
    // Pure Helper Tests
    // ========================================================================

    #[test]
    fn test_form_field_decoding() {
        assert_eq!(
            form_field(b"cmd=verysecret+.secho+hi%21", "cmd").as_deref(),
            Some("verysecret .secho hi!")
        );
        assert_eq!(form_field(b"other=x", "cmd"), None);
        assert_eq!(form_field(b"", "cmd"), None);
    }

    #[test]
    fn test_path_sanitiser_refuses_traversal() {
        assert!(sanitise_relative_path("/srv/www", "ok/file.txt").is_some());
        assert!(sanitise_relative_path("/srv/www", "../etc/passwd").is_none());
        assert!(sanitise_relative_path("/srv/www", "a/../../b").is_none());
    }

    #[test]
    fn test_handler_collection_self_test() {
        let good = HandlerCollection::new(
            HttpHandlersConfig {
                command_form_endpoint: Some("/cmd".into()),
                information_endpoint: Some("/info".into()),
            },
            HashMap::new(),
        );
        assert!(good.self_test().is_ok());

        let bad_endpoint = HandlerCollection::new(
            HttpHandlersConfig {
                command_form_endpoint: Some("cmd".into()),
                information_endpoint: None,
            },
            HashMap::new(),
        );
        assert!(bad_endpoint.self_test().is_err());

        let mut dirs = HashMap::new();
        dirs.insert("/files".to_string(), "/no/such/directory".to_string());
        let bad_dir = HandlerCollection::new(HttpHandlersConfig::default(), dirs);
        assert!(bad_dir.self_test().is_err());
    }

    // ========================================================================
    // End-to-End Tests
    // ========================================================================

    async fn spawn_daemon(serve_dirs: HashMap<String, String>) -> (Arc<HttpDaemon>, SocketAddr) {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let chain = FilterChain {
            pin_and_shortcuts: Some(crate::filter::PinAndShortcuts {
                pin: "verysecret".into(),
                shortcuts: HashMap::new(),
            }),
            ..FilterChain::default()
        };
        let pipeline = Arc::new(CommandPipeline::new(
            chain,
            Arc::new(FeatureSet::minimal().unwrap()),
            Arc::new(MailClient::default()),
        ));
        let handlers = Arc::new(HandlerCollection::new(
            HttpHandlersConfig {
                command_form_endpoint: Some("/cmd".into()),
                information_endpoint: Some("/info".into()),
            },
            serve_dirs,
        ));
        let daemon = Arc::new(
            HttpDaemon::new(
                HttpDaemonConfig {
                    address: "127.0.0.1".into(),
                    port,
                    per_ip_limit: 100,
                    serve_directories: HashMap::new(),
                },
                handlers,
                pipeline,
                Arc::new(MetricsSink::new()),
                Arc::new(StartupTime::now()),
            )
            .unwrap(),
        );
        let runner = Arc::clone(&daemon);
        tokio::spawn(async move { runner.start_and_block().await });
        for _ in 0..100 {
            if let Some(addr) = daemon.local_addr() {
                return (daemon, addr);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("HTTP daemon did not bind in time");
    }

    #[tokio::test]
    async fn test_command_form_round_trip() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (daemon, addr) = spawn_daemon(HashMap::new()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{addr}/cmd"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("cmd=verysecret+.secho+over+http")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "over http");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_command_form_echoes_pipeline_errors() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (daemon, addr) = spawn_daemon(HashMap::new()).await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{addr}/cmd"))
            .body("cmd=wrongpin+.secho+hi")
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "unauthorized PIN");

        daemon.stop();
    }

    #[tokio::test]
    async fn test_information_endpoint() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (daemon, addr) = spawn_daemon(HashMap::new()).await;
        let body = reqwest::get(format!("http://{addr}/info"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("toolhost"));
        assert!(body.contains("uptime"));

        daemon.stop();
    }

    #[tokio::test]
    async fn test_static_directory_serving() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let dir = std::env::temp_dir().join(format!("toolhost-httpd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("hello.txt"), b"static content").unwrap();
        let mut dirs = HashMap::new();
        dirs.insert("/files".to_string(), dir.to_string_lossy().into_owned());

        let (daemon, addr) = spawn_daemon(dirs).await;
        let response = reqwest::get(format!("http://{addr}/files/hello.txt"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "static content");

        let missing = reqwest::get(format!("http://{addr}/files/nope.txt"))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        daemon.stop();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let _guard = crate::lockdown::TEST_LOCKDOWN_GUARD.read();
        let (daemon, addr) = spawn_daemon(HashMap::new()).await;
        let response = reqwest::get(format!("http://{addr}/elsewhere")).await.unwrap();
        assert_eq!(response.status(), 404);
        daemon.stop();
    }
}
