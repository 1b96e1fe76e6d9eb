// src/swap/httpd.rs

//! Swap HTTP(S) server
//!
//! Every GET/HEAD goes to the [`WebRoot`] responder on the blocking pool.
//! POST only knows `/request-swap`, which asks the user interface to swap
//! back with the peer named in the `repo` form field; other POSTs get an
//! empty 200.
//!
//! Connections are accepted by hand so the same router can run over plain
//! TCP or rustls.

use super::webroot::{WebBody, WebRequest, WebResponse, WebRoot};
use crate::error::{Error, Result};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const REQUEST_SWAP_PATH: &str = "/request-swap";

/// A peer asked us to swap back with its repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRequest {
    pub repo: String,
}

struct HttpState {
    web_root: WebRoot,
    requests: flume::Sender<SwapRequest>,
}

/// Router serving `web_root`, reporting swap requests on `requests`
pub fn create_router(web_root: WebRoot, requests: flume::Sender<SwapRequest>) -> Router {
    let state = Arc::new(HttpState { web_root, requests });
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle(
    State(state): State<Arc<HttpState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::POST {
        return handle_post(&state, &uri, &body);
    }

    let header = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let request = WebRequest {
        path: uri.path().to_string(),
        range: header(header::RANGE),
        if_range: header(header::IF_RANGE),
        if_none_match: header(header::IF_NONE_MATCH),
    };

    let web_root = state.web_root.clone();
    match tokio::task::spawn_blocking(move || web_root.respond(&request)).await {
        Ok(response) => into_response(response),
        Err(e) => {
            error!("[swap] Responder task failed: {}", e);
            into_response(WebResponse::internal_error("responder failed"))
        }
    }
}

fn handle_post(state: &HttpState, uri: &Uri, body: &[u8]) -> Response {
    if uri.path() != REQUEST_SWAP_PATH {
        return into_response(WebResponse::text(200, ""));
    }

    let repo = url::form_urlencoded::parse(body)
        .chain(url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()))
        .find(|(key, _)| key == "repo")
        .map(|(_, value)| value.into_owned());

    match repo {
        Some(repo) => {
            info!("[swap] Swap requested by {}", repo);
            if state.requests.send(SwapRequest { repo }).is_err() {
                debug!("[swap] Nobody is listening for swap requests");
            }
            into_response(WebResponse::text(200, "Swap request received."))
        }
        None => into_response(WebResponse::text(400, "Requires 'repo' parameter to be posted.")),
    }
}

fn into_response(response: WebResponse) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = match response.body {
        WebBody::Empty => Body::empty(),
        WebBody::Text(text) => Body::from(text),
        WebBody::File { file, len } => {
            let file = tokio::fs::File::from_std(file).take(len);
            Body::from_stream(ReaderStream::new(file))
        }
    };
    builder.body(body).unwrap_or_else(|e| {
        error!("[swap] Invalid response: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

// =============================================================================
// Accept loop
// =============================================================================

/// A running listener; dropped or stopped to shut down
pub struct HttpServer {
    local_addr: SocketAddr,
    tls: bool,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Bind `addr` and serve `app`, over TLS when `tls` is given
    pub async fn start(
        addr: SocketAddr,
        app: Router,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::InitError(format!("Cannot bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let acceptor = tls.map(TlsAcceptor::from);
        let is_tls = acceptor.is_some();
        let (shutdown, mut stop) = watch::channel(false);

        info!(
            "[swap] Serving {} on {}",
            if is_tls { "https" } else { "http" },
            local_addr
        );

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let app = app.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(serve_connection(stream, peer, app, acceptor));
                        }
                        Err(e) => warn!("[swap] Accept failed: {}", e),
                    },
                }
            }
            debug!("[swap] Listener on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            tls: is_tls,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Stop accepting; connections in flight finish on their own
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!("[swap] Listener task failed: {}", e);
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    acceptor: Option<TlsAcceptor>,
) {
    let service = TowerToHyperService::new(app);
    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => {
                http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await
            }
            Err(e) => {
                debug!("[swap] TLS handshake with {} failed: {}", peer, e);
                return;
            }
        },
        None => {
            http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
        }
    };
    if let Err(e) = result {
        debug!("[swap] Connection from {} ended: {:?}", peer, e);
    }
}
