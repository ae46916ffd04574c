//! HTTP range-serving endpoint for media players.
//!
//! Registered streams are served under `/video/{filename}`. Each request
//! resolves its `Range` header against the file, waits for the first chunk
//! through [`TorrentStream::read_at`] so read failures still map to a
//! status code, then streams the rest of the window as the pieces arrive.
//!
//! ```no_run
//! # async fn example(stream: torrent_stream::stream::TorrentStream) -> Result<(), Box<dyn std::error::Error>> {
//! use torrent_stream::config::ServerConfig;
//! use torrent_stream::server::StreamServer;
//!
//! let server = StreamServer::bind(ServerConfig::default()).await?;
//! let url = server.register("movie.mp4", stream)?;
//! println!("play {url}");
//! # Ok(())
//! # }
//! ```

mod error;
mod mime;
mod range;


pub use error::ServerError;
pub use range::{parse_range, ByteRange, RangeError};

use crate::config::ServerConfig;
use crate::constants::VIDEO_ROUTE_PREFIX;
use crate::stream::{StreamError, TorrentStream};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Sent with every media response when `dlna_headers` is on.
const DLNA_HEADERS: [(&str, &str); 3] = [
    ("transferMode.dlna.org", "Streaming"),
    ("realTimeInfo.dlna.org", "DLNA.ORG_TLAG=*"),
    (
        "contentFeatures.dlna.org",
        "DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS=01100000000000000000000000000000",
    ),
];

#[derive(Clone)]
struct ServerState {
    streams: Arc<DashMap<String, TorrentStream>>,
    config: Arc<ServerConfig>,
}

pub struct StreamServer {
    state: ServerState,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Binds `config.bind_addr` and starts serving in the background until
    /// [`shutdown`](Self::shutdown) or drop.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let state = ServerState {
            streams: Arc::new(DashMap::new()),
            config: Arc::new(config),
        };
        let cancel = CancellationToken::new();

        let app = router(state.clone());
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "stream server stopped");
            }
        });

        info!(addr = %local_addr, "stream server listening");
        Ok(Self {
            state,
            local_addr,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Makes `stream` available under `filename` and returns its URL.
    /// Registering a name again replaces the previous stream.
    pub fn register(&self, filename: &str, stream: TorrentStream) -> Result<Url, ServerError> {
        if filename.is_empty() || filename.contains('/') {
            return Err(ServerError::InvalidFilename(filename.to_string()));
        }

        let mut url = Url::parse(&format!("http://{}", self.local_addr))?;
        url.path_segments_mut()
            .map_err(|_| ServerError::InvalidFilename(filename.to_string()))?
            .clear()
            .push(VIDEO_ROUTE_PREFIX.trim_matches('/'))
            .push(filename);

        stream.open();
        self.state.streams.insert(filename.to_string(), stream);
        debug!(filename, %url, "stream registered");
        Ok(url)
    }

    pub fn unregister(&self, filename: &str) -> Option<TorrentStream> {
        self.state.streams.remove(filename).map(|(_, stream)| stream)
    }

    pub fn is_registered(&self, filename: &str) -> bool {
        self.state.streams.contains_key(filename)
    }

    /// The routes of this server, sharing its registry, for mounting into
    /// another application.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn router(state: ServerState) -> Router {
    // `get` also answers HEAD; the handler skips the body for it.
    Router::new()
        .route(&format!("{VIDEO_ROUTE_PREFIX}:filename"), get(serve_video))
        .with_state(state)
}

async fn serve_video(
    State(state): State<ServerState>,
    Path(filename): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(stream) = state.streams.get(&filename).map(|s| s.value().clone()) else {
        debug!(%filename, "unknown stream requested");
        return (StatusCode::NOT_FOUND, "unknown stream").into_response();
    };
    let len = stream.len();

    let range = match headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, len))
    {
        None => None,
        Some(Ok(range)) => Some(range),
        Some(Err(RangeError::Malformed)) => {
            debug!(%filename, "ignoring malformed range header");
            None
        }
        Some(Err(RangeError::NotSatisfiable)) => {
            debug!(%filename, len, "range not satisfiable");
            return not_satisfiable(len);
        }
    };

    let window = range.map_or(0..len, ByteRange::to_range);
    let full_status = range.is_none() || wants_full_status(&state.config, &headers);
    let status = if full_status {
        StatusCode::OK
    } else {
        StatusCode::PARTIAL_CONTENT
    };
    debug!(%filename, %method, ?range, %status, "serving stream");

    let mut content_type = mime::from_extension(&filename);
    let body = if method == Method::HEAD || window.is_empty() {
        Body::empty()
    } else {
        let chunk = (window.end - window.start).min(stream.chunk_size() as u64) as usize;
        let first = match stream
            .read_at(window.start, chunk, Some(state.config.read_timeout))
            .await
        {
            Ok(first) => first,
            Err(e) => return stream_error(&filename, e),
        };
        if content_type.is_none() && window.start == 0 {
            content_type = mime::sniff(&first);
        }
        let rest = stream.reader(window.start + first.len() as u64..window.end);
        let head = futures::stream::once(async move { Ok::<Bytes, StreamError>(first) });
        Body::from_stream(head.chain(rest))
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type.unwrap_or(mime::OCTET_STREAM))
        .header(header::CONTENT_LENGTH, window.end - window.start);
    if let Some(range) = range {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, len),
        );
    }
    if state.config.dlna_headers {
        for (name, value) in DLNA_HEADERS {
            response = response.header(name, value);
        }
    }

    response.body(body).unwrap_or_else(|e| {
        warn!(%filename, error = %e, "failed to build response");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn wants_full_status(config: &ServerConfig, headers: &HeaderMap) -> bool {
    let Some(agent) = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    config
        .full_status_agents
        .iter()
        .any(|marker| agent.contains(marker.as_str()))
}

fn not_satisfiable(len: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [
            (header::CONTENT_RANGE, format!("bytes */{len}")),
            (header::CONTENT_TYPE, "text/plain".to_string()),
        ],
        "requested range not satisfiable",
    )
        .into_response()
}

fn stream_error(filename: &str, error: StreamError) -> Response {
    let status = match error {
        StreamError::StreamTimeout => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::StreamStopped => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(filename, error = %error, %status, "stream read failed");
    (status, error.to_string()).into_response()
}
