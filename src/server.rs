//! HTTP surface for serving a store to remote [`HttpStore`](crate::store::HttpStore)s.
//!
//! | Method | Path           | Body                   | Response                          |
//! |--------|----------------|------------------------|-----------------------------------|
//! | POST   | `/getRefs/`    | hash list              | records of the chunks found       |
//! | POST   | `/hasRefs/`    | hash list              | hash list of the absent hashes    |
//! | POST   | `/writeValue/` | hints + records        | `201 Created`                     |
//! | GET    | `/root/`       |                        | the root as `sha1-<hex>`          |
//! | POST   | `/root/?last=&current=` |               | `200` or `409` with the actual root |
//!
//! Bodies use the framing from [`wire`](crate::wire). Every response carries
//! the protocol version in [`VERSION_HEADER`].

use std::error::Error;
use std::io;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, RawQuery, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::BytesMut;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::hash::{Hash, HashError};
use crate::store::{ChunkStore, RootStore};
use crate::wire::{self, WireError};

pub const GET_REFS_PATH: &str = "/getRefs/";
pub const HAS_REFS_PATH: &str = "/hasRefs/";
pub const WRITE_VALUE_PATH: &str = "/writeValue/";
pub const ROOT_PATH: &str = "/root/";

pub const VERSION_HEADER: &str = "x-chunkstore-version";
pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug)]
enum ServerError {
    BadRequest(String),
    Store(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                debug!(%message, "rejected request");
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            Self::Store(message) => {
                warn!(%message, "store failed while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<HashError> for ServerError {
    fn from(err: HashError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

async fn blocking<S, T, E, F>(store: Arc<S>, f: F) -> Result<T, ServerError>
where
    S: Send + Sync + 'static,
    T: Send + 'static,
    E: Error + Send + 'static,
    F: FnOnce(&S) -> Result<T, E> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&store)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ServerError::Store(e.to_string())),
        Err(e) => Err(ServerError::Store(e.to_string())),
    }
}

/// Builds the router serving `store`.
pub fn router<S>(store: Arc<S>) -> Router
where
    S: ChunkStore + RootStore + 'static,
{
    Router::new()
        .route(GET_REFS_PATH, post(get_refs::<S>))
        .route(HAS_REFS_PATH, post(has_refs::<S>))
        .route(WRITE_VALUE_PATH, post(write_value::<S>))
        .route(ROOT_PATH, get(root_get::<S>).post(root_post::<S>))
        // Records may be up to `u32::MAX` bytes, larger than axum's default limit.
        .layer(DefaultBodyLimit::disable())
        .layer(axum::middleware::map_response(stamp_version))
        .with_state(store)
}

/// Serves `store` on `listener` until the future is dropped.
pub async fn serve<S>(listener: TcpListener, store: Arc<S>) -> io::Result<()>
where
    S: ChunkStore + RootStore + 'static,
{
    info!(addr = ?listener.local_addr()?, "serving chunk store");
    axum::serve(listener, router(store)).await
}

async fn stamp_version(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
    response
}

async fn get_refs<S>(State(store): State<Arc<S>>, mut body: Bytes) -> Result<Response, ServerError>
where
    S: ChunkStore + RootStore + 'static,
{
    let hashes = wire::read_hashes(&mut body)?;
    let requested = hashes.len();
    let chunks = blocking(store, move |store| store.get_many(&hashes)).await?;
    debug!(requested, found = chunks.len(), "getRefs");

    let mut buf = BytesMut::new();
    wire::serialize_chunks(&mut buf, &chunks)?;
    Ok((StatusCode::OK, buf.freeze()).into_response())
}

async fn has_refs<S>(State(store): State<Arc<S>>, mut body: Bytes) -> Result<Response, ServerError>
where
    S: ChunkStore + RootStore + 'static,
{
    let hashes = wire::read_hashes(&mut body)?;
    let absent = blocking(store, move |store| store.has_many(&hashes)).await?;

    let mut buf = BytesMut::new();
    wire::write_hashes(&mut buf, absent.iter())?;
    Ok((StatusCode::OK, buf.freeze()).into_response())
}

async fn write_value<S>(State(store): State<Arc<S>>, body: Bytes) -> Result<Response, ServerError>
where
    S: ChunkStore + RootStore + 'static,
{
    let (hints, chunks) = wire::deserialize(body)?;
    let count = chunks.len();
    blocking(store, move |store| store.put_many(chunks, &hints)).await?;
    debug!(count, "writeValue");
    Ok(StatusCode::CREATED.into_response())
}

async fn root_get<S>(State(store): State<Arc<S>>) -> Result<Response, ServerError>
where
    S: ChunkStore + RootStore + 'static,
{
    let root = blocking(store, |store| store.root()).await?;
    Ok((StatusCode::OK, root.to_string()).into_response())
}

fn parse_root_update(query: Option<String>) -> Result<(Hash, Hash), ServerError> {
    let query = query.unwrap_or_default();
    let mut current = None;
    let mut last = None;
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "current" => current = Some(value.parse::<Hash>()?),
            "last" => last = Some(value.parse::<Hash>()?),
            _ => {}
        }
    }
    match (current, last) {
        (Some(current), Some(last)) => Ok((current, last)),
        _ => Err(ServerError::BadRequest(
            "expected `current` and `last` query parameters".to_owned(),
        )),
    }
}

async fn root_post<S>(
    State(store): State<Arc<S>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ServerError>
where
    S: ChunkStore + RootStore + 'static,
{
    let (current, last) = parse_root_update(query)?;
    let updated = blocking(store.clone(), move |store| store.update_root(current, last)).await?;
    if updated {
        info!(%current, %last, "root updated");
        return Ok((StatusCode::OK, current.to_string()).into_response());
    }
    let actual = blocking(store, |store| store.root()).await?;
    debug!(%current, %last, %actual, "root update conflict");
    Ok((StatusCode::CONFLICT, actual.to_string()).into_response())
}
