use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::io::{self, Read};

use bytes::{Bytes, BytesMut};
use tracing::debug;
use url::Url;

use crate::chunk::Chunk;
use crate::hash::{Hash, HashError};
use crate::server::{
    GET_REFS_PATH, HAS_REFS_PATH, PROTOCOL_VERSION, ROOT_PATH, VERSION_HEADER, WRITE_VALUE_PATH,
};
use crate::store::{ChunkStore, RootStore};
use crate::wire::{self, Hints, WireError};

/// Client for a store exposed by [`server::router`](crate::server::router).
///
/// Every call is one blocking HTTP request. Records returned by the server
/// are verified against their digests before they are handed out.
#[derive(Debug, Clone)]
pub struct HttpStore {
    agent: ureq::Agent,
    base: Url,
}

impl HttpStore {
    /// Creates a client for the server at `base`, e.g. `http://localhost:8000/`.
    pub fn new(mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        HttpStore {
            agent: ureq::AgentBuilder::new().build(),
            base,
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, HttpErr> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    fn post(&self, url: &Url, body: &[u8]) -> Result<ureq::Response, HttpErr> {
        let response = self
            .agent
            .post(url.as_str())
            .set("content-type", "application/octet-stream")
            .send_bytes(body)?;
        check_version(&response)?;
        Ok(response)
    }

    fn post_hashes(&self, path: &str, hashes: &BTreeSet<Hash>) -> Result<Bytes, HttpErr> {
        let mut body = BytesMut::new();
        wire::write_hashes(&mut body, hashes.iter())?;
        let response = self.post(&self.endpoint(path)?, &body)?;
        read_body(response)
    }
}

fn check_version(response: &ureq::Response) -> Result<(), HttpErr> {
    match response.header(VERSION_HEADER) {
        Some(PROTOCOL_VERSION) => Ok(()),
        found => Err(HttpErr::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: found.map(str::to_owned),
        }),
    }
}

fn read_body(response: ureq::Response) -> Result<Bytes, HttpErr> {
    let mut buf = Vec::new();
    response.into_reader().read_to_end(&mut buf)?;
    Ok(Bytes::from(buf))
}

impl ChunkStore for HttpStore {
    type ChunkError = HttpErr;

    fn get(&self, hash: &Hash) -> Result<Chunk, Self::ChunkError> {
        let found = self.get_many(&BTreeSet::from([*hash]))?;
        Ok(found.into_iter().next().unwrap_or_else(Chunk::empty))
    }

    fn get_many(&self, hashes: &BTreeSet<Hash>) -> Result<Vec<Chunk>, Self::ChunkError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let body = self.post_hashes(GET_REFS_PATH, hashes)?;
        let chunks = wire::deserialize_chunks(body)?;
        debug!(requested = hashes.len(), found = chunks.len(), "getRefs");
        Ok(chunks)
    }

    fn has(&self, hash: &Hash) -> Result<bool, Self::ChunkError> {
        Ok(self.has_many(&BTreeSet::from([*hash]))?.is_empty())
    }

    fn has_many(&self, hashes: &BTreeSet<Hash>) -> Result<BTreeSet<Hash>, Self::ChunkError> {
        if hashes.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut body = self.post_hashes(HAS_REFS_PATH, hashes)?;
        Ok(wire::read_hashes(&mut body)?)
    }

    fn put(&self, chunk: Chunk) -> Result<(), Self::ChunkError> {
        self.put_many(vec![chunk], &Hints::new())
    }

    fn put_many(&self, chunks: Vec<Chunk>, hints: &Hints) -> Result<(), Self::ChunkError> {
        let body = wire::serialize(hints, &chunks)?;
        let response = self.post(&self.endpoint(WRITE_VALUE_PATH)?, &body)?;
        match response.status() {
            201 => {
                debug!(chunks = chunks.len(), hints = hints.len(), "writeValue");
                Ok(())
            }
            status => Err(HttpErr::Status(status)),
        }
    }
}

impl RootStore for HttpStore {
    type RootError = HttpErr;

    fn root(&self) -> Result<Hash, Self::RootError> {
        let response = self.agent.get(self.endpoint(ROOT_PATH)?.as_str()).call()?;
        check_version(&response)?;
        let body = response.into_string()?;
        Ok(body.trim().parse()?)
    }

    fn update_root(&self, current: Hash, last: Hash) -> Result<bool, Self::RootError> {
        let mut url = self.endpoint(ROOT_PATH)?;
        url.query_pairs_mut()
            .append_pair("last", &last.to_string())
            .append_pair("current", &current.to_string());
        match self.agent.post(url.as_str()).call() {
            Ok(response) => {
                check_version(&response)?;
                Ok(true)
            }
            Err(ureq::Error::Status(409, response)) => {
                check_version(&response)?;
                debug!(%current, %last, "root update conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub enum HttpErr {
    Transport(Box<ureq::Transport>),
    /// The server answered with an unexpected status code.
    Status(u16),
    Io(io::Error),
    Url(url::ParseError),
    Wire(WireError),
    BadRoot(HashError),
    VersionMismatch {
        expected: &'static str,
        found: Option<String>,
    },
}

impl fmt::Display for HttpErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status(status) => write!(f, "unexpected status {status}"),
            Self::Io(e) => write!(f, "failed to read response: {e}"),
            Self::Url(e) => write!(f, "bad url: {e}"),
            Self::Wire(e) => write!(f, "malformed response: {e}"),
            Self::BadRoot(e) => write!(f, "malformed root: {e}"),
            Self::VersionMismatch {
                expected,
                found: Some(found),
            } => write!(f, "server speaks version {found}, expected {expected}"),
            Self::VersionMismatch {
                expected,
                found: None,
            } => write!(f, "server sent no version, expected {expected}"),
        }
    }
}

impl Error for HttpErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e.as_ref()),
            Self::Io(e) => Some(e),
            Self::Url(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::BadRoot(e) => Some(e),
            Self::Status(_) | Self::VersionMismatch { .. } => None,
        }
    }
}

impl From<ureq::Error> for HttpErr {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, _) => Self::Status(status),
            ureq::Error::Transport(transport) => Self::Transport(Box::new(transport)),
        }
    }
}

impl From<io::Error> for HttpErr {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<url::ParseError> for HttpErr {
    fn from(err: url::ParseError) -> Self {
        Self::Url(err)
    }
}

impl From<WireError> for HttpErr {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<HashError> for HttpErr {
    fn from(err: HashError) -> Self {
        Self::BadRoot(err)
    }
}
