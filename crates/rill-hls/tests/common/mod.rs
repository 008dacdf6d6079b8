//! In-memory collaborators for collector integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use aes::Aes128;
use async_trait::async_trait;
use bytes::Bytes;
use cbc::{
    cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit},
    Encryptor,
};
use rill_drm::{DrmError, KeyMaterial, Licenser, MetadataHash};
use rill_hls::{MediaSink, SinkVerdict, StagedFragment};
use rill_net::{FetchRequest, FetchResponse, NetError, Transport};

/// Serves canned responses by URL path. Each path holds a queue; the last
/// entry keeps being served, so live tests can model a sliding window.
#[derive(Default)]
pub struct MemoryTransport {
    routes: Mutex<HashMap<String, VecDeque<Bytes>>>,
    hits: Mutex<HashMap<String, u32>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, body: impl Into<Bytes>) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(body.into());
    }

    pub fn hits(&self, path: &str) -> u32 {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError> {
        let path = request.url.path().to_string();
        *self.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(&path).ok_or(NetError::HttpStatus {
            status: 404,
            url: request.url.to_string(),
        })?;
        let body = if queue.len() > 1 {
            queue.pop_front().expect("non-empty queue")
        } else {
            queue
                .front()
                .cloned()
                .ok_or(NetError::HttpStatus {
                    status: 404,
                    url: request.url.to_string(),
                })?
        };

        let bytes = match request.range {
            Some(range) => {
                let start = range.start as usize;
                let end = ((range.end as usize) + 1).min(body.len());
                if start >= body.len() {
                    return Err(NetError::HttpStatus {
                        status: 416,
                        url: request.url.to_string(),
                    });
                }
                body.slice(start..end)
            }
            None => body,
        };

        Ok(FetchResponse {
            bytes,
            effective_url: request.url,
            status: 200,
        })
    }
}

/// Derive the AES key a [`StubLicenser`] hands out for a metadata blob.
pub fn key_for_metadata(metadata: &[u8]) -> [u8; 16] {
    let digest = MetadataHash::of(metadata);
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest.as_bytes()[..16]);
    key
}

/// License back-end answering instantly with a key derived from the blob.
#[derive(Default)]
pub struct StubLicenser {
    calls: AtomicU32,
}

impl StubLicenser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Licenser for StubLicenser {
    async fn acquire(&self, metadata: Bytes) -> Result<KeyMaterial, DrmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(KeyMaterial {
            key: key_for_metadata(&metadata),
        })
    }
}

/// Records everything handed downstream.
#[derive(Default)]
pub struct RecordingSink {
    fragments: Mutex<Vec<StagedFragment>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fragments(&self) -> Vec<StagedFragment> {
        self.fragments.lock().unwrap().clone()
    }
}

impl MediaSink for RecordingSink {
    fn send_segment(&self, fragment: &StagedFragment) -> SinkVerdict {
        self.fragments.lock().unwrap().push(fragment.clone());
        SinkVerdict::accepted()
    }
}

/// AES-128-CBC encrypt with PKCS7 padding, as an origin packager would.
pub fn encrypt_fragment(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let padded_len = plaintext.len() + (16 - plaintext.len() % 16);
    let mut buf = vec![0u8; padded_len];
    buf[..plaintext.len()].copy_from_slice(plaintext);
    Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .expect("encrypt")
        .to_vec()
}

/// Positions must be non-decreasing except across a discontinuity flag.
pub fn assert_positions_ordered(fragments: &[StagedFragment]) {
    let mut last: Option<f64> = None;
    for f in fragments {
        if f.init {
            continue;
        }
        if let Some(prev) = last {
            if !f.discontinuity {
                assert!(
                    f.position_s >= prev - 1e-9,
                    "position went backwards: {prev} -> {} without discontinuity",
                    f.position_s
                );
            }
        }
        last = Some(f.position_s);
    }
}
