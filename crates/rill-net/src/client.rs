use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::traits::Transport;
use crate::types::{FetchRequest, FetchResponse, NetOptions};

/// Default [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(opts: NetOptions) -> Result<Self, NetError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(opts.request_timeout)
            .connect_timeout(opts.connect_timeout);
        if let Some(ua) = opts.user_agent {
            builder = builder.user_agent(ua);
        }
        let client = builder.build().map_err(NetError::from)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError> {
        let mut req = self.client.get(request.url.clone());
        if let Some(range) = request.range {
            req = req.header("Range", range.to_header_value());
        }

        trace!(url = %request.url, kind = ?request.kind, track = ?request.track, "fetch start");
        let started = std::time::Instant::now();
        let response = req.send().await?;
        let status = response.status();
        let effective_url = response.url().clone();

        if !(status.is_success() || status == reqwest::StatusCode::PARTIAL_CONTENT) {
            return Err(NetError::HttpStatus {
                status: status.as_u16(),
                url: effective_url.to_string(),
            });
        }

        let bytes = response.bytes().await?;
        debug!(
            url = %request.url,
            effective = %effective_url,
            status = status.as_u16(),
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetch done"
        );

        Ok(FetchResponse {
            bytes,
            effective_url,
            status: status.as_u16(),
        })
    }
}
