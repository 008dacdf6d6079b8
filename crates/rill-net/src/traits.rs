use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetError;
use crate::types::{FetchRequest, FetchResponse};

/// The collector's view of HTTP.
///
/// Implementations must honor `request.range` and report the post-redirect
/// URL in [`FetchResponse::effective_url`]. Non-2xx statuses are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetError>;
}

/// Shared transport handle passed across track controllers.
pub type SharedTransport = Arc<dyn Transport>;
