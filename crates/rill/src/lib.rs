#![forbid(unsafe_code)]

//! Facade over the rill workspace: everything an embedder needs to turn an
//! HLS presentation into an ordered, decrypted fragment sequence.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rill::{
//!     drm::{DrmManager, Licenser},
//!     net::{HttpTransport, NetOptions},
//!     HlsCollector, HlsConfig, MediaSink, SinkVerdict, StagedFragment, TuneType,
//! };
//!
//! struct NullSink;
//! impl MediaSink for NullSink {
//!     fn send_segment(&self, _fragment: &StagedFragment) -> SinkVerdict {
//!         SinkVerdict::accepted()
//!     }
//! }
//!
//! # async fn demo(licenser: Arc<dyn Licenser>) -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new(NetOptions::default())?);
//! let drm = Arc::new(DrmManager::new(licenser));
//! let mut collector = HlsCollector::new(
//!     "https://example.com/master.m3u8".parse()?,
//!     HlsConfig::default(),
//!     transport,
//!     drm,
//!     Arc::new(NullSink),
//! );
//! collector.init(TuneType::NewNormal).await?;
//! collector.start()?;
//! collector.join().await;
//! # Ok(())
//! # }
//! ```

pub use rill_hls::{
    HlsCollector, HlsConfig, HlsError, HlsResult, MediaPlaylist, MediaSink, PipelineConfig,
    PlaylistKind, SegmentFormat, SinkVerdict, StagedFragment, TrackKind, TuneType,
};

pub use rill_events::{CollectorState, EventBus, MediaMetadata, StreamEvent, TuneFailureKind};

pub mod abr {
    pub use rill_abr::{AbrOptions, ProfileEntry, ProfileRegistry};
}

pub mod drm {
    pub use rill_drm::{
        DrmError, DrmManager, DrmMetadata, KeyMaterial, Licenser, MetadataHash,
        MAX_LICENSE_ACQ_WAIT_TIME,
    };
}

pub mod net {
    pub use rill_net::{
        ByteRange, FetchRequest, FetchResponse, HttpTransport, NetError, NetOptions, ResourceKind,
        Transport,
    };
}
