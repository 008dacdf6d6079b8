//! Collect a presentation and print what would be injected downstream.
//!
//! ```sh
//! cargo run -p rill --example collect -- https://example.com/master.m3u8
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rill::{
    drm::{DrmError, DrmManager, KeyMaterial, Licenser},
    net::{HttpTransport, NetOptions},
    HlsCollector, HlsConfig, MediaSink, SinkVerdict, StagedFragment, StreamEvent, TuneType,
};

/// Stand-in license back-end: real deployments talk to their DRM server here.
struct EnvKeyLicenser;

#[async_trait]
impl Licenser for EnvKeyLicenser {
    async fn acquire(&self, _metadata: Bytes) -> Result<KeyMaterial, DrmError> {
        Err(DrmError::LicenseFailed(
            "no license back-end configured".into(),
        ))
    }
}

struct PrintSink;

impl MediaSink for PrintSink {
    fn send_segment(&self, fragment: &StagedFragment) -> SinkVerdict {
        println!(
            "{:>5} {:>8.3}s +{:.3}s {:>7}B{}{}",
            fragment.track.name(),
            fragment.position_s,
            fragment.duration_s,
            fragment.bytes.len(),
            if fragment.discontinuity { " [disc]" } else { "" },
            if fragment.init { " [init]" } else { "" },
        );
        SinkVerdict::accepted()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://test-streams.mux.dev/x36xhzz/x36xhzz.m3u8".to_string())
        .parse()?;

    let transport = Arc::new(HttpTransport::new(NetOptions::default())?);
    let drm = Arc::new(DrmManager::new(Arc::new(EnvKeyLicenser)));
    let mut collector = HlsCollector::new(
        url,
        HlsConfig::default(),
        transport,
        drm,
        Arc::new(PrintSink),
    );

    let mut events = collector.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let StreamEvent::Metadata(meta) = event {
                eprintln!(
                    "presentation: {:.1}s live={} bitrates={:?}",
                    meta.duration_s, meta.is_live, meta.bitrates_bps
                );
            }
        }
    });

    collector.init(TuneType::NewNormal).await?;
    collector.start()?;
    collector.join().await;
    Ok(())
}
