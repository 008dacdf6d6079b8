//! End-to-end VOD collection against in-memory collaborators.

mod common;

use std::sync::Arc;

use common::{assert_positions_ordered, MemoryTransport, RecordingSink, StubLicenser};
use rill_drm::DrmManager;
use rill_events::{CollectorState, StreamEvent};
use rill_hls::{HlsCollector, HlsConfig, TrackKind, TuneType};
use url::Url;

const MASTER: &str = "#EXTM3U\n\
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,URI=\"/audio.m3u8\"\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\",AUDIO=\"aac\"\n\
/video.m3u8\n";

fn vod_media(prefix: &str, count: usize) -> String {
    let mut buf = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXT-X-PLAYLIST-TYPE:VOD\n",
    );
    for i in 0..count {
        buf.push_str(&format!("#EXTINF:4.0,\n/{prefix}{i}.ts\n"));
    }
    buf.push_str("#EXT-X-ENDLIST\n");
    buf
}

fn collector(
    transport: Arc<MemoryTransport>,
    sink: Arc<RecordingSink>,
    config: HlsConfig,
) -> HlsCollector {
    let drm = Arc::new(DrmManager::new(StubLicenser::new()));
    HlsCollector::new(
        Url::parse("http://origin.test/master.m3u8").unwrap(),
        config,
        transport,
        drm,
        sink,
    )
}

#[tokio::test]
async fn vod_tune_collects_both_tracks_in_order() {
    let transport = MemoryTransport::new();
    transport.route("/master.m3u8", MASTER);
    transport.route("/video.m3u8", vod_media("v", 5));
    transport.route("/audio.m3u8", vod_media("a", 5));
    for i in 0..5 {
        transport.route(&format!("/v{i}.ts"), format!("video-{i}"));
        transport.route(&format!("/a{i}.ts"), format!("audio-{i}"));
    }

    let sink = RecordingSink::new();
    let mut collector = collector(transport.clone(), sink.clone(), HlsConfig::default());
    let mut events = collector.events().subscribe();

    collector.init(TuneType::NewNormal).await.unwrap();
    collector.start().unwrap();
    collector.join().await;

    let fragments = sink.fragments();
    let video: Vec<_> = fragments
        .iter()
        .filter(|f| f.track == TrackKind::Video)
        .collect();
    let audio: Vec<_> = fragments
        .iter()
        .filter(|f| f.track == TrackKind::Audio)
        .collect();
    assert_eq!(video.len(), 5);
    assert_eq!(audio.len(), 5);
    assert_positions_ordered(&fragments);

    // Video fragments arrive in presentation order with 4s spacing.
    for (i, f) in video.iter().enumerate() {
        assert_eq!(f.bytes.as_ref(), format!("video-{i}").as_bytes());
        assert!((f.position_s - i as f64 * 4.0).abs() < 1e-9);
        assert!((f.duration_s - 4.0).abs() < 1e-9);
        assert!(!f.discontinuity);
    }

    assert_eq!(collector.state(), CollectorState::Completed);

    // Initial bitrate and metadata events were published.
    let mut saw_bitrate = false;
    let mut saw_metadata = false;
    while let Ok(event) = events.try_recv() {
        match event {
            StreamEvent::BitrateChanged {
                bandwidth_bps,
                width,
                height,
            } => {
                assert_eq!(bandwidth_bps, 1_000_000);
                assert_eq!((width, height), (640, 360));
                saw_bitrate = true;
            }
            StreamEvent::Metadata(meta) => {
                assert!((meta.duration_s - 20.0).abs() < 1e-9);
                assert!(!meta.is_live);
                assert_eq!(meta.languages, vec!["en".to_string()]);
                assert_eq!(meta.bitrates_bps, vec![1_000_000]);
                assert!(!meta.has_drm);
                saw_metadata = true;
            }
            _ => {}
        }
    }
    assert!(saw_bitrate, "BitrateChanged not observed");
    assert!(saw_metadata, "Metadata not observed");
}

#[tokio::test]
async fn master_retry_on_404_then_failure() {
    let transport = MemoryTransport::new();
    // No /master.m3u8 route at all: every attempt 404s.
    let sink = RecordingSink::new();
    let mut collector = collector(transport.clone(), sink, HlsConfig::default());

    let err = collector.init(TuneType::NewNormal).await.unwrap_err();
    assert!(matches!(
        err,
        rill_hls::HlsError::ManifestRequestFailed { status: Some(404) }
    ));
    // 1 initial attempt + 3 retries.
    assert_eq!(transport.hits("/master.m3u8"), 4);
    assert_eq!(collector.state(), CollectorState::Failed);
}

#[tokio::test]
async fn vod_seek_beyond_duration_is_rejected() {
    let transport = MemoryTransport::new();
    transport.route("/master.m3u8", MASTER);
    transport.route("/video.m3u8", vod_media("v", 5));
    transport.route("/audio.m3u8", vod_media("a", 5));

    let sink = RecordingSink::new();
    let mut collector = collector(transport, sink, HlsConfig::default());
    let err = collector.init(TuneType::NewSeek(500.0)).await.unwrap_err();
    assert!(matches!(err, rill_hls::HlsError::SeekRangeError { .. }));
}

#[tokio::test]
async fn seek_starts_mid_stream() {
    let transport = MemoryTransport::new();
    transport.route("/master.m3u8", MASTER);
    transport.route("/video.m3u8", vod_media("v", 5));
    transport.route("/audio.m3u8", vod_media("a", 5));
    for i in 0..5 {
        transport.route(&format!("/v{i}.ts"), format!("video-{i}"));
        transport.route(&format!("/a{i}.ts"), format!("audio-{i}"));
    }

    let sink = RecordingSink::new();
    let mut collector = collector(transport, sink.clone(), HlsConfig::default());
    collector.init(TuneType::NewSeek(8.0)).await.unwrap();
    collector.start().unwrap();
    collector.join().await;

    let video: Vec<_> = sink
        .fragments()
        .into_iter()
        .filter(|f| f.track == TrackKind::Video)
        .collect();
    assert_eq!(video.len(), 3, "seek at 8s should leave fragments 2..5");
    assert_eq!(video[0].bytes.as_ref(), b"video-2");
}

#[tokio::test]
async fn fmp4_init_fragment_emitted_first() {
    let transport = MemoryTransport::new();
    transport.route(
        "/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360\n/video.m3u8\n",
    );
    transport.route(
        "/video.m3u8",
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n\
#EXT-X-MAP:URI=\"/init.mp4\"\n\
#EXTINF:4.0,\n/seg0.m4s\n#EXTINF:4.0,\n/seg1.m4s\n#EXT-X-ENDLIST\n",
    );
    transport.route("/init.mp4", "init-segment");
    transport.route("/seg0.m4s", "media-0");
    transport.route("/seg1.m4s", "media-1");

    let sink = RecordingSink::new();
    let config = HlsConfig::default().with_audio_enabled(false);
    let mut collector = collector(transport, sink.clone(), config);
    collector.init(TuneType::NewNormal).await.unwrap();
    collector.start().unwrap();
    collector.join().await;

    let fragments = sink.fragments();
    assert_eq!(fragments.len(), 3);
    assert!(fragments[0].init, "init fragment must be first");
    assert_eq!(fragments[0].bytes.as_ref(), b"init-segment");
    assert_eq!(fragments[1].bytes.as_ref(), b"media-0");
    assert_eq!(fragments[2].bytes.as_ref(), b"media-1");
}
