//! Rotating-key (metadata-indexed) decryption across a key boundary.

mod common;

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use common::{encrypt_fragment, key_for_metadata, MemoryTransport, RecordingSink, StubLicenser};
use rill_drm::{DrmManager, MetadataHash};
use rill_hls::{HlsCollector, HlsConfig, TuneType};
use url::Url;

const IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
    0x0f,
];
const IV_HEX: &str = "0x000102030405060708090a0b0c0d0e0f";

#[tokio::test]
async fn rotating_keys_decrypt_with_matching_sessions() {
    let meta1 = b"faxs-metadata-blob-one".to_vec();
    let meta2 = b"faxs-metadata-blob-two".to_vec();
    let hash1 = MetadataHash::of(&meta1).to_hex();
    let hash2 = MetadataHash::of(&meta2).to_hex();
    let key1 = key_for_metadata(&meta1);
    let key2 = key_for_metadata(&meta2);

    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n",
    );
    playlist.push_str(&format!("#EXT-X-FAXS-CM:{}\n", BASE64.encode(&meta1)));
    playlist.push_str(&format!("#EXT-X-FAXS-CM:{}\n", BASE64.encode(&meta2)));
    playlist.push_str(&format!(
        "#EXT-X-KEY:METHOD=AES-128,URI=\"/key1\",IV={IV_HEX},CMSha1Hash=0x{hash1}\n"
    ));
    for i in 0..4 {
        playlist.push_str(&format!("#EXTINF:4.0,\n/enc_a{i}.ts\n"));
    }
    playlist.push_str(&format!(
        "#EXT-X-KEY:METHOD=AES-128,URI=\"/key2\",IV={IV_HEX},CMSha1Hash=0x{hash2}\n"
    ));
    for i in 0..4 {
        playlist.push_str(&format!("#EXTINF:4.0,\n/enc_b{i}.ts\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");

    let transport = MemoryTransport::new();
    transport.route(
        "/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360\n/video.m3u8\n",
    );
    transport.route("/video.m3u8", playlist);
    for i in 0..4 {
        transport.route(
            &format!("/enc_a{i}.ts"),
            encrypt_fragment(format!("clear-a{i}").as_bytes(), &key1, &IV),
        );
        transport.route(
            &format!("/enc_b{i}.ts"),
            encrypt_fragment(format!("clear-b{i}").as_bytes(), &key2, &IV),
        );
    }

    let licenser = StubLicenser::new();
    let drm = Arc::new(DrmManager::new(licenser.clone()));
    let sink = RecordingSink::new();
    let mut collector = HlsCollector::new(
        Url::parse("http://origin.test/master.m3u8").unwrap(),
        HlsConfig::default().with_audio_enabled(false),
        transport,
        drm,
        sink.clone(),
    );
    let mut events = collector.events().subscribe();

    collector.init(TuneType::NewNormal).await.unwrap();
    collector.start().unwrap();
    collector.join().await;

    let fragments = sink.fragments();
    assert_eq!(fragments.len(), 8);
    for (i, f) in fragments.iter().take(4).enumerate() {
        assert_eq!(f.bytes.as_ref(), format!("clear-a{i}").as_bytes());
    }
    for (i, f) in fragments.iter().skip(4).enumerate() {
        assert_eq!(f.bytes.as_ref(), format!("clear-b{i}").as_bytes());
    }

    // One license acquisition per metadata blob, none duplicated.
    assert_eq!(licenser.calls(), 2);

    let mut saw_first_decrypt = false;
    let mut saw_metadata_drm_flag = false;
    while let Ok(event) = events.try_recv() {
        match event {
            rill_events::StreamEvent::FirstFragmentDecrypted => saw_first_decrypt = true,
            rill_events::StreamEvent::Metadata(m) if m.has_drm => {
                saw_metadata_drm_flag = true;
            }
            _ => {}
        }
    }
    assert!(saw_first_decrypt);
    assert!(saw_metadata_drm_flag);
}

#[tokio::test]
async fn vanilla_aes_key_is_fetched_from_uri() {
    let key = [0x5au8; 16];

    let mut playlist = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-PLAYLIST-TYPE:VOD\n",
    );
    playlist.push_str(&format!(
        "#EXT-X-KEY:METHOD=AES-128,URI=\"/aes.key\",IV={IV_HEX}\n"
    ));
    playlist.push_str("#EXTINF:4.0,\n/enc0.ts\n#EXT-X-ENDLIST\n");

    let transport = MemoryTransport::new();
    transport.route(
        "/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=640x360\n/video.m3u8\n",
    );
    transport.route("/video.m3u8", playlist);
    transport.route("/aes.key", key.to_vec());
    transport.route("/enc0.ts", encrypt_fragment(b"plain-payload", &key, &IV));

    let licenser = StubLicenser::new();
    let drm = Arc::new(DrmManager::new(licenser.clone()));
    let sink = RecordingSink::new();
    let mut collector = HlsCollector::new(
        Url::parse("http://origin.test/master.m3u8").unwrap(),
        HlsConfig::default().with_audio_enabled(false),
        transport,
        drm,
        sink.clone(),
    );
    collector.init(TuneType::NewNormal).await.unwrap();
    collector.start().unwrap();
    collector.join().await;

    let fragments = sink.fragments();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].bytes.as_ref(), b"plain-payload");
    // Clear-key path never touches the license back-end.
    assert_eq!(licenser.calls(), 0);
}
