#![forbid(unsafe_code)]

//! HLS fragment collector.
//!
//! Turns a multi-variant HLS presentation into an ordered, decrypted,
//! time-aligned sequence of media fragments handed to a downstream
//! [`MediaSink`], adapting continuously to network and playback conditions.
//!
//! The collector runs one fetch worker and one inject worker per enabled
//! track. Playlists are parsed and indexed in-process ([`parser`],
//! [`index`]), fragments are scheduled by the per-track controller (playlist
//! walk for normal play, fragment-index walk for trick-play), decrypted
//! through `rill-drm`, and staged into a bounded ring drained by the
//! injector. The [`HlsCollector`] coordinator owns tune, A/V
//! synchronization, live-edge adjustment, and shutdown.

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod inject;
pub mod master;
pub mod parser;

mod discontinuity;
mod state;
mod track;

pub use config::HlsConfig;
pub use coordinator::{HlsCollector, TuneType};
pub use error::{HlsError, HlsResult};
pub use index::{
    DiscontinuityNode, EncryptionMethod, FragmentNode, KeyTagInfo, MediaPlaylist, PlaylistKind,
};
pub use inject::{MediaSink, PipelineConfig, SegmentFormat, SinkVerdict, StagedFragment};
pub use master::{MasterManifest, MediaRendition, RenditionKind, VariantProfile};
pub use state::TrackKind;
