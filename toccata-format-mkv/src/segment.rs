// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The typed model of a Segment's metadata, aggregated from the top-level elements parsed
//! during the opening phase.

use crate::ebml::EbmlNode;
use crate::schema::{self, ids};

/// Information about the Segment as a whole.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    /// The unique 128-bit identifier of the Segment, if present.
    pub segment_uid: Option<[u8; 16]>,
    /// The duration of one Segment tick in nanoseconds. Defaults to 1,000,000 (1ms).
    pub timecode_scale: u64,
    /// The duration of the Segment as a floating-point count of ticks.
    pub duration: Option<f64>,
    /// The muxing application.
    pub muxing_app: Option<String>,
    /// The writing application.
    pub writing_app: Option<String>,
}

impl Default for SegmentInfo {
    fn default() -> Self {
        SegmentInfo {
            segment_uid: None,
            timecode_scale: 1_000_000,
            duration: None,
            muxing_app: None,
            writing_app: None,
        }
    }
}

/// The type of content a track carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrackType {
    Video,
    Audio,
    Complex,
    Logo,
    Subtitle,
    Buttons,
    Control,
    Unknown,
}

impl From<u64> for TrackType {
    fn from(value: u64) -> Self {
        match value {
            0x01 => TrackType::Video,
            0x02 => TrackType::Audio,
            0x03 => TrackType::Complex,
            0x10 => TrackType::Logo,
            0x11 => TrackType::Subtitle,
            0x12 => TrackType::Buttons,
            0x20 => TrackType::Control,
            _ => TrackType::Unknown,
        }
    }
}

/// Video-specific track parameters.
#[derive(Clone, Debug, Default)]
pub struct VideoParams {
    pub pixel_width: u64,
    pub pixel_height: u64,
    pub flag_interlaced: bool,
}

/// Audio-specific track parameters.
#[derive(Clone, Debug)]
pub struct AudioParams {
    pub sampling_frequency: f64,
    pub output_sampling_frequency: Option<f64>,
    pub channels: u64,
    pub bit_depth: Option<u64>,
}

impl Default for AudioParams {
    fn default() -> Self {
        AudioParams {
            sampling_frequency: 8000.0,
            output_sampling_frequency: None,
            channels: 1,
            bit_depth: None,
        }
    }
}

/// A single track of the Segment.
#[derive(Clone, Debug)]
pub struct Track {
    /// The number blocks use to reference this track.
    pub track_number: u64,
    /// The globally unique identifier of the track.
    pub track_uid: u64,
    pub track_type: TrackType,
    pub flag_enabled: bool,
    pub flag_default: bool,
    pub flag_forced: bool,
    pub flag_lacing: bool,
    /// The default duration of one frame in nanoseconds.
    pub default_duration: Option<u64>,
    /// A human-readable track name.
    pub name: Option<String>,
    /// The language of the track. May be unknown.
    pub language: Option<String>,
    pub codec_id: String,
    pub codec_private: Option<Box<[u8]>>,
    pub video: Option<VideoParams>,
    pub audio: Option<AudioParams>,
}

impl Default for Track {
    fn default() -> Self {
        Track {
            track_number: 0,
            track_uid: 0,
            track_type: TrackType::Unknown,
            flag_enabled: true,
            flag_default: true,
            flag_forced: false,
            flag_lacing: true,
            default_duration: None,
            name: None,
            language: None,
            codec_id: String::new(),
            codec_private: None,
            video: None,
            audio: None,
        }
    }
}

/// A SeekHead entry: the position of a top-level element relative to the first byte of the
/// Segment's payload.
#[derive(Copy, Clone, Debug)]
pub struct SeekEntry {
    /// The raw ID of the element the entry points at.
    pub target_id: u32,
    /// The byte offset of the element, relative to the Segment payload start.
    pub position: u64,
}

impl SeekEntry {
    /// Gets the schema name of the target element, or `"Unknown"`.
    pub fn target_name(&self) -> &'static str {
        schema::name_of(self.target_id)
    }
}

/// The position of a Cluster holding a cue'd block for one track.
#[derive(Copy, Clone, Debug)]
pub struct CueTrackPosition {
    pub track: u64,
    /// The byte offset of the Cluster, relative to the Segment payload start.
    pub cluster_position: u64,
}

/// An index entry mapping a presentation time to Cluster positions.
#[derive(Clone, Debug)]
pub struct CuePoint {
    /// The cue time in Segment ticks.
    pub time: u64,
    pub positions: Vec<CueTrackPosition>,
}

/// The aggregate metadata of a Segment, assembled once during the opening phase and
/// read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct MasterData {
    /// The absolute byte offset of the Segment's payload. All SeekHead and Cue positions are
    /// relative to it.
    pub segment_offset: u64,
    pub seek_head: Vec<SeekEntry>,
    pub info: Option<SegmentInfo>,
    pub tracks: Vec<Track>,
    pub cues: Vec<CuePoint>,
    /// The absolute byte offset of the first Cluster, once one has been observed.
    pub first_cluster_offset: Option<u64>,
}

impl MasterData {
    /// Folds one parsed top-level element into the model. Elements the model does not cover
    /// are ignored.
    pub fn ingest(&mut self, node: &EbmlNode) {
        match node.id {
            ids::SEEK_HEAD => {
                // A Segment may carry several SeekHeads; entries accumulate.
                self.seek_head.extend(build_seek_head(node));
            }
            ids::INFO => {
                if self.info.is_none() {
                    self.info = Some(build_info(node));
                }
            }
            ids::TRACKS => {
                if self.tracks.is_empty() {
                    self.tracks = build_tracks(node);
                }
            }
            ids::CUES => {
                if self.cues.is_empty() {
                    self.cues = build_cues(node);
                }
            }
            _ => {
                log::debug!("mkv: no model for top-level element {}", node.name);
            }
        }
    }

    /// Gets the track with the given block track number.
    pub fn track_by_number(&self, number: u64) -> Option<&Track> {
        self.tracks.iter().find(|track| track.track_number == number)
    }

    /// Checks the schema-discovery invariant: the first SeekHead entry whose target (Info,
    /// Tracks, or Cues) has not yet been observed, if any.
    pub fn missing_target(&self) -> Option<&SeekEntry> {
        self.seek_head.iter().find(|seek| match seek.target_id {
            ids::INFO => self.info.is_none(),
            ids::TRACKS => self.tracks.is_empty(),
            ids::CUES => self.cues.is_empty(),
            _ => false,
        })
    }

    /// Finds the cue point to jump to for a seek to `target` ticks: the last cue point whose
    /// time does not exceed the target, or the first cue point when none precedes it. Returns
    /// `None` when the Segment carries no cues.
    pub fn find_seek_point(&self, target: u64) -> Option<&CuePoint> {
        let mut found = None;
        for cue in &self.cues {
            if cue.time <= target {
                found = Some(cue);
            }
        }
        found.or_else(|| self.cues.first())
    }
}

fn build_seek_head(node: &EbmlNode) -> Vec<SeekEntry> {
    let mut entries = Vec::new();

    for seek in node.children() {
        if seek.id != ids::SEEK {
            continue;
        }

        let target_id = seek
            .find(ids::SEEK_ID)
            .and_then(|child| child.as_bytes())
            .and_then(decode_seek_id);
        let position = seek.find(ids::SEEK_POSITION).and_then(|child| child.as_u64());

        match (target_id, position) {
            (Some(target_id), Some(position)) => {
                entries.push(SeekEntry { target_id, position });
            }
            _ => {
                log::warn!("mkv: seek entry without id or position");
            }
        }
    }

    entries
}

/// Decodes a SeekID payload, the 1 to 4 raw octets of an element ID, into the ID value.
fn decode_seek_id(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |id, &b| (id << 8) | u32::from(b)))
}

fn build_info(node: &EbmlNode) -> SegmentInfo {
    let mut info = SegmentInfo::default();

    for child in node.children() {
        match child.id {
            ids::SEGMENT_UID => {
                match child.as_bytes() {
                    Some(uid) if uid.len() == 16 => {
                        let mut segment_uid = [0u8; 16];
                        segment_uid.copy_from_slice(uid);
                        info.segment_uid = Some(segment_uid);
                    }
                    _ => log::warn!("mkv: segment uid is not 16 bytes"),
                }
            }
            ids::TIMECODE_SCALE => {
                if let Some(scale) = child.as_u64() {
                    if scale > 0 {
                        info.timecode_scale = scale;
                    }
                }
            }
            ids::DURATION => info.duration = child.as_f64(),
            ids::MUXING_APP => info.muxing_app = child.as_str().map(str::to_owned),
            ids::WRITING_APP => info.writing_app = child.as_str().map(str::to_owned),
            _ => (),
        }
    }

    info
}

fn build_tracks(node: &EbmlNode) -> Vec<Track> {
    let mut tracks = Vec::new();

    for entry in node.children() {
        if entry.id != ids::TRACK_ENTRY {
            continue;
        }

        let mut track = Track::default();

        for child in entry.children() {
            match child.id {
                ids::TRACK_NUMBER => track.track_number = child.as_u64().unwrap_or(0),
                ids::TRACK_UID => track.track_uid = child.as_u64().unwrap_or(0),
                ids::TRACK_TYPE => {
                    track.track_type = child.as_u64().map_or(TrackType::Unknown, TrackType::from);
                }
                ids::FLAG_ENABLED => track.flag_enabled = child.as_u64() != Some(0),
                ids::FLAG_DEFAULT => track.flag_default = child.as_u64() != Some(0),
                ids::FLAG_FORCED => track.flag_forced = child.as_u64() == Some(1),
                ids::FLAG_LACING => track.flag_lacing = child.as_u64() != Some(0),
                ids::DEFAULT_DURATION => track.default_duration = child.as_u64(),
                ids::NAME => track.name = child.as_str().map(str::to_owned),
                ids::LANGUAGE => track.language = child.as_str().map(str::to_owned),
                ids::CODEC_ID => {
                    if let Some(codec_id) = child.as_str() {
                        track.codec_id = codec_id.to_owned();
                    }
                }
                ids::CODEC_PRIVATE => {
                    track.codec_private = child.as_bytes().map(Box::from);
                }
                ids::VIDEO => track.video = Some(build_video(child)),
                ids::AUDIO => track.audio = Some(build_audio(child)),
                _ => (),
            }
        }

        if track.track_number == 0 {
            log::warn!("mkv: dropping track entry without a track number");
            continue;
        }

        tracks.push(track);
    }

    tracks
}

fn build_video(node: &EbmlNode) -> VideoParams {
    let mut video = VideoParams::default();

    for child in node.children() {
        match child.id {
            ids::PIXEL_WIDTH => video.pixel_width = child.as_u64().unwrap_or(0),
            ids::PIXEL_HEIGHT => video.pixel_height = child.as_u64().unwrap_or(0),
            ids::FLAG_INTERLACED => video.flag_interlaced = child.as_u64() == Some(1),
            _ => (),
        }
    }

    video
}

fn build_audio(node: &EbmlNode) -> AudioParams {
    let mut audio = AudioParams::default();

    for child in node.children() {
        match child.id {
            ids::SAMPLING_FREQUENCY => {
                if let Some(frequency) = child.as_f64() {
                    audio.sampling_frequency = frequency;
                }
            }
            ids::OUTPUT_SAMPLING_FREQUENCY => audio.output_sampling_frequency = child.as_f64(),
            ids::CHANNELS => {
                if let Some(channels) = child.as_u64() {
                    audio.channels = channels;
                }
            }
            ids::BIT_DEPTH => audio.bit_depth = child.as_u64(),
            _ => (),
        }
    }

    audio
}

fn build_cues(node: &EbmlNode) -> Vec<CuePoint> {
    let mut cues = Vec::new();

    for point in node.children() {
        if point.id != ids::CUE_POINT {
            continue;
        }

        let mut time = None;
        let mut positions = Vec::new();

        for child in point.children() {
            match child.id {
                ids::CUE_TIME => time = child.as_u64(),
                ids::CUE_TRACK_POSITIONS => {
                    let track = child.find(ids::CUE_TRACK).and_then(|n| n.as_u64());
                    let position =
                        child.find(ids::CUE_CLUSTER_POSITION).and_then(|n| n.as_u64());

                    if let (Some(track), Some(cluster_position)) = (track, position) {
                        positions.push(CueTrackPosition { track, cluster_position });
                    }
                }
                _ => (),
            }
        }

        match time {
            Some(time) if !positions.is_empty() => cues.push(CuePoint { time, positions }),
            _ => log::warn!("mkv: dropping cue point without time or positions"),
        }
    }

    cues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebml::{EbmlNode, EbmlValue};
    use crate::schema::{self, ids};

    fn node(id: u32, value: EbmlValue) -> EbmlNode {
        EbmlNode { id, name: schema::name_of(id), value }
    }

    fn master(id: u32, children: Vec<EbmlNode>) -> EbmlNode {
        node(id, EbmlValue::Master(children))
    }

    fn cue(time: u64, track: u64, position: u64) -> CuePoint {
        CuePoint { time, positions: vec![CueTrackPosition { track, cluster_position: position }] }
    }

    #[test]
    fn info_defaults_apply() {
        let info = build_info(&master(ids::INFO, vec![]));
        assert_eq!(info.timecode_scale, 1_000_000);
        assert!(info.duration.is_none());
    }

    #[test]
    fn seek_head_resolves_targets() {
        let seek_head = master(
            ids::SEEK_HEAD,
            vec![master(
                ids::SEEK,
                vec![
                    node(ids::SEEK_ID, EbmlValue::Binary(Box::new([0x15, 0x49, 0xA9, 0x66]))),
                    node(ids::SEEK_POSITION, EbmlValue::Unsigned(64)),
                ],
            )],
        );

        let entries = build_seek_head(&seek_head);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target_id, ids::INFO);
        assert_eq!(entries[0].target_name(), "Info");
        assert_eq!(entries[0].position, 64);
    }

    #[test]
    fn track_builder_populates_sub_masters() {
        let tracks = master(
            ids::TRACKS,
            vec![master(
                ids::TRACK_ENTRY,
                vec![
                    node(ids::TRACK_NUMBER, EbmlValue::Unsigned(1)),
                    node(ids::TRACK_TYPE, EbmlValue::Unsigned(1)),
                    node(ids::CODEC_ID, EbmlValue::Ascii("V_VP8".to_string())),
                    master(
                        ids::VIDEO,
                        vec![
                            node(ids::PIXEL_WIDTH, EbmlValue::Unsigned(640)),
                            node(ids::PIXEL_HEIGHT, EbmlValue::Unsigned(360)),
                        ],
                    ),
                ],
            )],
        );

        let tracks = build_tracks(&tracks);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_number, 1);
        assert_eq!(tracks[0].track_type, TrackType::Video);
        assert_eq!(tracks[0].codec_id, "V_VP8");

        let video = tracks[0].video.as_ref().unwrap();
        assert_eq!(video.pixel_width, 640);
        assert_eq!(video.pixel_height, 360);
        assert!(tracks[0].audio.is_none());
    }

    #[test]
    fn missing_target_follows_seek_head() {
        let mut master_data = MasterData::default();
        master_data.seek_head = vec![
            SeekEntry { target_id: ids::INFO, position: 10 },
            SeekEntry { target_id: ids::CUES, position: 90 },
        ];

        assert_eq!(master_data.missing_target().unwrap().target_id, ids::INFO);

        master_data.info = Some(SegmentInfo::default());
        assert_eq!(master_data.missing_target().unwrap().target_id, ids::CUES);

        master_data.cues = vec![cue(0, 1, 100)];
        assert!(master_data.missing_target().is_none());
    }

    #[test]
    fn seek_point_selection_is_monotonic() {
        let mut master_data = MasterData::default();
        master_data.cues = vec![cue(0, 1, 100), cue(1000, 1, 200), cue(2000, 1, 300)];

        assert_eq!(master_data.find_seek_point(0).unwrap().time, 0);
        assert_eq!(master_data.find_seek_point(999).unwrap().time, 0);
        assert_eq!(master_data.find_seek_point(1000).unwrap().time, 1000);
        assert_eq!(master_data.find_seek_point(5000).unwrap().time, 2000);

        // A larger target never selects an earlier file position.
        let mut last = 0;
        for target in (0..4000).step_by(250) {
            let position = master_data.find_seek_point(target).unwrap().positions[0]
                .cluster_position;
            assert!(position >= last);
            last = position;
        }
    }

    #[test]
    fn seek_point_ties_pick_the_last() {
        let mut master_data = MasterData::default();
        master_data.cues = vec![cue(500, 1, 100), cue(500, 1, 250)];

        assert_eq!(master_data.find_seek_point(600).unwrap().positions[0].cluster_position, 250);
        // No cue precedes the target: fall back to the first.
        assert_eq!(master_data.find_seek_point(100).unwrap().positions[0].cluster_position, 100);
    }
}
