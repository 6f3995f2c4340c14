// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Matroska element schema: the mapping from EBML class IDs to element names and types,
//! and the decoders for primitive element payloads.

use std::collections::HashMap;

use lazy_static::lazy_static;

use toccata_core::errors::{decode_error, Result};
use toccata_core::io::ReadBytes;
use toccata_core::util::bits::sign_extend_leq64_to_i64;

use crate::ebml::EbmlValue;

/// The semantic type of an element's payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ElementKind {
    /// An element containing child elements, read recursively.
    Master,
    /// A big-endian unsigned integer of 0 to 8 octets.
    Unsigned,
    /// A big-endian signed integer of 0 to 8 octets.
    Signed,
    /// A printable ASCII string.
    AsciiString,
    /// A UTF-8 string.
    Utf8String,
    /// An opaque binary buffer.
    Binary,
    /// An IEEE-754 big-endian float of 4 or 8 octets.
    Float,
    /// A signed nanosecond offset from 2001-01-01T00:00:00 UTC.
    Date,
    /// An open-ended container whose children are parsed in place by the streaming layer
    /// rather than buffered as a tree (Segment, Cluster).
    Streamed,
}

/// Well-known element IDs referenced by name throughout the demuxer.
pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;
    pub const VOID: u32 = 0xEC;
    pub const CRC32: u32 = 0xBF;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549_A966;
    pub const SEGMENT_UID: u32 = 0x73A4;
    pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const PREV_SIZE: u32 = 0xAB;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;
    pub const DISCARD_PADDING: u32 = 0x75A2;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_ENABLED: u32 = 0xB9;
    pub const FLAG_DEFAULT: u32 = 0x88;
    pub const FLAG_FORCED: u32 = 0x55AA;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const NAME: u32 = 0x536E;
    pub const LANGUAGE: u32 = 0x22B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;

    pub const VIDEO: u32 = 0xE0;
    pub const FLAG_INTERLACED: u32 = 0x9A;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;

    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const OUTPUT_SAMPLING_FREQUENCY: u32 = 0x78B5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

lazy_static! {
    static ref ELEMENTS: HashMap<u32, (&'static str, ElementKind)> = {
        let mut elems: HashMap<u32, (&'static str, ElementKind)> = HashMap::new();

        // EBML document header.
        elems.insert(0x1A45DFA3, ("EBML", ElementKind::Master));
        elems.insert(0x4286, ("EBMLVersion", ElementKind::Unsigned));
        elems.insert(0x42F7, ("EBMLReadVersion", ElementKind::Unsigned));
        elems.insert(0x42F2, ("EBMLMaxIDLength", ElementKind::Unsigned));
        elems.insert(0x42F3, ("EBMLMaxSizeLength", ElementKind::Unsigned));
        elems.insert(0x4282, ("DocType", ElementKind::AsciiString));
        elems.insert(0x4287, ("DocTypeVersion", ElementKind::Unsigned));
        elems.insert(0x4285, ("DocTypeReadVersion", ElementKind::Unsigned));
        elems.insert(0xEC, ("Void", ElementKind::Binary));
        elems.insert(0xBF, ("CRC-32", ElementKind::Binary));

        // EBML signatures. Surfaced as generic elements, never validated.
        elems.insert(0x1B538667, ("SignatureSlot", ElementKind::Master));
        elems.insert(0x7E8A, ("SignatureAlgo", ElementKind::Unsigned));
        elems.insert(0x7E9A, ("SignatureHash", ElementKind::Unsigned));
        elems.insert(0x7EA5, ("SignaturePublicKey", ElementKind::Binary));
        elems.insert(0x7EB5, ("Signature", ElementKind::Binary));
        elems.insert(0x7E5B, ("SignatureElements", ElementKind::Master));
        elems.insert(0x7E7B, ("SignatureElementList", ElementKind::Master));
        elems.insert(0x6532, ("SignedElement", ElementKind::Binary));

        // Segment.
        elems.insert(0x18538067, ("Segment", ElementKind::Streamed));

        // Seek head.
        elems.insert(0x114D9B74, ("SeekHead", ElementKind::Master));
        elems.insert(0x4DBB, ("Seek", ElementKind::Master));
        elems.insert(0x53AB, ("SeekID", ElementKind::Binary));
        elems.insert(0x53AC, ("SeekPosition", ElementKind::Unsigned));

        // Segment information.
        elems.insert(0x1549A966, ("Info", ElementKind::Master));
        elems.insert(0x73A4, ("SegmentUID", ElementKind::Binary));
        elems.insert(0x7384, ("SegmentFilename", ElementKind::Utf8String));
        elems.insert(0x3CB923, ("PrevUID", ElementKind::Binary));
        elems.insert(0x3C83AB, ("PrevFilename", ElementKind::Utf8String));
        elems.insert(0x3EB923, ("NextUID", ElementKind::Binary));
        elems.insert(0x3E83BB, ("NextFilename", ElementKind::Utf8String));
        elems.insert(0x4444, ("SegmentFamily", ElementKind::Binary));
        elems.insert(0x6924, ("ChapterTranslate", ElementKind::Master));
        elems.insert(0x69FC, ("ChapterTranslateEditionUID", ElementKind::Unsigned));
        elems.insert(0x69BF, ("ChapterTranslateCodec", ElementKind::Unsigned));
        elems.insert(0x69A5, ("ChapterTranslateID", ElementKind::Binary));
        elems.insert(0x2AD7B1, ("TimecodeScale", ElementKind::Unsigned));
        elems.insert(0x4489, ("Duration", ElementKind::Float));
        elems.insert(0x4461, ("DateUTC", ElementKind::Date));
        elems.insert(0x7BA9, ("Title", ElementKind::Utf8String));
        elems.insert(0x4D80, ("MuxingApp", ElementKind::Utf8String));
        elems.insert(0x5741, ("WritingApp", ElementKind::Utf8String));

        // Cluster.
        elems.insert(0x1F43B675, ("Cluster", ElementKind::Streamed));
        elems.insert(0xE7, ("Timecode", ElementKind::Unsigned));
        elems.insert(0x5854, ("SilentTracks", ElementKind::Master));
        elems.insert(0x58D7, ("SilentTrackNumber", ElementKind::Unsigned));
        elems.insert(0xA7, ("Position", ElementKind::Unsigned));
        elems.insert(0xAB, ("PrevSize", ElementKind::Unsigned));
        elems.insert(0xA3, ("SimpleBlock", ElementKind::Binary));
        elems.insert(0xA0, ("BlockGroup", ElementKind::Master));
        elems.insert(0xA1, ("Block", ElementKind::Binary));
        elems.insert(0xA2, ("BlockVirtual", ElementKind::Binary));
        elems.insert(0x75A1, ("BlockAdditions", ElementKind::Master));
        elems.insert(0xA6, ("BlockMore", ElementKind::Master));
        elems.insert(0xEE, ("BlockAddID", ElementKind::Unsigned));
        elems.insert(0xA5, ("BlockAdditional", ElementKind::Binary));
        elems.insert(0x9B, ("BlockDuration", ElementKind::Unsigned));
        elems.insert(0xFA, ("ReferencePriority", ElementKind::Unsigned));
        elems.insert(0xFB, ("ReferenceBlock", ElementKind::Signed));
        elems.insert(0xFD, ("ReferenceVirtual", ElementKind::Signed));
        elems.insert(0xA4, ("CodecState", ElementKind::Binary));
        elems.insert(0x75A2, ("DiscardPadding", ElementKind::Signed));
        elems.insert(0x8E, ("Slices", ElementKind::Master));
        elems.insert(0xE8, ("TimeSlice", ElementKind::Master));
        elems.insert(0xCC, ("LaceNumber", ElementKind::Unsigned));
        elems.insert(0xCD, ("FrameNumber", ElementKind::Unsigned));
        elems.insert(0xCB, ("BlockAdditionID", ElementKind::Unsigned));
        elems.insert(0xCE, ("Delay", ElementKind::Unsigned));
        elems.insert(0xCF, ("SliceDuration", ElementKind::Unsigned));
        elems.insert(0xC8, ("ReferenceFrame", ElementKind::Master));
        elems.insert(0xC9, ("ReferenceOffset", ElementKind::Unsigned));
        elems.insert(0xCA, ("ReferenceTimeCode", ElementKind::Unsigned));
        elems.insert(0xAF, ("EncryptedBlock", ElementKind::Binary));

        // Tracks.
        elems.insert(0x1654AE6B, ("Tracks", ElementKind::Master));
        elems.insert(0xAE, ("TrackEntry", ElementKind::Master));
        elems.insert(0xD7, ("TrackNumber", ElementKind::Unsigned));
        elems.insert(0x73C5, ("TrackUID", ElementKind::Unsigned));
        elems.insert(0x83, ("TrackType", ElementKind::Unsigned));
        elems.insert(0xB9, ("FlagEnabled", ElementKind::Unsigned));
        elems.insert(0x88, ("FlagDefault", ElementKind::Unsigned));
        elems.insert(0x55AA, ("FlagForced", ElementKind::Unsigned));
        elems.insert(0x9C, ("FlagLacing", ElementKind::Unsigned));
        elems.insert(0x6DE7, ("MinCache", ElementKind::Unsigned));
        elems.insert(0x6DF8, ("MaxCache", ElementKind::Unsigned));
        elems.insert(0x23E383, ("DefaultDuration", ElementKind::Unsigned));
        elems.insert(0x23314F, ("TrackTimecodeScale", ElementKind::Float));
        elems.insert(0x537F, ("TrackOffset", ElementKind::Signed));
        elems.insert(0x55EE, ("MaxBlockAdditionID", ElementKind::Unsigned));
        elems.insert(0x536E, ("Name", ElementKind::Utf8String));
        elems.insert(0x22B59C, ("Language", ElementKind::AsciiString));
        elems.insert(0x86, ("CodecID", ElementKind::AsciiString));
        elems.insert(0x63A2, ("CodecPrivate", ElementKind::Binary));
        elems.insert(0x258688, ("CodecName", ElementKind::Utf8String));
        elems.insert(0x7446, ("AttachmentLink", ElementKind::Unsigned));
        elems.insert(0xAA, ("CodecDecodeAll", ElementKind::Unsigned));
        elems.insert(0x6FAB, ("TrackOverlay", ElementKind::Unsigned));
        elems.insert(0x56AA, ("CodecDelay", ElementKind::Unsigned));
        elems.insert(0x56BB, ("SeekPreRoll", ElementKind::Unsigned));
        elems.insert(0x6624, ("TrackTranslate", ElementKind::Master));
        elems.insert(0x66FC, ("TrackTranslateEditionUID", ElementKind::Unsigned));
        elems.insert(0x66BF, ("TrackTranslateCodec", ElementKind::Unsigned));
        elems.insert(0x66A5, ("TrackTranslateTrackID", ElementKind::Binary));

        // Video settings.
        elems.insert(0xE0, ("Video", ElementKind::Master));
        elems.insert(0x9A, ("FlagInterlaced", ElementKind::Unsigned));
        elems.insert(0x53B8, ("StereoMode", ElementKind::Unsigned));
        elems.insert(0x53B9, ("OldStereoMode", ElementKind::Unsigned));
        elems.insert(0x53C0, ("AlphaMode", ElementKind::Unsigned));
        elems.insert(0xB0, ("PixelWidth", ElementKind::Unsigned));
        elems.insert(0xBA, ("PixelHeight", ElementKind::Unsigned));
        elems.insert(0x54AA, ("PixelCropBottom", ElementKind::Unsigned));
        elems.insert(0x54BB, ("PixelCropTop", ElementKind::Unsigned));
        elems.insert(0x54CC, ("PixelCropLeft", ElementKind::Unsigned));
        elems.insert(0x54DD, ("PixelCropRight", ElementKind::Unsigned));
        elems.insert(0x54B0, ("DisplayWidth", ElementKind::Unsigned));
        elems.insert(0x54BA, ("DisplayHeight", ElementKind::Unsigned));
        elems.insert(0x54B2, ("DisplayUnit", ElementKind::Unsigned));
        elems.insert(0x54B3, ("AspectRatioType", ElementKind::Unsigned));
        elems.insert(0x2EB524, ("ColourSpace", ElementKind::Binary));
        elems.insert(0x2FB523, ("GammaValue", ElementKind::Float));
        elems.insert(0x2383E3, ("FrameRate", ElementKind::Float));

        // Audio settings.
        elems.insert(0xE1, ("Audio", ElementKind::Master));
        elems.insert(0xB5, ("SamplingFrequency", ElementKind::Float));
        elems.insert(0x78B5, ("OutputSamplingFrequency", ElementKind::Float));
        elems.insert(0x9F, ("Channels", ElementKind::Unsigned));
        elems.insert(0x7D7B, ("ChannelPositions", ElementKind::Binary));
        elems.insert(0x6264, ("BitDepth", ElementKind::Unsigned));

        // Content encoding skeleton.
        elems.insert(0x6D80, ("ContentEncodings", ElementKind::Master));
        elems.insert(0x6240, ("ContentEncoding", ElementKind::Master));
        elems.insert(0x5031, ("ContentEncodingOrder", ElementKind::Unsigned));
        elems.insert(0x5032, ("ContentEncodingScope", ElementKind::Unsigned));
        elems.insert(0x5033, ("ContentEncodingType", ElementKind::Unsigned));
        elems.insert(0x5034, ("ContentCompression", ElementKind::Master));
        elems.insert(0x4254, ("ContentCompAlgo", ElementKind::Unsigned));
        elems.insert(0x4255, ("ContentCompSettings", ElementKind::Binary));
        elems.insert(0x5035, ("ContentEncryption", ElementKind::Master));
        elems.insert(0x47E1, ("ContentEncAlgo", ElementKind::Unsigned));
        elems.insert(0x47E2, ("ContentEncKeyID", ElementKind::Binary));
        elems.insert(0x47E3, ("ContentSignature", ElementKind::Binary));
        elems.insert(0x47E4, ("ContentSigKeyID", ElementKind::Binary));
        elems.insert(0x47E5, ("ContentSigAlgo", ElementKind::Unsigned));
        elems.insert(0x47E6, ("ContentSigHashAlgo", ElementKind::Unsigned));

        // Cues.
        elems.insert(0x1C53BB6B, ("Cues", ElementKind::Master));
        elems.insert(0xBB, ("CuePoint", ElementKind::Master));
        elems.insert(0xB3, ("CueTime", ElementKind::Unsigned));
        elems.insert(0xB7, ("CueTrackPositions", ElementKind::Master));
        elems.insert(0xF7, ("CueTrack", ElementKind::Unsigned));
        elems.insert(0xF1, ("CueClusterPosition", ElementKind::Unsigned));
        elems.insert(0x5378, ("CueBlockNumber", ElementKind::Unsigned));
        elems.insert(0xEA, ("CueCodecState", ElementKind::Unsigned));
        elems.insert(0xDB, ("CueReference", ElementKind::Master));
        elems.insert(0x96, ("CueRefTime", ElementKind::Unsigned));
        elems.insert(0x97, ("CueRefCluster", ElementKind::Unsigned));
        elems.insert(0x535F, ("CueRefNumber", ElementKind::Unsigned));
        elems.insert(0xEB, ("CueRefCodecState", ElementKind::Unsigned));

        // Attachments. Parsed as generic trees, never modeled.
        elems.insert(0x1941A469, ("Attachments", ElementKind::Master));
        elems.insert(0x61A7, ("AttachedFile", ElementKind::Master));
        elems.insert(0x467E, ("FileDescription", ElementKind::Utf8String));
        elems.insert(0x466E, ("FileName", ElementKind::Utf8String));
        elems.insert(0x4660, ("FileMimeType", ElementKind::AsciiString));
        elems.insert(0x465C, ("FileData", ElementKind::Binary));
        elems.insert(0x46AE, ("FileUID", ElementKind::Unsigned));

        // Chapters. Parsed as generic trees, never modeled.
        elems.insert(0x1043A770, ("Chapters", ElementKind::Master));
        elems.insert(0x45B9, ("EditionEntry", ElementKind::Master));
        elems.insert(0x45BC, ("EditionUID", ElementKind::Unsigned));
        elems.insert(0x45BD, ("EditionFlagHidden", ElementKind::Unsigned));
        elems.insert(0x45DB, ("EditionFlagDefault", ElementKind::Unsigned));
        elems.insert(0x45DD, ("EditionFlagOrdered", ElementKind::Unsigned));
        elems.insert(0xB6, ("ChapterAtom", ElementKind::Master));
        elems.insert(0x73C4, ("ChapterUID", ElementKind::Unsigned));
        elems.insert(0x91, ("ChapterTimeStart", ElementKind::Unsigned));
        elems.insert(0x92, ("ChapterTimeEnd", ElementKind::Unsigned));
        elems.insert(0x98, ("ChapterFlagHidden", ElementKind::Unsigned));
        elems.insert(0x4598, ("ChapterFlagEnabled", ElementKind::Unsigned));
        elems.insert(0x6E67, ("ChapterSegmentUID", ElementKind::Binary));
        elems.insert(0x8F, ("ChapterTrack", ElementKind::Master));
        elems.insert(0x89, ("ChapterTrackNumber", ElementKind::Unsigned));
        elems.insert(0x80, ("ChapterDisplay", ElementKind::Master));
        elems.insert(0x85, ("ChapString", ElementKind::Utf8String));
        elems.insert(0x437C, ("ChapLanguage", ElementKind::AsciiString));
        elems.insert(0x437E, ("ChapCountry", ElementKind::AsciiString));

        // Tags. Parsed as generic trees, never modeled.
        elems.insert(0x1254C367, ("Tags", ElementKind::Master));
        elems.insert(0x7373, ("Tag", ElementKind::Master));
        elems.insert(0x63C0, ("Targets", ElementKind::Master));
        elems.insert(0x68CA, ("TargetTypeValue", ElementKind::Unsigned));
        elems.insert(0x63CA, ("TargetType", ElementKind::AsciiString));
        elems.insert(0x63C5, ("TagTrackUID", ElementKind::Unsigned));
        elems.insert(0x67C8, ("SimpleTag", ElementKind::Master));
        elems.insert(0x45A3, ("TagName", ElementKind::Utf8String));
        elems.insert(0x447A, ("TagLanguage", ElementKind::AsciiString));
        elems.insert(0x4484, ("TagDefault", ElementKind::Unsigned));
        elems.insert(0x4487, ("TagString", ElementKind::Utf8String));
        elems.insert(0x4485, ("TagBinary", ElementKind::Binary));

        elems
    };
}

/// Looks up the name and kind of an element by its raw ID. Unknown IDs return `None` and must
/// not abort parsing.
pub fn lookup(id: u32) -> Option<(&'static str, ElementKind)> {
    ELEMENTS.get(&id).copied()
}

/// Gets the schema name of an element, or `"Unknown"`.
pub fn name_of(id: u32) -> &'static str {
    lookup(id).map_or("Unknown", |(name, _)| name)
}

/// Gets the kind of an element, if the ID is recognized.
pub fn kind_of(id: u32) -> Option<ElementKind> {
    lookup(id).map(|(_, kind)| kind)
}

/// Decodes a primitive element payload of `size` bytes, consuming exactly `size` bytes from
/// the reader.
pub fn read_value<B: ReadBytes>(reader: &mut B, kind: ElementKind, size: u64) -> Result<EbmlValue> {
    let value = match kind {
        ElementKind::Master | ElementKind::Streamed => {
            debug_assert!(false, "container payloads are not primitive");
            reader.ignore_bytes(size)?;
            EbmlValue::Opaque
        }
        ElementKind::Unsigned => EbmlValue::Unsigned(read_uint(reader, size)?),
        ElementKind::Signed => EbmlValue::Signed(read_sint(reader, size)?),
        ElementKind::Date => EbmlValue::Date(read_sint(reader, size)?),
        ElementKind::Float => {
            let value = match size {
                0 => 0.0,
                4 => f64::from(reader.read_be_f32()?),
                8 => reader.read_be_f64()?,
                _ => {
                    // Recoverable: skip the payload and substitute zero.
                    log::warn!("mkv: float element of non-standard length {}", size);
                    reader.ignore_bytes(size)?;
                    0.0
                }
            };
            EbmlValue::Float(value)
        }
        ElementKind::AsciiString => EbmlValue::Ascii(read_string(reader, size)?),
        ElementKind::Utf8String => EbmlValue::Utf8(read_string(reader, size)?),
        ElementKind::Binary => {
            EbmlValue::Binary(reader.read_boxed_slice_exact(size as usize)?)
        }
    };

    Ok(value)
}

fn read_uint<B: ReadBytes>(reader: &mut B, size: u64) -> Result<u64> {
    if size > 8 {
        return decode_error("mkv: unsigned integer element wider than 8 octets");
    }

    let mut buf = [0u8; 8];
    reader.read_buf_exact(&mut buf[8 - size as usize..])?;
    Ok(u64::from_be_bytes(buf))
}

fn read_sint<B: ReadBytes>(reader: &mut B, size: u64) -> Result<i64> {
    if size > 8 {
        return decode_error("mkv: signed integer element wider than 8 octets");
    }
    if size == 0 {
        return Ok(0);
    }

    let mut buf = [0u8; 8];
    reader.read_buf_exact(&mut buf[8 - size as usize..])?;
    Ok(sign_extend_leq64_to_i64(u64::from_be_bytes(buf), 8 * size as u32))
}

fn read_string<B: ReadBytes>(reader: &mut B, size: u64) -> Result<String> {
    let data = reader.read_boxed_slice_exact(size as usize)?;
    // Strings may be padded with NUL; take everything before the first one. The payload is
    // passed through without UTF-8 validation.
    let bytes = data.split(|&b| b == 0).next().unwrap_or(&data);
    Ok(String::from_utf8_lossy(bytes).into_owned())
}
