// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MPEG-1 audio frame header parser (ISO/IEC 11172-3, 2.4.2.3).

use toccata_core::errors::{decode_error, Result};
use toccata_core::io::ReadBytes;

/// The length in bytes of an MPEG-1 audio frame header word.
pub const AUDIO_FRAME_HEADER_LEN: usize = 4;

/// Bit-rate lookup table for layer 1, in kbit/s. Index 0 is the free bit-rate.
const BIT_RATES_L1: [u32; 15] =
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];

/// Bit-rate lookup table for layer 2, in kbit/s.
const BIT_RATES_L2: [u32; 15] =
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];

/// Bit-rate lookup table for layer 3, in kbit/s.
const BIT_RATES_L3: [u32; 15] =
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

/// The audio compression layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AudioLayer {
    Layer1,
    Layer2,
    Layer3,
}

/// The channel mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AudioMode {
    Stereo,
    JointStereo,
    DualChannel,
    SingleChannel,
}

/// A parsed MPEG-1 audio frame header.
#[derive(Clone, Debug)]
pub struct AudioFrameHeader {
    pub layer: AudioLayer,
    /// The bit rate in kbit/s. Zero is the free bit-rate.
    pub bit_rate: u32,
    /// The sampling frequency in Hz.
    pub sample_rate: u32,
    pub channels: u16,
    pub block_align: u16,
    pub mode: AudioMode,
    /// The mode extension bits; meaningful in joint stereo mode only.
    pub mode_extension: u8,
    /// The de-emphasis bits.
    pub emphasis: u8,
    /// The raw protection bit. When set, no CRC follows the header.
    pub protection_bit: bool,
    pub private_bit: bool,
    pub is_copyrighted: bool,
    pub is_original: bool,
}

/// Parses an MPEG-1 audio frame header from its four header bytes packed big-endian into a
/// `u32`.
pub fn parse_audio_frame_header(header: u32) -> Result<AudioFrameHeader> {
    // The header is structured as follows:
    //
    // 0b1111_1111 0b111l_lyyp 0brrrr_ffxx 0bmmmm_coee
    // where:
    //     ll = layer   , y = version, p = protection
    //     rrrr = bitrate, ff = sample rate, x = padding / private
    //     mmmm = mode + extension, c = copyright, o = original, ee = emphasis
    let bytes = header.to_be_bytes();

    // Frame sync: eight set bits, then three more plus the two version bits. Only MPEG-1
    // ('11') is accepted.
    if bytes[0] != 0xFF {
        return decode_error("mpeg1: missing frame sync");
    }
    if bytes[1] & 0xF8 != 0xF8 {
        return decode_error("mpeg1: not an MPEG-1 audio frame");
    }

    let layer = match bytes[1] & 0x06 {
        0x06 => AudioLayer::Layer1,
        0x04 => AudioLayer::Layer2,
        0x02 => AudioLayer::Layer3,
        _ => return decode_error("mpeg1: invalid audio layer"),
    };

    let bit_rate_index = (bytes[2] & 0xF0) >> 4;
    let sampling_index = (bytes[2] & 0x0C) >> 2;

    // Note: according to ISO/IEC 11172-3 some combinations of bit rate and mode are not
    // valid. That is left to the decoder to enforce.
    let bit_rate = match (bit_rate_index, layer) {
        (15, _) => return decode_error("mpeg1: invalid bit rate index"),
        (i, AudioLayer::Layer1) => BIT_RATES_L1[usize::from(i)],
        (i, AudioLayer::Layer2) => BIT_RATES_L2[usize::from(i)],
        (i, AudioLayer::Layer3) => BIT_RATES_L3[usize::from(i)],
    };

    let sample_rate = match sampling_index {
        0 => 44_100,
        1 => 48_000,
        2 => 32_000,
        _ => return decode_error("mpeg1: invalid sampling frequency"),
    };

    let mode = match (bytes[3] & 0xC0) >> 6 {
        0b00 => AudioMode::Stereo,
        0b01 => AudioMode::JointStereo,
        0b10 => AudioMode::DualChannel,
        0b11 => AudioMode::SingleChannel,
        _ => unreachable!(),
    };

    let channels = match mode {
        AudioMode::SingleChannel => 1,
        _ => 2,
    };

    Ok(AudioFrameHeader {
        layer,
        bit_rate,
        sample_rate,
        channels,
        block_align: 1,
        mode,
        mode_extension: (bytes[3] & 0x30) >> 4,
        emphasis: bytes[3] & 0x03,
        protection_bit: bytes[1] & 0x01 != 0,
        private_bit: bytes[2] & 0x01 != 0,
        is_copyrighted: bytes[3] & 0x08 != 0,
        is_original: bytes[3] & 0x04 != 0,
    })
}

/// Reads and parses an MPEG-1 audio frame header at the current position of the stream.
pub fn read_audio_frame_header<B: ReadBytes>(reader: &mut B) -> Result<AudioFrameHeader> {
    let header = reader.read_be_u32()?;
    parse_audio_frame_header(header)
}
