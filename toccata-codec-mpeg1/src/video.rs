// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The MPEG-1 video sequence header parser (ISO/IEC 11172-2, 2.4.3.2).

use toccata_core::errors::{decode_error, end_of_stream_error, Result};

/// The sequence header start code.
const SEQUENCE_HEADER_CODE: u32 = 0x0000_01B3;

/// The length of the fixed portion of the sequence header.
const SEQ_HEADER_MIN_LEN: usize = 12;

/// The length of one quantization matrix.
const QUANT_MATRIX_LEN: usize = 64;

/// Pixel aspect ratio heights in units of 1/10000, indexed by the pel_aspect_ratio code.
/// Index 0 is forbidden.
const PAR_HEIGHTS: [u32; 15] = [
    0, 10000, 6735, 7031, 7615, 8055, 8437, 8935, 9157, 9815, 10255, 10695, 10950, 11575, 12015,
];

/// Frame rates indexed by the picture_rate code. Index 0 is forbidden.
const FRAME_RATES: [(u32, u32); 8] = [
    (0, 0),
    (24000, 1001),
    (24, 1),
    (25, 1),
    (30000, 1001),
    (50, 1),
    (60000, 1001),
    (60, 1),
];

/// A ratio of two integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Ratio {
    pub num: u32,
    pub den: u32,
}

/// A parsed MPEG-1 video sequence header.
#[derive(Clone, Debug)]
pub struct VideoSequenceHeader {
    pub width: u16,
    pub height: u16,
    pub pixel_aspect_ratio: Ratio,
    pub frame_rate: Ratio,
    /// The bit rate in bits per second. Zero indicates variable bit-rate.
    pub bit_rate: u32,
    /// The VBV buffer size in bytes.
    pub vbv_buffer_len: u32,
    /// The constrained parameters flag.
    pub constrained: bool,
    /// The raw sequence header bytes, quantization matrices included.
    pub header: Box<[u8]>,
}

/// Parses a video sequence header at the start of `data`, tolerating zero padding before the
/// start code. Returns the header and the total number of bytes consumed, padding included.
///
/// An end-of-stream error indicates `data` holds too few bytes to decide; retry with more.
pub fn read_video_sequence_header(data: &[u8]) -> Result<(VideoSequenceHeader, usize)> {
    // Skip to the start code over any zero stuffing.
    let mut padding = 0;
    while padding + 4 <= data.len() && data[padding..padding + 4] == [0, 0, 0, 0] {
        padding += 4;
    }

    let data = &data[padding..];

    if data.len() < SEQ_HEADER_MIN_LEN {
        return end_of_stream_error();
    }

    let start_code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if start_code != SEQUENCE_HEADER_CODE {
        return decode_error("mpeg1: missing sequence header start code");
    }

    // Quantization matrices extend the header. When the intra matrix is present the
    // non-intra flag sits inside it, past the fixed portion.
    let mut required = SEQ_HEADER_MIN_LEN;
    if data[11] & 0x02 != 0 {
        required += QUANT_MATRIX_LEN;
    }
    else if data[11] & 0x01 != 0 {
        required += QUANT_MATRIX_LEN;
    }

    if data.len() < required {
        return end_of_stream_error();
    }

    // The marker bit between bit_rate and vbv_buffer_size.
    if data[10] & 0x20 == 0 {
        return decode_error("mpeg1: sequence header marker bit not set");
    }

    let par_code = usize::from(data[7] >> 4);
    let rate_code = usize::from(data[7] & 0x0F);

    if par_code == 0 || par_code >= PAR_HEIGHTS.len() {
        return decode_error("mpeg1: forbidden pel aspect ratio code");
    }
    if rate_code == 0 || rate_code >= FRAME_RATES.len() {
        return decode_error("mpeg1: forbidden picture rate code");
    }

    let width = (u16::from(data[4]) << 4) | (u16::from(data[5]) >> 4);
    let height = ((u16::from(data[5]) & 0x0F) << 8) | u16::from(data[6]);

    let bit_rate_field =
        (u32::from(data[8]) << 10) | (u32::from(data[9]) << 2) | (u32::from(data[10]) >> 6);

    let bit_rate = match bit_rate_field {
        0 => return decode_error("mpeg1: forbidden bit rate"),
        // All ones flags variable bit-rate.
        0x3FFFF => 0,
        // The field counts units of 400 bit/s.
        value => value * 400,
    };

    let vbv_buffer_len =
        (((u32::from(data[10]) & 0x1F) << 5) | (u32::from(data[11]) >> 3)) * 2048;

    let header = VideoSequenceHeader {
        width,
        height,
        pixel_aspect_ratio: Ratio { num: PAR_HEIGHTS[par_code], den: 10000 },
        frame_rate: Ratio { num: FRAME_RATES[rate_code].0, den: FRAME_RATES[rate_code].1 },
        bit_rate,
        vbv_buffer_len,
        constrained: data[11] & 0x04 != 0,
        header: Box::from(&data[..required]),
    };

    Ok((header, required + padding))
}
