// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SimpleBlock and Block payload framing: track number, relative timecode, flags, and the
//! lace size algorithms that split a block into frames.

use toccata_core::errors::{decode_error, limit_error, unsupported_error, Result};
use toccata_core::io::{BufReader, ReadBytes};
use toccata_core::units::TimeBase;

use crate::segment::Track;

/// A keyframe, valid for SimpleBlock only.
const BLOCK_FLAG_KEYFRAME: u8 = 0x80;
/// The two lacing bits of the flags byte.
const BLOCK_FLAG_LACING: u8 = 0x06;

/// A frame addressed inside the demuxer's read window.
///
/// The descriptor borrows nothing; `offset` and `len` locate the payload within the window
/// the demuxer exposes, and stay valid until the frame is consumed.
#[derive(Clone, Debug)]
pub struct FrameDescriptor {
    /// The track the frame belongs to.
    pub track: u64,
    /// The absolute timestamp in Segment ticks.
    pub timestamp: i64,
    /// The frame duration in Segment ticks, when known.
    pub duration: Option<u64>,
    /// True when the frame can be decoded without reference to prior frames. Only SimpleBlock
    /// carries this flag.
    pub keyframe: bool,
    /// The byte offset of the payload within the read window.
    pub offset: usize,
    /// The payload length in bytes.
    pub len: usize,
}

/// A bounded FIFO of frames awaiting delivery.
///
/// The ring holds the frames of at most one block at a time. Overflow, possible under heavy
/// lacing, is a hard error rather than a silent truncation.
pub struct FrameRing {
    slots: std::collections::VecDeque<FrameDescriptor>,
    capacity: usize,
}

impl FrameRing {
    /// Instantiate a new `FrameRing` holding up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        FrameRing { slots: std::collections::VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends a frame, failing when the ring is full.
    pub fn push(&mut self, frame: FrameDescriptor) -> Result<()> {
        if self.slots.len() >= self.capacity {
            return limit_error("mkv: frame ring capacity exceeded");
        }
        self.slots.push_back(frame);
        Ok(())
    }

    /// Removes and returns the oldest frame.
    pub fn pop(&mut self) -> Option<FrameDescriptor> {
        self.slots.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear()
    }
}

enum Lacing {
    None,
    Xiph,
    FixedSize,
    Ebml,
}

fn parse_lacing(flags: u8) -> Lacing {
    match flags & BLOCK_FLAG_LACING {
        0x00 => Lacing::None,
        0x02 => Lacing::Xiph,
        0x04 => Lacing::FixedSize,
        0x06 => Lacing::Ebml,
        _ => unreachable!(),
    }
}

/// Reads the lace sizes of an EBML-laced block: the first size as a plain vint, every
/// following size as a signed delta against its predecessor. The last frame's size is not
/// stored and is not returned here.
fn read_ebml_sizes<B: ReadBytes>(reader: &mut B, stored: usize) -> Result<Vec<u64>> {
    let mut sizes: Vec<u64> = Vec::with_capacity(stored);

    for _ in 0..stored {
        if let Some(last) = sizes.last().copied() {
            let (delta, _) = crate::ebml::read_vint_signed(&mut *reader)?;
            let size = (last as i64) + delta;
            if size < 0 {
                return decode_error("mkv: negative laced frame size");
            }
            sizes.push(size as u64);
        }
        else {
            let (size, _) = crate::ebml::read_vint(&mut *reader)?;
            sizes.push(size);
        }
    }

    Ok(sizes)
}

/// Parses a SimpleBlock or Block payload and appends one descriptor per laced frame to the
/// ring.
///
/// `block` is the block's entire binary payload and `base_offset` its byte offset within the
/// read window, so that emitted descriptors address window bytes directly. `block_duration`
/// is the BlockGroup's BlockDuration in ticks, when the block came wrapped in one.
pub fn extract_frames(
    block: &[u8],
    base_offset: usize,
    is_simple: bool,
    cluster_timecode: u64,
    block_duration: Option<u64>,
    tracks: &[Track],
    time_base: TimeBase,
    ring: &mut FrameRing,
) -> Result<()> {
    let mut reader = BufReader::new(block);

    let (track, _) = crate::ebml::read_vint(&mut reader)?;
    let relative_timecode = reader.read_be_i16()?;
    let flags = reader.read_byte()?;

    let keyframe = is_simple && (flags & BLOCK_FLAG_KEYFRAME) != 0;
    let mut timestamp = cluster_timecode as i64 + i64::from(relative_timecode);

    let default_duration = tracks
        .iter()
        .find(|t| t.track_number == track)
        .and_then(|t| t.default_duration)
        .map(|ns| time_base.ns_to_ticks(ns));

    let frame = |timestamp: i64, duration: Option<u64>, offset: usize, len: usize| {
        FrameDescriptor { track, timestamp, duration, keyframe, offset, len }
    };

    match parse_lacing(flags) {
        Lacing::None => {
            let offset = base_offset + reader.pos() as usize;
            let len = block.len() - reader.pos() as usize;
            let duration = block_duration.or(default_duration);
            ring.push(frame(timestamp, duration, offset, len))?;
        }
        Lacing::Xiph => {
            return unsupported_error("mkv: xiph lacing is not supported");
        }
        Lacing::Ebml => {
            // The stored size count is the frame count minus one; the last frame's size is
            // implied by the block extent.
            let stored = usize::from(reader.read_byte()?);
            let sizes = read_ebml_sizes(&mut reader, stored)?;

            let duration = block_duration
                .map(|d| d / (stored as u64 + 1))
                .or(default_duration);

            for size in sizes {
                let offset = base_offset + reader.pos() as usize;
                ring.push(frame(timestamp, duration, offset, size as usize))?;
                reader.ignore_bytes(size)?;
                timestamp += duration.unwrap_or(0) as i64;
            }

            let offset = base_offset + reader.pos() as usize;
            let len = block.len() - reader.pos() as usize;
            ring.push(frame(timestamp, duration, offset, len))?;
        }
        Lacing::FixedSize => {
            let frames = usize::from(reader.read_byte()?) + 1;
            let remaining = block.len() - reader.pos() as usize;

            if remaining % frames != 0 {
                return decode_error("mkv: fixed lace does not divide the block evenly");
            }

            let duration = block_duration.map(|d| d / frames as u64).or(default_duration);
            let len = remaining / frames;

            for i in 0..frames {
                let offset = base_offset + reader.pos() as usize + i * len;
                ring.push(frame(timestamp, duration, offset, len))?;
                timestamp += duration.unwrap_or(0) as i64;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use toccata_core::units::TimeBase;

    use super::*;
    use crate::segment::Track;

    fn extract(block: &[u8], tracks: &[Track], capacity: usize) -> Result<Vec<FrameDescriptor>> {
        let mut ring = FrameRing::new(capacity);
        extract_frames(block, 0, true, 0, None, tracks, TimeBase::default(), &mut ring)?;

        let mut frames = Vec::new();
        while let Some(frame) = ring.pop() {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn unlaced_block_is_one_frame() {
        // Track 1, relative timecode 16, keyframe, no lacing, 5 payload bytes.
        let mut block = vec![0x81, 0x00, 0x10, 0x80];
        block.extend_from_slice(&[9, 8, 7, 6, 5]);

        let frames = extract(&block, &[], 30).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].track, 1);
        assert_eq!(frames[0].timestamp, 16);
        assert!(frames[0].keyframe);
        assert_eq!(frames[0].offset, 4);
        assert_eq!(frames[0].len, 5);
    }

    #[test]
    fn relative_timecode_is_signed() {
        let block = [0x81, 0xFF, 0xF0, 0x00, 0xAA];
        let frames = extract(&block, &[], 30).unwrap();
        assert_eq!(frames[0].timestamp, -16);
        assert!(!frames[0].keyframe);
    }

    #[test]
    fn ebml_lace_sizes() {
        // Two stored sizes: the first is the plain vint 0x83 (3), the second is the signed
        // vint 0xBF (delta 0). Frames: 3, 3, remainder.
        let mut block = vec![0x81, 0x00, 0x00, 0x06, 0x02, 0x83, 0xBF];
        block.extend_from_slice(&[0u8; 9]);

        let frames = extract(&block, &[], 30).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len, 3);
        assert_eq!(frames[1].len, 3);
        assert_eq!(frames[2].len, 3);
        assert_eq!(frames[0].offset, 7);
        assert_eq!(frames[1].offset, 10);
        assert_eq!(frames[2].offset, 13);
    }

    #[test]
    fn fixed_lace_divides_evenly() {
        // Three frames of 4 bytes each.
        let mut block = vec![0x81, 0x00, 0x00, 0x04, 0x02];
        block.extend_from_slice(&[0u8; 12]);

        let frames = extract(&block, &[], 30).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len == 4));

        // A remainder is malformed.
        let mut block = vec![0x81, 0x00, 0x00, 0x04, 0x02];
        block.extend_from_slice(&[0u8; 13]);
        assert!(extract(&block, &[], 30).is_err());
    }

    #[test]
    fn xiph_lacing_is_rejected() {
        let block = [0x81, 0x00, 0x00, 0x02, 0x01, 0x02, 0xAA, 0xBB, 0xCC];
        match extract(&block, &[], 30) {
            Err(toccata_core::errors::Error::Unsupported(_)) => (),
            other => panic!("unexpected result: {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn ring_overflow_is_a_limit_error() {
        // A fixed-size lace of 40 frames against a 30 slot ring.
        let mut block = vec![0x81, 0x00, 0x00, 0x04, 39];
        block.extend_from_slice(&[0u8; 40]);

        match extract(&block, &[], 30) {
            Err(toccata_core::errors::Error::LimitError(_)) => (),
            other => panic!("unexpected result: {:?}", other.map(|f| f.len())),
        }
    }

    #[test]
    fn default_duration_converts_to_ticks() {
        let track = Track {
            track_number: 1,
            default_duration: Some(40_000_000),
            ..Default::default()
        };

        let block = [0x81, 0x00, 0x00, 0x00, 0xAA];
        let frames = extract(&block, &[track], 30).unwrap();
        // 40ms at the default 1ms tick.
        assert_eq!(frames[0].duration, Some(40));
    }

    #[test]
    fn laced_frames_advance_by_duration() {
        let track = Track {
            track_number: 1,
            default_duration: Some(25_000_000),
            ..Default::default()
        };

        // Fixed lace, two frames of 2 bytes.
        let block = [0x81, 0x00, 0x08, 0x04, 0x01, 1, 2, 3, 4];
        let mut ring = FrameRing::new(30);
        extract_frames(&block, 0, true, 100, None, &[track], TimeBase::default(), &mut ring)
            .unwrap();

        let first = ring.pop().unwrap();
        let second = ring.pop().unwrap();
        assert_eq!(first.timestamp, 108);
        assert_eq!(second.timestamp, 133);
    }
}
