// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The streaming controller: a pull-driven state machine that acquires bytes from a seekable
//! source, assembles the segment metadata during an opening phase, and then frames cluster
//! blocks into deliverable frames.

use std::io::{Seek, SeekFrom};

use toccata_core::errors::{
    cancelled_error, decode_error, seek_error, unsupported_error, Error, Result, SeekErrorKind,
};
use toccata_core::io::{BufReader, ByteSource, ReadBuffer, ReadBytes};
use toccata_core::units::TimeBase;

use crate::ebml::{self, ElementHeader};
use crate::lacing::{self, FrameDescriptor, FrameRing};
use crate::schema::{self, ids, ElementKind};
use crate::segment::MasterData;

/// Size of each read request to the byte source.
const READ_SIZE: usize = 4 * 1024;

/// `DemuxerOptions` is a common set of options the demuxer is instantiated with.
#[derive(Copy, Clone, Debug)]
pub struct DemuxerOptions {
    /// The number of bytes requested from the byte source per read. Default: 4096.
    pub read_len: usize,
    /// The capacity of the frame delivery ring. A block whose lacing produces more frames
    /// than this fails with a limit error. Default: `30`.
    pub frame_ring_len: usize,
}

impl Default for DemuxerOptions {
    fn default() -> Self {
        DemuxerOptions { read_len: READ_SIZE, frame_ring_len: 30 }
    }
}

/// The lifecycle state of a demuxer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DemuxerState {
    /// The opening phase is in progress.
    Opening,
    /// The model is ready; no frames are being delivered.
    Stopped,
    /// Frames are being delivered.
    Started,
    /// Delivery is suspended.
    Paused,
    /// Terminal. Every subsequent operation fails with a cancellation error.
    ShutDown,
}

/// The outcome of a frame pull.
#[derive(Debug)]
pub enum NextFrame {
    /// A frame is ready. Resolve its payload with [`MkvDemuxer::frame_payload`].
    Frame(FrameDescriptor),
    /// No frame can be delivered in the current state.
    NeedMore,
    /// All frames have been delivered.
    EndOfStream,
}

enum ParseStep {
    /// The step consumed data; parse again.
    Continue,
    /// The window is short by at least this many bytes.
    NeedData(usize),
    /// The controller must reposition the source to this absolute offset.
    Jump(u64),
    /// The opening phase is complete.
    OpeningDone,
}

/// A pull-driven Matroska/WebM demultiplexer over a seekable byte source.
pub struct MkvDemuxer {
    source: Box<dyn ByteSource>,
    window: ReadBuffer,
    state: DemuxerState,
    master: MasterData,
    time_base: TimeBase,
    ring: FrameRing,
    /// Bytes of the current block left in the window, consumed once the ring drains.
    pending: usize,
    /// The absolute source offset of the first byte of the window.
    window_pos: u64,
    /// Remaining bytes of an oversized element being skipped without buffering.
    skip: u64,
    read_len: usize,
    in_cluster: bool,
    cluster_timecode: Option<u64>,
    /// Opening-phase jump targets already taken, to refuse a SeekHead that loops.
    attempted_jumps: Vec<u64>,
    resumed_at_eof: bool,
    eos: bool,
}

impl MkvDemuxer {
    /// Opens a Matroska/WebM stream: verifies the EBML document header, aggregates the
    /// segment metadata, and stops at the first cluster. On success the demuxer is in the
    /// `Stopped` state with [`MkvDemuxer::master_data`] fully populated.
    pub fn open(source: Box<dyn ByteSource>, options: &DemuxerOptions) -> Result<MkvDemuxer> {
        if !source.is_seekable() {
            return unsupported_error("mkv: byte source must be seekable");
        }

        let mut demuxer = MkvDemuxer {
            source,
            window: ReadBuffer::new(options.read_len),
            state: DemuxerState::Opening,
            master: MasterData::default(),
            time_base: TimeBase::default(),
            ring: FrameRing::new(options.frame_ring_len),
            pending: 0,
            window_pos: 0,
            skip: 0,
            read_len: options.read_len,
            in_cluster: false,
            cluster_timecode: None,
            attempted_jumps: Vec::new(),
            resumed_at_eof: false,
            eos: false,
        };

        demuxer.run_opening()?;
        demuxer.state = DemuxerState::Stopped;

        Ok(demuxer)
    }

    /// Gets the segment metadata. Read-only once opening has finished.
    pub fn master_data(&self) -> &MasterData {
        &self.master
    }

    /// Gets the segment's time base.
    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    /// Gets the current lifecycle state.
    pub fn state(&self) -> DemuxerState {
        self.state
    }

    /// Begins (or resumes) frame delivery. A non-zero `start_pos` in 100-nanosecond media
    /// units requests a cue-indexed jump to the latest cue at or before that time.
    pub fn start(&mut self, start_pos: u64) -> Result<()> {
        match self.state {
            DemuxerState::ShutDown => return cancelled_error(),
            DemuxerState::Opening => return decode_error("mkv: demuxer is still opening"),
            _ => (),
        }

        if start_pos > 0 {
            if self.master.cues.is_empty() {
                return seek_error(SeekErrorKind::Unseekable);
            }

            let target = self.time_base.hns_to_ticks(start_pos);

            // find_seek_point is infallible with a non-empty cue index.
            let cue = self.master.find_seek_point(target).unwrap();
            let position = match cue.positions.first() {
                Some(position) => position.cluster_position,
                None => return decode_error("mkv: cue point carries no positions"),
            };

            log::info!("seeking to cue time {} for target {}", cue.time, target);

            let jump = self.master.segment_offset + position;
            self.jump_to(jump)?;
            self.ring.clear();
            self.pending = 0;
            self.eos = false;
        }

        self.state = DemuxerState::Started;
        Ok(())
    }

    /// Stops frame delivery and discards undelivered frames. The model stays valid.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            DemuxerState::ShutDown => return cancelled_error(),
            DemuxerState::Opening => return decode_error("mkv: demuxer is still opening"),
            _ => (),
        }

        self.ring.clear();
        if self.pending > 0 {
            self.consume(self.pending);
            self.pending = 0;
        }

        self.state = DemuxerState::Stopped;
        Ok(())
    }

    /// Suspends frame delivery. Undelivered frames are retained.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            DemuxerState::ShutDown => return cancelled_error(),
            DemuxerState::Started => {
                self.state = DemuxerState::Paused;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Sets the playback rate. Only 0.0 (pause) and 1.0 (normal) are supported.
    pub fn set_rate(&mut self, rate: f64) -> Result<()> {
        if rate == 0.0 {
            self.pause()
        }
        else if rate == 1.0 {
            if self.state == DemuxerState::Paused {
                self.state = DemuxerState::Started;
            }
            Ok(())
        }
        else {
            unsupported_error("mkv: only rates 0.0 and 1.0 are supported")
        }
    }

    /// Shuts the demuxer down. Terminal; every later operation fails with a cancellation
    /// error.
    pub fn shutdown(&mut self) {
        self.state = DemuxerState::ShutDown;
        self.ring.clear();
        self.pending = 0;
    }

    /// Pulls the next frame. Returns `NeedMore` while delivery is stopped or paused.
    pub fn next_frame(&mut self) -> Result<NextFrame> {
        match self.state {
            DemuxerState::ShutDown => return cancelled_error(),
            DemuxerState::Opening => return decode_error("mkv: demuxer is still opening"),
            DemuxerState::Stopped | DemuxerState::Paused => return Ok(NextFrame::NeedMore),
            DemuxerState::Started => (),
        }

        // The window advance past the previous block is deferred until its last frame has
        // been consumed, so descriptors stay resolvable across pulls.
        if self.ring.is_empty() && self.pending > 0 {
            self.consume(self.pending);
            self.pending = 0;
        }

        loop {
            if let Some(frame) = self.ring.pop() {
                return Ok(NextFrame::Frame(frame));
            }

            if self.eos {
                return Ok(NextFrame::EndOfStream);
            }

            match self.streaming_step()? {
                ParseStep::Continue => (),
                ParseStep::NeedData(len) => {
                    if self.fill(len)? == 0 {
                        self.eos = true;
                    }
                }
                ParseStep::Jump(_) | ParseStep::OpeningDone => unreachable!(),
            }
        }
    }

    /// Resolves a frame descriptor to its payload bytes. The slice is valid until the next
    /// call to [`MkvDemuxer::next_frame`] or a state transition.
    pub fn frame_payload(&self, frame: &FrameDescriptor) -> &[u8] {
        &self.window.data()[frame.offset..frame.offset + frame.len]
    }

    fn run_opening(&mut self) -> Result<()> {
        loop {
            match self.opening_step()? {
                ParseStep::Continue => (),
                ParseStep::NeedData(len) => {
                    if self.fill(len)? == 0 {
                        self.opening_eof()?;
                    }
                }
                ParseStep::Jump(target) => {
                    if self.attempted_jumps.contains(&target) {
                        return decode_error("mkv: seek head target did not resolve");
                    }
                    self.attempted_jumps.push(target);
                    self.jump_to(target)?;
                }
                ParseStep::OpeningDone => {
                    self.finish_opening();
                    return Ok(());
                }
            }
        }
    }

    /// Parses one top-level element during the opening phase.
    fn opening_step(&mut self) -> Result<ParseStep> {
        if self.skip > 0 {
            return Ok(self.skip_step());
        }
        if self.window.is_empty() {
            return Ok(ParseStep::NeedData(self.read_len));
        }

        let mut reader = BufReader::new(self.window.data());

        let header = match ElementHeader::read(&mut reader) {
            Ok(header) => header,
            // The header itself is split across the window end.
            Err(Error::EndOfStream) => return Ok(ParseStep::NeedData(self.read_len)),
            Err(err) => return Err(err),
        };
        let header_len = reader.pos() as usize;

        match schema::kind_of(header.id) {
            Some(ElementKind::Streamed) if header.id == ids::SEGMENT => {
                self.master.segment_offset = self.window_pos + header_len as u64;
                log::info!("segment payload starts at {}", self.master.segment_offset);
                self.consume(header_len);
                Ok(ParseStep::Continue)
            }
            Some(ElementKind::Streamed) => {
                // The first cluster. Before entering the streaming phase the model must be
                // complete; follow the seek head to anything still missing.
                if let Some(seek) = self.master.missing_target() {
                    log::info!(
                        "cluster reached before {}, following seek head",
                        seek.target_name()
                    );
                    return Ok(ParseStep::Jump(self.master.segment_offset + seek.position));
                }

                self.master.first_cluster_offset = Some(self.window_pos);
                self.consume(header_len);
                self.in_cluster = true;
                self.cluster_timecode = None;
                Ok(ParseStep::OpeningDone)
            }
            Some(ElementKind::Master) => {
                let size = match header.size {
                    Some(size) => size,
                    None => return decode_error("mkv: unknown-length metadata element"),
                };
                let total = header_len + size as usize;

                if total > self.window.size() {
                    return Ok(ParseStep::NeedData(total - self.window.size()));
                }

                let node = ebml::read_tree(&mut reader, header.id, size)?;
                drop(reader);

                if header.id == ids::EBML {
                    check_ebml_header(&node)?;
                }
                else {
                    self.master.ingest(&node);
                }

                self.consume(total);
                Ok(ParseStep::Continue)
            }
            _ => {
                // Primitive, binary, or unknown elements at top level carry nothing the
                // model wants. Skip them, incrementally when oversized.
                let size = match header.size {
                    Some(size) => size,
                    None => return decode_error("mkv: unknown-length metadata element"),
                };
                drop(reader);
                self.skip_element(header_len, size);
                Ok(ParseStep::Continue)
            }
        }
    }

    /// Parses one cluster child (or stray top-level element) during the streaming phase.
    fn streaming_step(&mut self) -> Result<ParseStep> {
        if self.skip > 0 {
            return Ok(self.skip_step());
        }
        if self.window.is_empty() {
            return Ok(ParseStep::NeedData(self.read_len));
        }

        let mut reader = BufReader::new(self.window.data());

        let header = match ElementHeader::read(&mut reader) {
            Ok(header) => header,
            Err(Error::EndOfStream) => return Ok(ParseStep::NeedData(self.read_len)),
            Err(err) => return Err(err),
        };
        let header_len = reader.pos() as usize;
        drop(reader);

        match header.id {
            ids::CLUSTER => {
                self.consume(header_len);
                self.in_cluster = true;
                self.cluster_timecode = None;
                Ok(ParseStep::Continue)
            }
            ids::SEGMENT => {
                // A second segment is not played.
                log::warn!("mkv: second segment encountered, ending stream");
                self.eos = true;
                Ok(ParseStep::Continue)
            }
            ids::TIMECODE => {
                let size = match header.size {
                    Some(size) => size,
                    None => return decode_error("mkv: unknown-length timecode"),
                };
                let total = header_len + size as usize;
                if total > self.window.size() {
                    return Ok(ParseStep::NeedData(total - self.window.size()));
                }

                let mut reader = BufReader::new(&self.window.data()[header_len..total]);
                let value = match schema::read_value(&mut reader, ElementKind::Unsigned, size)? {
                    ebml::EbmlValue::Unsigned(value) => value,
                    _ => unreachable!(),
                };

                if self.in_cluster {
                    self.cluster_timecode = Some(value);
                }
                else {
                    log::warn!("mkv: timecode element outside of a cluster");
                }

                self.consume(total);
                Ok(ParseStep::Continue)
            }
            ids::SIMPLE_BLOCK => self.block_step(&header, header_len, true),
            ids::BLOCK_GROUP => self.block_group_step(&header, header_len),
            _ => match schema::kind_of(header.id) {
                Some(ElementKind::Master) => {
                    // Metadata that trails the clusters (commonly Cues) is still folded into
                    // the model.
                    let size = match header.size {
                        Some(size) => size,
                        None => return decode_error("mkv: unknown-length metadata element"),
                    };
                    let total = header_len + size as usize;
                    if total > self.window.size() {
                        return Ok(ParseStep::NeedData(total - self.window.size()));
                    }

                    let mut reader = BufReader::new(self.window.data());
                    reader.ignore_bytes(header_len as u64)?;
                    let node = ebml::read_tree(&mut reader, header.id, size)?;
                    drop(reader);

                    self.master.ingest(&node);
                    self.consume(total);
                    Ok(ParseStep::Continue)
                }
                _ => {
                    let size = match header.size {
                        Some(size) => size,
                        None => return decode_error("mkv: unknown-length element"),
                    };
                    self.skip_element(header_len, size);
                    Ok(ParseStep::Continue)
                }
            },
        }
    }

    /// Frames a SimpleBlock (or a bare Block) whose payload spans
    /// `[header_len..header_len + size)` of the window.
    fn block_step(&mut self, header: &ElementHeader, header_len: usize, is_simple: bool) -> Result<ParseStep> {
        let size = match header.size {
            Some(size) => size,
            None => return decode_error("mkv: unknown-length block"),
        };
        let total = header_len + size as usize;

        if total > self.window.size() {
            return Ok(ParseStep::NeedData(total - self.window.size()));
        }

        if !self.in_cluster {
            log::warn!("mkv: block element outside of a cluster");
            self.consume(total);
            return Ok(ParseStep::Continue);
        }

        let result = lacing::extract_frames(
            &self.window.data()[header_len..total],
            header_len,
            is_simple,
            self.cluster_timecode.unwrap_or(0),
            None,
            &self.master.tracks,
            self.time_base,
            &mut self.ring,
        );

        self.finish_block(result, total)
    }

    /// Frames the Block inside a BlockGroup, honoring BlockDuration.
    fn block_group_step(&mut self, header: &ElementHeader, header_len: usize) -> Result<ParseStep> {
        let size = match header.size {
            Some(size) => size,
            None => return decode_error("mkv: unknown-length block group"),
        };
        let total = header_len + size as usize;

        if total > self.window.size() {
            return Ok(ParseStep::NeedData(total - self.window.size()));
        }

        if !self.in_cluster {
            log::warn!("mkv: block group element outside of a cluster");
            self.consume(total);
            return Ok(ParseStep::Continue);
        }

        // Locate the Block child in place so descriptors can address window bytes, instead
        // of buffering the group as a tree.
        let mut block: Option<(usize, usize)> = None;
        let mut block_duration = None;

        {
            let mut reader = BufReader::new(&self.window.data()[..total]);
            reader.ignore_bytes(header_len as u64)?;

            while reader.pos() < total as u64 {
                let child = match ElementHeader::read(&mut reader) {
                    Ok(child) => child,
                    Err(_) => break,
                };
                let child_size = match child.size {
                    Some(child_size) => child_size,
                    None => break,
                };
                if child_size > total as u64 - reader.pos() {
                    log::warn!("mkv: block group child overruns the group");
                    break;
                }

                match child.id {
                    ids::BLOCK => {
                        if block.is_some() {
                            log::warn!("mkv: block group with more than one block");
                        }
                        else {
                            block = Some((reader.pos() as usize, child_size as usize));
                        }
                        reader.ignore_bytes(child_size)?;
                    }
                    ids::BLOCK_DURATION => {
                        let mut value_reader =
                            BufReader::new(&self.window.data()[reader.pos() as usize..]);
                        if let ebml::EbmlValue::Unsigned(value) = schema::read_value(
                            &mut value_reader,
                            ElementKind::Unsigned,
                            child_size,
                        )? {
                            block_duration = Some(value);
                        }
                        reader.ignore_bytes(child_size)?;
                    }
                    _ => {
                        // ReferenceBlock, DiscardPadding, and additions are not modeled.
                        reader.ignore_bytes(child_size)?;
                    }
                }
            }
        }

        let (offset, len) = match block {
            Some(block) => block,
            None => {
                log::warn!("mkv: block group without a block");
                self.consume(total);
                return Ok(ParseStep::Continue);
            }
        };

        let result = lacing::extract_frames(
            &self.window.data()[offset..offset + len],
            offset,
            false,
            self.cluster_timecode.unwrap_or(0),
            block_duration,
            &self.master.tracks,
            self.time_base,
            &mut self.ring,
        );

        self.finish_block(result, total)
    }

    /// Applies the outcome of a block parse: hold the window on success, or skip the block
    /// on a recoverable error.
    fn finish_block(&mut self, result: Result<()>, total: usize) -> Result<ParseStep> {
        match result {
            Ok(()) => {
                self.pending = total;
                Ok(ParseStep::Continue)
            }
            Err(Error::Unsupported(feature)) => {
                log::warn!("mkv: skipping block: {}", feature);
                self.ring.clear();
                self.consume(total);
                Ok(ParseStep::Continue)
            }
            Err(Error::DecodeError(reason)) => {
                // A format error inside a cluster truncates the block, not the stream.
                log::warn!("mkv: skipping malformed block: {}", reason);
                self.ring.clear();
                self.consume(total);
                Ok(ParseStep::Continue)
            }
            Err(err) => Err(err),
        }
    }

    /// Consumes part of an element being skipped without buffering it.
    fn skip_step(&mut self) -> ParseStep {
        let available = self.window.size().min(self.skip as usize);
        if available == 0 {
            return ParseStep::NeedData(self.read_len);
        }
        self.consume(available);
        self.skip -= available as u64;
        ParseStep::Continue
    }

    /// Skips an element of `size` payload bytes, buffering no more than the window already
    /// holds.
    fn skip_element(&mut self, header_len: usize, size: u64) {
        let total = header_len as u64 + size;
        let available = self.window.size().min(total as usize);
        self.consume(available);
        self.skip = total - available as u64;
    }

    /// Handles end-of-stream during the opening phase: the seek head walked us past the
    /// clusters, so resume at the first indexed cluster.
    fn opening_eof(&mut self) -> Result<()> {
        if self.master.missing_target().is_some() {
            return decode_error("mkv: stream ended before segment metadata was complete");
        }
        if self.resumed_at_eof {
            return decode_error("mkv: cue index does not lead to a cluster");
        }
        self.resumed_at_eof = true;

        let position = self
            .master
            .cues
            .first()
            .and_then(|cue| cue.positions.first())
            .map(|position| position.cluster_position);

        match position {
            Some(position) => {
                log::info!("metadata complete at end of stream, resuming at first cue");
                self.jump_to(self.master.segment_offset + position)
            }
            None => decode_error("mkv: stream holds no clusters"),
        }
    }

    fn finish_opening(&mut self) {
        if let Some(info) = &self.master.info {
            self.time_base = TimeBase::new(info.timecode_scale);
        }
        else {
            log::warn!("mkv: no segment info; using the default timecode scale");
        }
        if self.master.tracks.is_empty() {
            log::warn!("mkv: no tracks were declared");
        }
    }

    /// Requests at least `len` more bytes from the source. Returns the number of bytes
    /// appended to the window; zero signals end of stream.
    fn fill(&mut self, len: usize) -> Result<usize> {
        if self.state == DemuxerState::ShutDown {
            return cancelled_error();
        }

        let request = len.max(self.read_len);
        Ok(self.window.fill_from(&mut self.source, request)?)
    }

    /// Repositions the source and flushes every byte derived from the old position.
    fn jump_to(&mut self, target: u64) -> Result<()> {
        if self.state == DemuxerState::ShutDown {
            return cancelled_error();
        }

        if let Some(len) = self.source.byte_len() {
            if target >= len {
                return seek_error(SeekErrorKind::OutOfRange);
            }
        }

        log::debug!("jumping to absolute offset {}", target);

        self.source.seek(SeekFrom::Start(target))?;
        self.window.clear();
        self.window_pos = target;
        self.skip = 0;
        self.in_cluster = false;
        self.cluster_timecode = None;

        Ok(())
    }

    #[inline]
    fn consume(&mut self, len: usize) {
        self.window.move_start(len);
        self.window_pos += len as u64;
    }
}

fn check_ebml_header(node: &ebml::EbmlNode) -> Result<()> {
    let doc_type = node.find(ids::DOC_TYPE).and_then(|child| child.as_str());

    match doc_type {
        Some("matroska") | Some("webm") => Ok(()),
        _ => unsupported_error("mkv: not a matroska / webm file"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use toccata_core::errors::Error;

    use super::*;
    use crate::ebml::encode_vint;
    use crate::schema::ids;

    fn id_bytes(id: u32) -> Vec<u8> {
        let bytes = id.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        bytes[start..].to_vec()
    }

    fn elem(id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = id_bytes(id);
        let (size, size_len) = encode_vint(payload.len() as u64);
        out.extend_from_slice(&size[..size_len]);
        out.extend_from_slice(payload);
        out
    }

    fn uint(id: u32, value: u64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        elem(id, &bytes[start..])
    }

    /// An unsigned element with a fixed two-byte payload, so container sizes stay stable
    /// while seek positions are patched in.
    fn uint16(id: u32, value: u64) -> Vec<u8> {
        elem(id, &(value as u16).to_be_bytes())
    }

    fn ascii(id: u32, value: &str) -> Vec<u8> {
        elem(id, value.as_bytes())
    }

    fn ebml_header() -> Vec<u8> {
        let mut payload = ascii(ids::DOC_TYPE, "matroska");
        payload.extend(uint(ids::DOC_TYPE_READ_VERSION, 2));
        elem(ids::EBML, &payload)
    }

    fn simple_block(track: u64, relative_timecode: i16, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut block = Vec::new();
        let (track_vint, track_len) = encode_vint(track);
        block.extend_from_slice(&track_vint[..track_len]);
        block.extend_from_slice(&relative_timecode.to_be_bytes());
        block.push(flags);
        block.extend_from_slice(payload);
        elem(ids::SIMPLE_BLOCK, &block)
    }

    fn video_tracks() -> Vec<u8> {
        let mut video = uint(ids::PIXEL_WIDTH, 640);
        video.extend(uint(ids::PIXEL_HEIGHT, 360));

        let mut entry = uint(ids::TRACK_NUMBER, 1);
        entry.extend(uint(ids::TRACK_TYPE, 1));
        entry.extend(ascii(ids::CODEC_ID, "V_VP8"));
        entry.extend(elem(ids::VIDEO, &video));

        elem(ids::TRACKS, &elem(ids::TRACK_ENTRY, &entry))
    }

    fn cue(time: u64, cluster_position: u64) -> Vec<u8> {
        let mut positions = uint(ids::CUE_TRACK, 1);
        positions.extend(uint16(ids::CUE_CLUSTER_POSITION, cluster_position));

        let mut point = uint16(ids::CUE_TIME, time);
        point.extend(elem(ids::CUE_TRACK_POSITIONS, &positions));
        elem(ids::CUE_POINT, &point)
    }

    fn seek_entry(target_id: u32, position: u64) -> Vec<u8> {
        let mut seek = elem(ids::SEEK_ID, &id_bytes(target_id));
        seek.extend(uint16(ids::SEEK_POSITION, position));
        elem(ids::SEEK, &seek)
    }

    /// Assembles a whole file: EBML header, then a Segment of SeekHead, Info, Tracks, Cues,
    /// and the provided clusters. Returns the file and the cluster offsets relative to the
    /// segment payload.
    fn build_file(clusters: &[Vec<u8>], cue_times: &[u64]) -> (Vec<u8>, Vec<u64>) {
        let info = elem(ids::INFO, &uint(ids::TIMECODE_SCALE, 1_000_000));
        let tracks = video_tracks();

        // The seek head length is independent of the positions patched in below because
        // every position is encoded with a fixed width.
        let build_seek_head = |info_pos, tracks_pos, cues_pos| {
            let mut payload = seek_entry(ids::INFO, info_pos);
            payload.extend(seek_entry(ids::TRACKS, tracks_pos));
            payload.extend(seek_entry(ids::CUES, cues_pos));
            elem(ids::SEEK_HEAD, &payload)
        };
        let build_cues = |offsets: &[u64]| {
            let mut payload = Vec::new();
            for (&time, &offset) in cue_times.iter().zip(offsets) {
                payload.extend(cue(time, offset));
            }
            elem(ids::CUES, &payload)
        };

        let seek_head_len = build_seek_head(0, 0, 0).len() as u64;
        let info_pos = seek_head_len;
        let tracks_pos = info_pos + info.len() as u64;
        let cues_pos = tracks_pos + tracks.len() as u64;
        let cues_len = build_cues(&vec![0; cue_times.len()]).len() as u64;

        let mut cluster_offsets = Vec::new();
        let mut offset = cues_pos + cues_len;
        for cluster in clusters {
            cluster_offsets.push(offset);
            offset += cluster.len() as u64;
        }

        let mut payload = build_seek_head(info_pos, tracks_pos, cues_pos);
        payload.extend(info);
        payload.extend(tracks);
        payload.extend(build_cues(&cluster_offsets));
        for cluster in clusters {
            payload.extend_from_slice(cluster);
        }

        let mut file = ebml_header();
        file.extend(elem(ids::SEGMENT, &payload));
        (file, cluster_offsets)
    }

    fn open(file: Vec<u8>) -> MkvDemuxer {
        MkvDemuxer::open(Box::new(Cursor::new(file)), &DemuxerOptions::default()).unwrap()
    }

    #[test]
    fn open_exposes_the_model() {
        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, 0x80, &[0xAB; 100]));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let demuxer = open(file);
        assert_eq!(demuxer.state(), DemuxerState::Stopped);

        let master = demuxer.master_data();
        assert_eq!(master.tracks.len(), 1);
        assert_eq!(master.tracks[0].codec_id, "V_VP8");
        assert!(master.tracks[0].video.is_some());
        assert_eq!(master.cues.len(), 1);
        assert_eq!(master.info.as_ref().unwrap().timecode_scale, 1_000_000);
        assert!(master.first_cluster_offset.is_some());
    }

    #[test]
    fn single_block_delivers_one_frame() {
        let payload: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, 0x80, &payload));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.start(0).unwrap();

        let frame = match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => frame,
            other => panic!("expected a frame, got {:?}", other),
        };
        assert_eq!(frame.track, 1);
        assert_eq!(frame.timestamp, 0);
        assert!(frame.keyframe);
        assert_eq!(frame.len, 100);
        assert_eq!(demuxer.frame_payload(&frame), &payload[..]);

        match demuxer.next_frame().unwrap() {
            NextFrame::EndOfStream => (),
            other => panic!("expected end of stream, got {:?}", other),
        }
    }

    #[test]
    fn block_timestamps_are_cluster_relative() {
        let mut cluster = uint(ids::TIMECODE, 500);
        cluster.extend(simple_block(1, 16, 0x80, &[1, 2, 3]));
        cluster.extend(simple_block(1, -4, 0x00, &[4, 5, 6]));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.start(0).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => {
                assert_eq!(frame.timestamp, 516);
                assert!(frame.keyframe);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => {
                assert_eq!(frame.timestamp, 496);
                assert!(!frame.keyframe);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn start_with_position_follows_the_cue_index() {
        let mut cluster_a = uint(ids::TIMECODE, 0);
        cluster_a.extend(simple_block(1, 0, 0x80, &[0xA0; 8]));
        let mut cluster_b = uint16(ids::TIMECODE, 2000);
        cluster_b.extend(simple_block(1, 0, 0x80, &[0xB0; 8]));

        let clusters = vec![elem(ids::CLUSTER, &cluster_a), elem(ids::CLUSTER, &cluster_b)];
        let (file, _) = build_file(&clusters, &[0, 2000]);

        let mut demuxer = open(file);

        // 2000 ticks at 1ms per tick = 2s = 20,000,000 media units of 100ns.
        demuxer.start(20_000_000).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => assert_eq!(frame.timestamp, 2000),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn start_between_cues_picks_the_preceding_point() {
        let mut cluster_a = uint(ids::TIMECODE, 0);
        cluster_a.extend(simple_block(1, 0, 0x80, &[0xA0; 8]));
        let mut cluster_b = uint16(ids::TIMECODE, 2000);
        cluster_b.extend(simple_block(1, 0, 0x80, &[0xB0; 8]));

        let clusters = vec![elem(ids::CLUSTER, &cluster_a), elem(ids::CLUSTER, &cluster_b)];
        let (file, _) = build_file(&clusters, &[0, 2000]);

        let mut demuxer = open(file);

        // 1.5s lands between the cue points; delivery resumes from the first cluster.
        demuxer.start(15_000_000).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => assert_eq!(frame.timestamp, 0),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn paused_delivery_reports_need_more() {
        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, 0x80, &[1; 4]));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);

        match demuxer.next_frame().unwrap() {
            NextFrame::NeedMore => (),
            other => panic!("expected NeedMore while stopped, got {:?}", other),
        }

        demuxer.start(0).unwrap();
        demuxer.pause().unwrap();
        match demuxer.next_frame().unwrap() {
            NextFrame::NeedMore => (),
            other => panic!("expected NeedMore while paused, got {:?}", other),
        }

        demuxer.set_rate(1.0).unwrap();
        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(_) => (),
            other => panic!("expected a frame, got {:?}", other),
        }

        assert!(demuxer.set_rate(2.0).is_err());
    }

    #[test]
    fn shutdown_cancels_everything() {
        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, 0x80, &[1; 4]));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.shutdown();

        assert!(matches!(demuxer.next_frame(), Err(Error::Cancelled)));
        assert!(matches!(demuxer.start(0), Err(Error::Cancelled)));
        assert!(matches!(demuxer.stop(), Err(Error::Cancelled)));
    }

    #[test]
    fn laced_block_delivers_every_frame() {
        // A fixed-size lace of three 4 byte frames.
        let mut block = Vec::new();
        block.extend_from_slice(&[0x81, 0x00, 0x00, 0x84, 0x02]);
        block.extend_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);

        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(elem(ids::SIMPLE_BLOCK, &block));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.start(0).unwrap();

        for expected in [[1u8; 4], [2u8; 4], [3u8; 4]] {
            match demuxer.next_frame().unwrap() {
                NextFrame::Frame(frame) => {
                    assert_eq!(demuxer.frame_payload(&frame), &expected);
                }
                other => panic!("expected a frame, got {:?}", other),
            }
        }

        match demuxer.next_frame().unwrap() {
            NextFrame::EndOfStream => (),
            other => panic!("expected end of stream, got {:?}", other),
        }
    }

    #[test]
    fn block_group_honors_block_duration() {
        let mut block = Vec::new();
        block.extend_from_slice(&[0x81, 0x00, 0x00, 0x00]);
        block.extend_from_slice(&[7; 6]);

        let mut group = elem(ids::BLOCK, &block);
        group.extend(uint(ids::BLOCK_DURATION, 25));

        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(elem(ids::BLOCK_GROUP, &group));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.start(0).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => {
                assert_eq!(frame.duration, Some(25));
                assert!(!frame.keyframe);
                assert_eq!(demuxer.frame_payload(&frame), &[7; 6]);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn xiph_laced_blocks_are_skipped() {
        // A Xiph-laced block followed by a plain one. The former is skipped with a
        // diagnostic, the latter is delivered.
        let mut xiph = Vec::new();
        xiph.extend_from_slice(&[0x81, 0x00, 0x00, 0x82, 0x01, 0x02]);
        xiph.extend_from_slice(&[9; 6]);

        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(elem(ids::SIMPLE_BLOCK, &xiph));
        cluster.extend(simple_block(1, 8, 0x80, &[4; 4]));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let mut demuxer = open(file);
        demuxer.start(0).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => assert_eq!(frame.timestamp, 8),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn unseekable_sources_are_rejected() {
        let (file, _) = build_file(&[], &[]);
        let source = toccata_core::io::ReadOnlySource::new(Cursor::new(file));

        let result = MkvDemuxer::open(Box::new(source), &DemuxerOptions::default());
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn not_matroska_is_rejected() {
        let mut payload = ascii(ids::DOC_TYPE, "theora");
        payload.extend(uint(ids::DOC_TYPE_READ_VERSION, 2));
        let mut file = elem(ids::EBML, &payload);
        file.extend(elem(ids::SEGMENT, &[]));

        let result = MkvDemuxer::open(Box::new(Cursor::new(file)), &DemuxerOptions::default());
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn small_read_lengths_stream_the_same_frames() {
        // Force the need-more-data path on every element by reading 16 bytes at a time.
        let payload: Vec<u8> = (0..200u32).map(|i| (i * 7) as u8).collect();
        let mut cluster = uint(ids::TIMECODE, 0);
        cluster.extend(simple_block(1, 0, 0x80, &payload));
        let (file, _) = build_file(&[elem(ids::CLUSTER, &cluster)], &[0]);

        let options = DemuxerOptions { read_len: 16, ..Default::default() };
        let mut demuxer = MkvDemuxer::open(Box::new(Cursor::new(file)), &options).unwrap();
        demuxer.start(0).unwrap();

        match demuxer.next_frame().unwrap() {
            NextFrame::Frame(frame) => {
                assert_eq!(frame.len, 200);
                assert_eq!(demuxer.frame_payload(&frame), &payload[..]);
            }
            other => panic!("expected a frame, got {:?}", other),
        }
    }
}
