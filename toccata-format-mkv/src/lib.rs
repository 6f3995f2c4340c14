// Toccata
// Copyright (c) 2019-2022 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A demultiplexer for EBML-framed Matroska (`.mkv`) and WebM (`.webm`) container streams.
//!
//! The demuxer consumes a seekable [`ByteSource`](toccata_core::io::ByteSource), materializes
//! the segment metadata (seek head, info, tracks, cues), and delivers compressed frame
//! payloads with timing through a pull interface. See [`MkvDemuxer`].

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod demuxer;
pub mod ebml;
pub mod lacing;
pub mod schema;
pub mod segment;

pub use crate::demuxer::{DemuxerOptions, DemuxerState, MkvDemuxer, NextFrame};
pub use crate::lacing::FrameDescriptor;
pub use crate::segment::MasterData;
