//! # peinspect
//!
//! A structural dumper for PE/COFF images.
//!
//! ## Overview
//!
//! The image is parsed once into its headers and section table. Each data
//! directory then has its own decoder that resolves RVAs through the
//! section table and returns plain records:
//!
//! 1. Headers, sections and the data directory table
//! 2. Export, import and delay-import tables
//! 3. Resources, TLS, load config, CLR header, base relocations and debug entries
//! 4. Exception unwind information for x86-64, ARM Thumb-2 and ARM64
//!
//! Decoding never panics on hostile input. A directory that cannot be
//! resolved turns into an error for that directory alone, and
//! [`render`] prints it inline the way winedump does.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

mod bytes;
pub mod clr;
pub mod debug;
pub mod dumper;
pub mod error;
pub mod export;
pub mod image;
pub mod import;
pub mod loadcfg;
pub mod pe;
pub mod reloc;
pub mod render;
pub mod resource;
pub mod tls;
pub mod unwind;

#[cfg(test)]
mod testutil;

pub use dumper::{DumpConfig, DumpSection, Dumper, ProgressCallback, ProgressInfo, Report};
pub use error::{Error, Result};
pub use image::PeImage;
pub use pe::Headers;
