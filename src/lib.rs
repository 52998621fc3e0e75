//! Amiga Smart File System engine.
//!
//! A block-structured, big-endian filesystem engine that reads and mutates a
//! fixed-block-size backing device while preserving the exact on-disk format
//! of the original Amiga SFS. The crate exposes a narrow, block-oriented API
//! through [`fs::asfs::Asfs`]; inode and page-cache plumbing belongs to the
//! layer above.

#![no_std]
#![allow(dead_code)]

pub mod errors;
pub mod fs;
pub mod io;

extern crate alloc;

#[cfg(test)]
extern crate std;
