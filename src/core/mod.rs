//! Archive engine
//!
//! Bottom-up: on-disk fields and records (`header`, `block`, `ddt`,
//! `index`, `tape`), sector shapes and fix-ups (`sector`, `fixup`), block
//! compression (`codec`), the decoded block cache (`cache`) and the handle
//! tying them together (`archive`).

pub mod archive;
pub mod block;
pub mod cache;
pub mod codec;
pub mod config;
pub mod ddt;
pub mod error;
pub(crate) mod fields;
pub mod fixup;
pub mod header;
pub mod index;
pub mod io;
pub mod sector;
pub mod tape;
pub mod writer;

pub use archive::{Archive, ArchiveStats};
