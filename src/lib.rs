//! On-page B+tree node layer for the mutable top tier of an LSM
//! index.
//!
//! A node lives in one fixed size page handed out by the buffer
//! cache. The slot directory grows from the front of the record area,
//! the variable data region grows down from the end of the page, and
//! internal separators carry markers linking them to blocks on lower
//! LSM levels. Sessions bracket every access: a shared latch for
//! reads, an exclusive latch for writes, with dirty header fields
//! flushed back when the session closes.

pub mod buf;
pub mod codec;
pub mod error;
pub mod node;
pub mod page;
pub mod search;

pub use buf::{PageBuf, PinGuard};
pub use error::{CanopyError, NodeError, Result};
pub use node::{Marker, Node, NodeFlags};
pub use page::{Page, PageId, PAGE_BYTES};
