//! Re-packaging of Windows container layers.
//!
//! A Windows container layer is a tar stream that keeps the container
//! filesystem under `Files/` next to registry hives and other metadata.  This
//! crate turns such a layer into a plain OCI layer while it is being applied:
//! the tar stream is filtered and rewritten by a producer thread, handed to
//! the extractor through a bounded pipe, and the raw stream is digested and
//! counted on the way through so the caller gets a descriptor for exactly the
//! bytes that were read.
//!
//! The building blocks, leaf to root:
//!
//!  - [`cancel::CancelableReader`]: a reader that can be poisoned from another thread
//!  - [`counter::CountingReader`] and [`digester::DigestingReader`]: byte accounting
//!  - [`pipe`]: a blocking, unbuffered in-memory pipe
//!  - [`filter::filter`]: the streaming filter/rewrite engine
//!  - [`applier`]: the orchestration of content, decompression, mounts and extraction

pub mod applier;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod content;
pub mod counter;
pub mod digester;
pub mod error;
pub mod extract;
pub mod filter;
pub mod mount;
pub mod pipe;
pub mod rewrite;


pub use error::{Error, Result, SharedError};
