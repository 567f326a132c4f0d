//! Error types.

use std::{fmt, io, path::PathBuf, sync::Arc};

use thiserror::Error;

/// Errors returned by the layer appliers and their collaborators.
///
/// Stream-level code (the readers, the pipe and the filter) implements
/// [`std::io::Read`] and reports plain [`io::Error`]s; those end up in
/// [`Error::Io`] once they reach an applier.
#[derive(Debug, Error)]
pub enum Error {
    /// The layer's media type has no known decompression.
    #[error("unsupported diff media type: {0}")]
    UnsupportedMediaType(String),

    /// The content store could not produce a reader for a blob.
    #[error("failed to get reader from content store")]
    ContentStore(#[source] io::Error),

    /// Mounting or unmounting the apply target failed.
    #[error("mount of {target:?} failed")]
    Mount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The extractor rejected an entry.
    #[error("failed to apply {path:?}")]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The result descriptor could not be built.
    #[error("building layer descriptor")]
    Descriptor(#[from] oci_spec::OciSpecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// An [`io::Error`] that has been handed to more than one party.
///
/// `io::Error` isn't `Clone`, but cancellation needs the same error to show up
/// on the poisoned source and on the consumer side of the pipe.  Each party
/// gets a fresh `io::Error` of the same kind wrapping this value, which can be
/// recovered with [`io::Error::get_ref`] and `downcast_ref`.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<io::Error>);

impl SharedError {
    pub fn new(err: io::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The original error.
    pub fn get_ref(&self) -> &io::Error {
        &self.0
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }

    /// A new `io::Error` carrying this error.
    ///
    /// `Interrupted` is reported as `Other`: the std read loops retry on
    /// `Interrupted`, which would spin forever on a poisoned reader.
    pub fn to_io_error(&self) -> io::Error {
        let kind = match self.0.kind() {
            io::ErrorKind::Interrupted => io::ErrorKind::Other,
            kind => kind,
        };
        io::Error::new(kind, self.clone())
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<io::Error> for SharedError {
    fn from(err: io::Error) -> Self {
        Self::new(err)
    }
}
