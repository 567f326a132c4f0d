//! A reader that can be failed from the outside.
//!
//! [`CancelableReader`] lets a party other than the reader make all future
//! reads fail with an error of its choosing.  This is how the consumer of a
//! [`crate::filter`] stream unwinds the producer thread without any form of
//! preemption.
//!
//! Cancellation is cooperative: a read that is already blocked inside the
//! wrapped reader (a slow network stream, say) is not interrupted.  It has to
//! complete or fail on its own, and the poison takes effect on the next call.

use std::{
    io::{self, Read},
    sync::{Arc, Mutex, PoisonError},
};

use crate::error::SharedError;

/// Handle to the poison cell of a [`CancelableReader`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    err: Arc<Mutex<Option<SharedError>>>,
}

impl CancelHandle {
    /// Make every future read on the associated reader fail with `err`.
    ///
    /// Calling this more than once replaces the stored error.
    pub fn cancel(&self, err: impl Into<SharedError>) {
        let mut slot = self.err.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(err.into());
    }

    pub fn is_canceled(&self) -> bool {
        self.err
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn check(&self) -> io::Result<()> {
        match &*self.err.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err.to_io_error()),
            None => Ok(()),
        }
    }
}

/// Wraps a reader with an externally injectable terminal error.
#[derive(Debug)]
pub struct CancelableReader<R> {
    inner: R,
    handle: CancelHandle,
}

impl<R> CancelableReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            handle: CancelHandle::default(),
        }
    }

    /// A handle that can cancel this reader from another thread.
    pub fn handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CancelableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // the lock is only held for the check: cancel() never waits on a slow read
        self.handle.check()?;
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_passthrough() {
        let mut reader = CancelableReader::new(b"hello world" as &[u8]);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
        assert!(!reader.handle().is_canceled());
    }

    #[test]
    fn test_cancel_poisons_future_reads() {
        let mut reader = CancelableReader::new(b"0123456789" as &[u8]);
        let handle = reader.handle();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        handle.cancel(io::Error::new(io::ErrorKind::TimedOut, "stop"));
        assert!(handle.is_canceled());
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "stop");

        // and stays that way, without touching the inner reader
        assert_eq!(
            reader.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(reader.into_inner(), &b"456789"[..]);
    }

    #[test]
    fn test_last_cancel_wins() {
        let mut reader = CancelableReader::new(io::empty());
        let handle = reader.handle();
        handle.cancel(io::Error::other("first"));
        handle.clone().cancel(io::Error::other("second"));
        assert_eq!(reader.read(&mut [0; 1]).unwrap_err().to_string(), "second");
    }
}
