//! A synchronous in-memory pipe.
//!
//! [`pipe`] connects one writer thread to one reader thread.  It is unbuffered
//! in the sense that matters for backpressure: a write hands over at most
//! [`PIPE_CHUNK`] bytes and does not return until the reader has consumed all
//! of them.  The producer can never get further ahead of the consumer than
//! one chunk.
//!
//! The channel is open until the first close:
//!
//!  - closed cleanly: reads return the bytes already handed over, then EOF;
//!    writes fail with `BrokenPipe`
//!  - closed with an error: reads and writes fail with that error, and any
//!    bytes not yet read are dropped
//!
//! The writer's close is terminal and later writer closes are ignored.  An
//! error from the reading side ([`PipeReader::close_with_error`],
//! [`PipeCloser`]) always takes over, even after the writer closed, so the
//! consumer sees its own cancellation.  Dropping either end without closing it
//! closes the pipe with a `BrokenPipe` error, so the other side never blocks
//! forever.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::error::SharedError;

/// The most a single write hands over to the reader.
pub const PIPE_CHUNK: usize = 32 * 1024;

#[derive(Debug)]
enum Closed {
    Eof,
    Error(SharedError),
}

impl Closed {
    fn write_error(&self) -> io::Error {
        match self {
            Closed::Eof => closed_pipe("write"),
            Closed::Error(err) => err.to_io_error(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    buf: Vec<u8>,
    pos: usize,
    closed: Option<Closed>,
}

impl State {
    fn pending(&self) -> bool {
        self.pos < self.buf.len()
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, result: Result<(), SharedError>) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(match result {
                Ok(()) => Closed::Eof,
                Err(err) => {
                    state.buf.clear();
                    state.pos = 0;
                    Closed::Error(err)
                }
            });
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Closes with `err`, replacing whatever close came before.
    fn fail(&self, err: SharedError) {
        let mut state = self.lock();
        state.buf.clear();
        state.pos = 0;
        state.closed = Some(Closed::Error(err));
        drop(state);
        self.changed.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }
}

fn closed_pipe(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("{what} on closed pipe"))
}

fn dropped(end: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, format!("pipe {end} dropped"))
}

/// Creates a new pipe.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared::default());
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

/// Closes a pipe without owning either end of it.
#[derive(Debug, Clone)]
pub struct PipeCloser {
    shared: Arc<Shared>,
}

impl PipeCloser {
    /// Close the pipe with `err`, waking up both ends.
    pub fn close_with_error(&self, err: impl Into<SharedError>) {
        self.shared.fail(err.into());
    }
}

/// The reading end of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the pipe with `err`: the writer's current and future writes fail,
    /// and so do further reads.
    pub fn close_with_error(&self, err: impl Into<SharedError>) {
        self.shared.fail(err.into());
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        loop {
            if let Some(Closed::Error(err)) = &state.closed {
                return Err(err.to_io_error());
            }
            if state.pending() {
                let n = out.len().min(state.buf.len() - state.pos);
                out[..n].copy_from_slice(&state.buf[state.pos..state.pos + n]);
                state.pos += n;
                drop(state);
                self.shared.changed.notify_all();
                return Ok(n);
            }
            if let Some(Closed::Eof) = state.closed {
                return Ok(0);
            }
            state = self.shared.wait(state);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            self.shared.close(Err(dropped("reader").into()));
        }
    }
}

/// The writing end of a [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Close the pipe.  `Ok` is a clean EOF for the reader, `Err` is handed to
    /// its current and future reads.
    pub fn close(&self, result: io::Result<()>) {
        self.shared.close(result.map_err(SharedError::new));
    }

    /// Close the pipe with an error that is already shared with someone else.
    pub fn close_with_error(&self, err: impl Into<SharedError>) {
        self.shared.close(Err(err.into()));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        (&*self).write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// Like `&File`: the writing end is used by a single thread, but this lets the
// owner close the pipe while a `tar::Builder` borrows it.
impl Write for &PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.shared.lock();
        while state.pending() && state.closed.is_none() {
            state = self.shared.wait(state);
        }
        if let Some(closed) = &state.closed {
            return Err(closed.write_error());
        }

        let n = data.len().min(PIPE_CHUNK);
        state.buf.clear();
        state.buf.extend_from_slice(&data[..n]);
        state.pos = 0;
        self.shared.changed.notify_all();

        // block until the reader has taken all of it
        while state.pending() && state.closed.is_none() {
            state = self.shared.wait(state);
        }
        match &state.closed {
            Some(Closed::Error(err)) => Err(err.to_io_error()),
            _ => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            self.shared.close(Err(dropped("writer").into()));
        }
    }
}
