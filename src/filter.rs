//! Streaming filter/rewrite of tar archives.
//!
//! [`filter`] reads a tar stream on a producer thread, asks a caller-supplied
//! decision function about every entry, and writes the accepted (and possibly
//! rewritten) entries to a fresh tar stream.  The new stream is read through
//! [`FilteredReader`], which is connected to the producer by a [`pipe`], so
//! at most one pipe chunk is ever in flight and content is never buffered in
//! full, however large an entry is.
//!
//! The caller owns the output and the [`FilterCanceler`] and must either read
//! the output to EOF or cancel it.  Cancellation is cooperative: it poisons the
//! input for the producer's next read and fails the output immediately, but a
//! read already blocked inside the input is not interrupted.

use std::{
    borrow::Cow,
    ffi::OsStr,
    fmt,
    io::{self, Read, Write},
    os::unix::ffi::OsStrExt,
    path::Path,
    thread::{self, JoinHandle},
};

use log::{debug, trace};
use tar::{Archive, Builder, EntryType, Header};

use crate::{
    cancel::{CancelHandle, CancelableReader},
    error::SharedError,
    pipe::{pipe, PipeCloser, PipeReader, PipeWriter},
};

// PAX records that are regenerated from the entry itself when it is written
const PAX_PATH: &str = "path";
const PAX_LINKPATH: &str = "linkpath";
const PAX_SIZE: &str = "size";

/// The decision function's view of an archive entry.
///
/// `path` and `link_name` are the full names, with GNU long names and PAX
/// `path`/`linkpath` records already applied.  `header` is the raw header of
/// the entry: its name fields may be truncated, and are rewritten from `path`
/// and `link_name` when the entry is written out.
#[derive(Clone)]
pub struct EntryHeader {
    pub path: Vec<u8>,
    pub link_name: Option<Vec<u8>>,
    pub header: Header,
    /// PAX records of the entry, except for the ones describing path, link
    /// target and size.
    pub pax: Vec<(String, Vec<u8>)>,
    size: u64,
}

impl fmt::Debug for EntryHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHeader")
            .field("path", &self.path_lossy())
            .field(
                "link_name",
                &self.link_name.as_deref().map(String::from_utf8_lossy),
            )
            .field("entry_type", &self.entry_type())
            .field("size", &self.size)
            .field("pax", &self.pax.len())
            .finish()
    }
}

impl EntryHeader {
    pub(crate) fn from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Self> {
        let path = entry.path_bytes().into_owned();
        let link_name = entry.link_name_bytes().map(Cow::into_owned);
        let size = entry.size();

        let mut pax = vec![];
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                let key = extension
                    .key()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if !matches!(key, PAX_PATH | PAX_LINKPATH | PAX_SIZE) {
                    pax.push((key.to_owned(), extension.value_bytes().to_vec()));
                }
            }
        }

        Ok(Self {
            path,
            link_name,
            header: entry.header().clone(),
            pax,
            size,
        })
    }

    pub fn entry_type(&self) -> EntryType {
        self.header.entry_type()
    }

    /// Size of the entry's content.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    /// Writes the entry, taking exactly `self.size` bytes of content from `content`.
    fn append_to<W: Write>(
        mut self,
        builder: &mut Builder<W>,
        content: impl Read,
    ) -> io::Result<()> {
        if !self.pax.is_empty() {
            builder.append_pax_extensions(
                self.pax
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_slice())),
            )?;
        }

        let path = Path::new(OsStr::from_bytes(&self.path));
        let mut content = ExactReader::new(content, self.size);
        match self.link_name.take() {
            Some(target) if self.is_link_type() => {
                // links are header-only on output
                io::copy(&mut content, &mut io::sink())?;
                self.header.set_size(0);
                let target = Path::new(OsStr::from_bytes(&target));
                builder.append_link(&mut self.header, path, target)
            }
            _ => {
                self.header.set_size(self.size);
                builder.append_data(&mut self.header, path, &mut content)?;
                content.finish()
            }
        }
    }

    fn is_link_type(&self) -> bool {
        matches!(self.entry_type(), EntryType::Link | EntryType::Symlink)
    }
}

/// Reads exactly `remaining` bytes from the inner reader, failing with
/// `UnexpectedEof` if it ends early.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactReader<R> {
    fn new(inner: R, remaining: u64) -> Self {
        Self { inner, remaining }
    }

    fn short(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("entry content is short by {} bytes", self.remaining),
        )
    }

    fn finish(&self) -> io::Result<()> {
        match self.remaining {
            0 => Ok(()),
            _ => Err(self.short()),
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(self.short());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Cancels a running [`filter`].
#[derive(Debug, Clone)]
pub struct FilterCanceler {
    source: CancelHandle,
    output: PipeCloser,
}

impl FilterCanceler {
    /// Fails the filter with `err`.
    ///
    /// Every future read of the input by the producer fails with `err`, and so
    /// does every current and future read of the output.  A producer blocked on
    /// writing the output wakes up and exits.  A producer blocked inside a read
    /// of the input stays blocked until that read returns.
    pub fn cancel(&self, err: io::Error) {
        let err = SharedError::new(err);
        debug!("filter: canceled: {err}");
        self.source.cancel(err.clone());
        self.output.close_with_error(err);
    }
}

type ProducerResult<R> = (R, Result<FilterStats, SharedError>);

/// Counts of what the producer did with the input entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub kept: u64,
    pub skipped: u64,
}

/// The output of [`filter`]: a tar stream of the accepted entries.
#[derive(Debug)]
pub struct FilteredReader<R> {
    output: PipeReader,
    source: CancelHandle,
    producer: Option<JoinHandle<ProducerResult<R>>>,
}

impl<R> FilteredReader<R> {
    /// Waits for the producer and returns the input it was reading from.
    ///
    /// The input is positioned right after the end-of-archive marker, so any
    /// trailing data can still be read from it.  If the producer failed, its
    /// error is returned instead.  Either read the output to EOF or cancel the
    /// filter before calling this, otherwise it blocks forever.
    pub fn finish(mut self) -> io::Result<(R, FilterStats)> {
        let Some(producer) = self.producer.take() else {
            return Err(io::Error::other("filter already finished"));
        };
        match producer.join() {
            Ok((input, Ok(stats))) => Ok((input, stats)),
            Ok((_, Err(err))) => Err(err.to_io_error()),
            Err(_) => Err(io::Error::other("tar filter thread panicked")),
        }
    }
}

impl<R> Read for FilteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf)
    }
}

impl<R> Drop for FilteredReader<R> {
    fn drop(&mut self) {
        if self.producer.is_some() {
            // nobody is going to read the rest: stop the producer at its next read or write
            let err = SharedError::new(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "filtered tar stream dropped",
            ));
            self.source.cancel(err.clone());
            self.output.close_with_error(err);
        }
    }
}

/// Starts filtering the tar archive in `input`.
///
/// `decide` is called for every entry, in order.  Returning `true` copies the
/// entry, with whatever changes `decide` made to it, to the output.  Returning
/// `false` drops the entry: its content is read from the input and discarded.
///
/// Filtering stops at the end-of-archive marker.  Anything after it is left
/// unread in `input`, which [`FilteredReader::finish`] hands back.
pub fn filter<R, F>(input: R, decide: F) -> io::Result<(FilteredReader<R>, FilterCanceler)>
where
    R: Read + Send + 'static,
    F: FnMut(&mut EntryHeader) -> bool + Send + 'static,
{
    let input = CancelableReader::new(input);
    let source = input.handle();
    let (output, writer) = pipe();

    let canceler = FilterCanceler {
        source: source.clone(),
        output: output.closer(),
    };

    let producer = thread::Builder::new()
        .name("tar-filter".into())
        .spawn(move || {
            let mut archive = Archive::new(input);
            let result = produce(&mut archive, &writer, decide);
            (archive.into_inner().into_inner(), result)
        })?;

    Ok((
        FilteredReader {
            output,
            source,
            producer: Some(producer),
        },
        canceler,
    ))
}

fn produce<R: Read, F>(
    archive: &mut Archive<R>,
    writer: &PipeWriter,
    decide: F,
) -> Result<FilterStats, SharedError>
where
    F: FnMut(&mut EntryHeader) -> bool,
{
    let mut builder = Builder::new(writer);
    let result = copy_entries(archive, &mut builder, decide)
        .and_then(|stats| builder.finish().map(|()| stats));

    match result {
        Ok(stats) => {
            debug!(
                "filter: done, kept {} and skipped {} entries",
                stats.kept, stats.skipped
            );
            writer.close(Ok(()));
            Ok(stats)
        }
        Err(err) => {
            debug!("filter: failed: {err}");
            let err = SharedError::new(err);
            // must close before the builder is dropped: it would try to write a trailer
            writer.close_with_error(err.clone());
            Err(err)
        }
    }
}

fn copy_entries<R: Read, W: Write, F>(
    archive: &mut Archive<R>,
    builder: &mut Builder<W>,
    mut decide: F,
) -> io::Result<FilterStats>
where
    F: FnMut(&mut EntryHeader) -> bool,
{
    let mut stats = FilterStats::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let mut header = EntryHeader::from_entry(&mut entry)?;

        if decide(&mut header) {
            trace!("filter: keeping {:?}", header.path_lossy());
            header.append_to(builder, &mut entry)?;
            stats.kept += 1;
        } else {
            trace!("filter: skipping {:?}", header.path_lossy());
            let mut content = ExactReader::new(&mut entry, header.size());
            io::copy(&mut content, &mut io::sink())?;
            stats.skipped += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{append_dir, append_file, append_symlink, create_tar_with, read_entries};

    fn filter_all(
        data: Vec<u8>,
        decide: impl FnMut(&mut EntryHeader) -> bool + Send + 'static,
    ) -> (Vec<u8>, FilterStats) {
        let (mut output, _canceler) = filter(io::Cursor::new(data), decide).unwrap();
        let mut filtered = vec![];
        output.read_to_end(&mut filtered).unwrap();
        let (_, stats) = output.finish().unwrap();
        (filtered, stats)
    }

    #[test]
    fn test_keep_everything() {
        let data = create_tar_with(|b| {
            append_dir(b, "a/");
            append_file(b, "a/one", b"first file");
            append_file(b, "a/two", &[0x55; 1500]);
            append_symlink(b, "a/link", "one");
        });

        let (filtered, stats) = filter_all(data.clone(), |_| true);
        assert_eq!(stats, FilterStats { kept: 4, skipped: 0 });
        assert_eq!(read_entries(&filtered), read_entries(&data));
    }

    #[test]
    fn test_skip_everything() {
        let data = create_tar_with(|b| {
            append_file(b, "one", b"first file");
            append_file(b, "two", &[0x55; 100_000]);
        });

        let (filtered, stats) = filter_all(data, |_| false);
        assert_eq!(stats, FilterStats { kept: 0, skipped: 2 });
        // a valid, empty archive
        assert_eq!(filtered, vec![0u8; 1024]);
        assert_eq!(read_entries(&filtered), vec![]);
    }

    #[test]
    fn test_rewrite_names() {
        let long = format!("keep/{}", "x".repeat(150));
        let data = create_tar_with(|b| {
            append_file(b, "keep/short", b"short");
            append_file(b, "drop/me", b"gone");
            append_file(b, &long, b"long");
            append_symlink(b, "keep/link", &format!("keep/{}", "y".repeat(120)));
        });

        let (filtered, stats) = filter_all(data, |header| {
            let Some(rest) = header.path.strip_prefix(b"keep/") else {
                return false;
            };
            header.path = rest.to_vec();
            if let Some(target) = &mut header.link_name {
                if let Some(rest) = target.strip_prefix(b"keep/") {
                    *target = rest.to_vec();
                }
            }
            true
        });

        assert_eq!(stats, FilterStats { kept: 3, skipped: 1 });
        let entries = read_entries(&filtered);
        let names = entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["short", &long[5..], "link"]);
        assert_eq!(entries[0].content, b"short");
        assert_eq!(entries[1].content, b"long");
        assert_eq!(entries[2].link_name.as_deref(), Some("y".repeat(120).as_str()));
    }

    #[test]
    fn test_pax_records_survive() {
        let data = create_tar_with(|b| {
            b.append_pax_extensions([("MSWINDOWS.fileattr", b"32".as_slice())])
                .unwrap();
            append_file(b, "file", b"data");
        });

        let (filtered, _) = filter_all(data, |header| {
            assert_eq!(
                header.pax,
                vec![("MSWINDOWS.fileattr".to_string(), b"32".to_vec())]
            );
            true
        });

        let mut archive = Archive::new(filtered.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let records = entry
            .pax_extensions()
            .unwrap()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.key().unwrap().to_string(), e.value_bytes().to_vec())
            })
            .collect::<Vec<_>>();
        assert_eq!(records, vec![("MSWINDOWS.fileattr".to_string(), b"32".to_vec())]);
        let mut content = vec![];
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"data");
    }

    #[test]
    fn test_trailing_data_is_left_in_input() {
        let mut data = create_tar_with(|b| append_file(b, "file", b"data"));
        data.extend_from_slice(b"trailing garbage");

        let (mut output, _canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        io::copy(&mut output, &mut io::sink()).unwrap();
        let (mut input, _) = output.finish().unwrap();

        let mut rest = vec![];
        input.read_to_end(&mut rest).unwrap();
        // the second zero block of the terminator is still there
        assert_eq!(rest.len(), 512 + b"trailing garbage".len());
        assert!(rest.ends_with(b"trailing garbage"));
    }

    #[test]
    fn test_corrupt_header_fails_output() {
        let mut data = create_tar_with(|b| append_file(b, "file", b"data"));
        // break the checksum of the first header
        data[148] ^= 0x01;

        let (mut output, _canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        let mut filtered = vec![];
        assert!(output.read_to_end(&mut filtered).is_err());
        assert!(output.finish().is_err());
    }

    #[test]
    fn test_truncated_content_fails_output() {
        let mut data = create_tar_with(|b| append_file(b, "file", &[1u8; 4000]));
        data.truncate(512 + 1000);

        for keep in [true, false] {
            let (mut output, _canceler) =
                filter(io::Cursor::new(data.clone()), move |_| keep).unwrap();
            let err = io::copy(&mut output, &mut io::sink()).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
            assert_eq!(
                output.finish().unwrap_err().kind(),
                io::ErrorKind::UnexpectedEof
            );
        }
    }

    #[test]
    fn test_cancel_while_producer_blocked() {
        let data = create_tar_with(|b| append_file(b, "big", &vec![0xaa; 1 << 20]));

        let (mut output, canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        let mut buf = [0u8; 512];
        output.read_exact(&mut buf).unwrap();

        // the producer is now stuck writing the next chunk
        thread::sleep(Duration::from_millis(20));
        canceler.cancel(io::Error::new(io::ErrorKind::TimedOut, "deadline"));

        let err = output.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "deadline");

        // the producer exits and reports the same error
        let err = output.finish().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_cancel_after_clean_end() {
        let data = create_tar_with(|b| append_file(b, "file", b"data"));
        let (mut output, canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        io::copy(&mut output, &mut io::sink()).unwrap();

        canceler.cancel(io::Error::new(io::ErrorKind::TimedOut, "cancel"));
        let err = output.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "cancel");
    }

    #[test]
    fn test_cancel_after_producer_error() {
        let mut data = create_tar_with(|b| append_file(b, "file", b"data"));
        data[148] ^= 0x01;

        let (mut output, canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        assert!(output.read(&mut [0u8; 16]).is_err());

        canceler.cancel(io::Error::new(io::ErrorKind::TimedOut, "cancel"));
        let err = output.read(&mut [0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(err.to_string(), "cancel");
    }

    #[test]
    fn test_drop_output_stops_producer() {
        let data = create_tar_with(|b| append_file(b, "big", &vec![0xaa; 1 << 20]));
        let (output, canceler) = filter(io::Cursor::new(data), |_| true).unwrap();
        drop(output);
        // canceling afterwards is harmless
        canceler.cancel(io::Error::other("late"));
    }

    #[test]
    fn test_finish_is_once() {
        let data = create_tar_with(|_| {});
        let (mut output, _) = filter(io::Cursor::new(data), |_| true).unwrap();
        io::copy(&mut output, &mut io::sink()).unwrap();
        let (_, result) = output.producer.take().unwrap().join().unwrap();
        assert!(result.is_ok());
        assert!(output.finish().is_err());
    }
}
