//! Applying layers to mounted snapshots.
//!
//! [`FsApplier`] applies a layer blob as is.  [`WindowsLayerApplier`] wraps
//! another applier and, when asked to, applies Windows container layers on a
//! non-Windows host: only the entries below the `Files/` directory of the
//! layer are extracted, moved to the root of the snapshot.

use std::io::{self, Read};

use log::debug;
use oci_spec::image::{Descriptor, DescriptorBuilder, MediaType};

use crate::{
    compression::{decompress_stream, normalize_media_type, Compression},
    config::{Config, HostPlatform},
    content::ContentProvider,
    counter::CountingReader,
    digester::DigestingReader,
    error::{Error, Result},
    extract::apply_tar,
    filter::filter,
    mount::{with_temp_mount, Mount},
    rewrite::strip_prefix,
};

/// Per-call options of [`Applier::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// The layer is a Windows container layer.
    pub windows_layer_mode: bool,
}

pub trait Applier {
    /// Applies the layer `desc` to the filesystem described by `mounts`.
    ///
    /// Returns the descriptor of the uncompressed layer that was applied.
    fn apply(&self, desc: &Descriptor, mounts: &[Mount], opts: &ApplyOptions)
        -> Result<Descriptor>;
}

impl<A: Applier + ?Sized> Applier for Box<A> {
    fn apply(
        &self,
        desc: &Descriptor,
        mounts: &[Mount],
        opts: &ApplyOptions,
    ) -> Result<Descriptor> {
        (**self).apply(desc, mounts, opts)
    }
}

/// The decompressed layer, digested and counted as it is read.
type LayerStream = CountingReader<DigestingReader<Box<dyn Read + Send>>>;

fn open_layer(
    cs: &impl ContentProvider,
    desc: &Descriptor,
    compression: Compression,
) -> Result<LayerStream> {
    let blob = cs.reader(desc).map_err(Error::ContentStore)?;
    let raw = match compression {
        Compression::None => blob,
        // the media type only says that it's compressed: the stream knows how
        _ => decompress_stream(blob)?.1,
    };
    Ok(CountingReader::new(DigestingReader::new(raw)))
}

/// Descriptor of everything `stream` has produced.
fn layer_descriptor(stream: &LayerStream) -> Result<Descriptor> {
    Ok(DescriptorBuilder::default()
        .media_type(MediaType::ImageLayer)
        .digest(stream.get_ref().digest()?)
        .size(stream.count())
        .build()?)
}

fn normalized(desc: &Descriptor) -> Descriptor {
    let mut desc = desc.clone();
    desc.set_media_type(normalize_media_type(desc.media_type()));
    desc
}

/// Applies layers by extracting them directly.
#[derive(Debug, Clone)]
pub struct FsApplier<P> {
    cs: P,
}

impl<P: ContentProvider> FsApplier<P> {
    pub fn new(cs: P) -> Self {
        Self { cs }
    }
}

impl<P: ContentProvider> Applier for FsApplier<P> {
    fn apply(
        &self,
        desc: &Descriptor,
        mounts: &[Mount],
        _opts: &ApplyOptions,
    ) -> Result<Descriptor> {
        let desc = normalized(desc);
        let compression = Compression::from_media_type(desc.media_type())?;
        debug!("applying layer {} ({compression:?})", desc.digest());

        with_temp_mount(mounts, |root| {
            let mut stream = open_layer(&self.cs, &desc, compression)?;
            apply_tar(root, &mut stream)?;
            io::copy(&mut stream, &mut io::sink())?;
            layer_descriptor(&stream)
        })
    }
}

/// Applies Windows container layers, delegating everything else.
#[derive(Debug, Clone)]
pub struct WindowsLayerApplier<P, A> {
    cs: P,
    inner: A,
    path_prefix: String,
}

impl<P: ContentProvider, A: Applier> WindowsLayerApplier<P, A> {
    pub fn new(cs: P, inner: A, config: &Config) -> Self {
        Self {
            cs,
            inner,
            path_prefix: config.path_prefix.clone(),
        }
    }

    fn apply_windows_layer(
        &self,
        root: &std::path::Path,
        desc: &Descriptor,
        compression: Compression,
    ) -> Result<Descriptor> {
        let stream = open_layer(&self.cs, desc, compression)?;
        let (mut output, canceler) = filter(stream, strip_prefix(self.path_prefix.clone()))?;

        let extracted = apply_tar(root, &mut output).and_then(|count| {
            io::copy(&mut output, &mut io::sink())?;
            Ok(count)
        });
        if let Err(err) = extracted {
            debug!("applying {} failed, canceling filter: {err}", desc.digest());
            canceler.cancel(io::Error::other(err.to_string()));
            // the producer's own result is the error we just gave it
            let _ = output.finish();
            return Err(err);
        }

        let (mut stream, stats) = output.finish()?;
        // the rest of the blob still counts towards size and digest
        let trailing = io::copy(&mut stream, &mut io::sink())?;
        debug!(
            "applied {} entries of {}, dropped {}, {trailing} trailing bytes",
            stats.kept,
            desc.digest(),
            stats.skipped
        );
        layer_descriptor(&stream)
    }
}

impl<P: ContentProvider, A: Applier> Applier for WindowsLayerApplier<P, A> {
    fn apply(
        &self,
        desc: &Descriptor,
        mounts: &[Mount],
        opts: &ApplyOptions,
    ) -> Result<Descriptor> {
        let desc = normalized(desc);
        if !opts.windows_layer_mode {
            return self.inner.apply(&desc, mounts, opts);
        }

        let compression = Compression::from_media_type(desc.media_type())?;
        debug!("applying windows layer {} ({compression:?})", desc.digest());
        with_temp_mount(mounts, |root| {
            self.apply_windows_layer(root, &desc, compression)
        })
    }
}

/// An applier for `inner`'s layers that can also apply Windows layers.
///
/// Windows hosts apply Windows layers natively, so there `inner` is returned
/// as it is.
pub fn new_filesystem_applier<P, A>(cs: P, inner: A, config: &Config) -> Box<dyn Applier>
where
    P: ContentProvider + 'static,
    A: Applier + 'static,
{
    match config.host {
        HostPlatform::Windows => Box::new(inner),
        HostPlatform::Linux => Box::new(WindowsLayerApplier::new(cs, inner, config)),
    }
}
