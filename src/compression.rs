//! Layer compression: media types and decompression.

use std::io::{self, Cursor, Read};

use flate2::read::MultiGzDecoder;
use oci_spec::image::MediaType;

use crate::error::{Error, Result};

pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
/// Some builders label zstd layers in Docker manifests like this.
pub const DOCKER_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";

const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
const OCI_NONDISTRIBUTABLE_LAYER: &str = "application/vnd.oci.image.layer.nondistributable.v1.tar";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

/// Rewrites media types that are known aliases of an OCI layer type.
///
/// The Docker zstd layer type is not understood by most tooling, but the
/// content is the same as an OCI zstd layer.
pub fn normalize_media_type(media_type: &MediaType) -> MediaType {
    match media_type {
        MediaType::Other(other) if other == DOCKER_LAYER_ZSTD => MediaType::ImageLayerZstd,
        other => other.clone(),
    }
}

impl Compression {
    /// The compression of a layer with the given media type.
    ///
    /// Fails with [`Error::UnsupportedMediaType`] for anything that isn't a
    /// tar layer.
    pub fn from_media_type(media_type: &MediaType) -> Result<Self> {
        match media_type {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => Ok(Self::None),
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => Ok(Self::Gzip),
            MediaType::ImageLayerZstd | MediaType::ImageLayerNonDistributableZstd => Ok(Self::Zstd),
            MediaType::Other(other) => match other.as_str() {
                DOCKER_LAYER | DOCKER_FOREIGN_LAYER => Ok(Self::None),
                DOCKER_LAYER_GZIP | DOCKER_FOREIGN_LAYER_GZIP => Ok(Self::Gzip),
                DOCKER_LAYER_ZSTD => Ok(Self::Zstd),
                other => Self::from_oci_suffix(other)
                    .ok_or_else(|| Error::UnsupportedMediaType(other.to_string())),
            },
            other => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }

    fn from_oci_suffix(media_type: &str) -> Option<Self> {
        let (base, ext) = match media_type.split_once('+') {
            Some((base, ext)) => (base, Some(ext)),
            None => (media_type, None),
        };
        if base != OCI_LAYER && base != OCI_NONDISTRIBUTABLE_LAYER {
            return None;
        }
        match ext {
            None => Some(Self::None),
            Some("gzip") => Some(Self::Gzip),
            Some("zstd") => Some(Self::Zstd),
            Some(_) => None,
        }
    }

    /// Guess the compression from the first bytes of a stream.
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else if magic.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else {
            Self::None
        }
    }

    /// Wraps `reader` in the decompressor for this compression.
    ///
    /// Dropping the returned reader releases the decompressor.
    pub fn decompress<'a>(
        self,
        reader: impl Read + Send + 'a,
    ) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Self::None => Box::new(reader),
            Self::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

/// Decompresses `reader` according to its magic bytes.
///
/// Streams that start with neither the gzip nor the zstd magic are passed
/// through unchanged.
pub fn decompress_stream<'a>(
    mut reader: impl Read + Send + 'a,
) -> io::Result<(Compression, Box<dyn Read + Send + 'a>)> {
    let mut magic = [0u8; ZSTD_MAGIC.len()];
    let mut filled = 0;
    while filled < magic.len() {
        match reader.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let compression = Compression::detect(&magic[..filled]);
    let reader = Cursor::new(magic).take(filled as u64).chain(reader);
    Ok((compression, compression.decompress(reader)?))
}
