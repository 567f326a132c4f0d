//! Content digest of a byte stream, computed as it is read.

use std::{
    io::{self, Read},
    str::FromStr,
};

use oci_spec::image::Digest as OciDigest;
use sha2::{digest::Output, Digest, Sha256};

/// Tees every byte read through it into a hasher.
///
/// The bytes handed to the caller are not altered.  Only bytes that were
/// actually returned by the inner reader are hashed, exactly once and in
/// order.
#[derive(Debug)]
pub struct DigestingReader<R, D = Sha256> {
    inner: R,
    hasher: D,
}

impl<R, D: Digest> DigestingReader<R, D> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: D::new(),
        }
    }

    /// The hash of everything read so far, leaving the reader usable.
    pub fn finalize_current(&self) -> Output<D>
    where
        D: Clone,
    {
        self.hasher.clone().finalize()
    }

    pub fn into_parts(self) -> (R, D) {
        (self.inner, self.hasher)
    }
}

impl<R> DigestingReader<R, Sha256> {
    /// The OCI digest (`sha256:<hex>`) of everything read so far.
    pub fn digest(&self) -> Result<OciDigest, oci_spec::OciSpecError> {
        sha256_digest(&self.finalize_current())
    }
}

/// Formats a raw sha256 value as an OCI digest.
pub fn sha256_digest(value: &[u8]) -> Result<OciDigest, oci_spec::OciSpecError> {
    OciDigest::from_str(&format!("sha256:{}", hex::encode(value)))
}

impl<R: Read, D: Digest> Read for DigestingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::counter::CountingReader;

    // sha256("hello world\n")
    const HELLO: &str = "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a447";

    #[test]
    fn test_digest_matches_sha256() {
        let mut reader = DigestingReader::<_>::new(b"hello world\n" as &[u8]);
        let mut out = vec![];
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world\n");
        assert_eq!(reader.digest().unwrap().to_string(), format!("sha256:{HELLO}"));
    }

    #[test]
    fn test_partial_reads_hash_once() {
        let data = (0..=255u8).cycle().take(70_000).collect::<Vec<_>>();
        let mut reader = DigestingReader::<_>::new(data.as_slice());
        let mut buf = [0u8; 1000];
        while reader.read(&mut buf[..777]).unwrap() != 0 {}
        assert_eq!(
            hex::encode(reader.finalize_current()),
            hex::encode(Sha256::digest(&data))
        );
    }

    #[test]
    fn test_layered_with_counter() {
        let mut reader = CountingReader::new(DigestingReader::<_>::new(b"hello world\n" as &[u8]));
        io::copy(&mut reader, &mut io::sink()).unwrap();
        assert_eq!(reader.count(), 12);
        assert_eq!(hex::encode(reader.get_ref().finalize_current()), HELLO);
    }
}
