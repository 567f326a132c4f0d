//! Access to layer blobs.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use log::debug;
use oci_spec::image::Descriptor;

/// Something that can hand out readers for content-addressed blobs.
///
/// Dropping the returned reader releases whatever handle backs it.
pub trait ContentProvider {
    fn reader(&self, desc: &Descriptor) -> io::Result<Box<dyn Read + Send>>;
}

/// The blob store of an OCI image layout directory: `<root>/blobs/<algorithm>/<encoded>`.
#[derive(Debug, Clone)]
pub struct OciLayoutStore {
    root: PathBuf,
}

impl OciLayoutStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the blob for `desc` lives.
    pub fn blob_path(&self, desc: &Descriptor) -> PathBuf {
        let digest = desc.digest();
        self.root
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.digest())
    }
}

impl ContentProvider for OciLayoutStore {
    fn reader(&self, desc: &Descriptor) -> io::Result<Box<dyn Read + Send>> {
        let path = self.blob_path(desc);
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size != desc.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "blob {} has size {size}, expected {}",
                    desc.digest(),
                    desc.size()
                ),
            ));
        }
        debug!("opened blob {path:?} ({size} bytes)");
        Ok(Box::new(file.take(desc.size())))
    }
}

#[cfg(test)]
mod test {
    use std::{fs, str::FromStr};

    use oci_spec::image::{DescriptorBuilder, Digest, MediaType};
    use sha2::{Digest as _, Sha256};
    use similar_asserts::assert_eq;

    use super::*;

    fn store_blob(root: &Path, data: &[u8]) -> Descriptor {
        let hex = hex::encode(Sha256::digest(data));
        let dir = root.join("blobs/sha256");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&hex), data).unwrap();
        DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .digest(Digest::from_str(&format!("sha256:{hex}")).unwrap())
            .size(data.len() as u64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_read_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = store_blob(tmp.path(), b"blob contents");
        let store = OciLayoutStore::new(tmp.path());
        assert!(store.blob_path(&desc).starts_with(tmp.path().join("blobs/sha256")));

        let mut data = vec![];
        store.reader(&desc).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"blob contents");
    }

    #[test]
    fn test_missing_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = store_blob(tmp.path(), b"blob contents");
        fs::remove_file(OciLayoutStore::new(tmp.path()).blob_path(&desc)).unwrap();
        let err = OciLayoutStore::new(tmp.path()).reader(&desc).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_size_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let desc = store_blob(tmp.path(), b"blob contents");
        let store = OciLayoutStore::new(tmp.path());
        fs::write(store.blob_path(&desc), b"blob contents, but longer").unwrap();
        let err = store.reader(&desc).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
