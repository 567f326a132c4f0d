//! Applying a layer tar stream to a directory.

use std::{
    collections::HashSet,
    ffi::OsStr,
    fs, io,
    io::Read,
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use log::{debug, trace};
use tar::Archive;

use crate::error::{Error, Result};

/// Marks its directory as opaque: lower content in it is hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
/// `.wh.<name>` deletes `<name>` from the lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

enum Whiteout<'a> {
    Opaque,
    Remove(&'a OsStr),
    /// `.wh.`, `.wh..` and the like: they would name the directory itself.
    Invalid,
}

fn whiteout(name: &OsStr) -> Option<Whiteout<'_>> {
    let name = name.as_bytes();
    if name == OPAQUE_WHITEOUT.as_bytes() {
        return Some(Whiteout::Opaque);
    }
    let rest = name.strip_prefix(WHITEOUT_PREFIX.as_bytes())?;
    if matches!(rest, b"" | b"." | b"..") || rest.contains(&b'/') {
        return Some(Whiteout::Invalid);
    }
    Some(Whiteout::Remove(OsStr::from_bytes(rest)))
}

fn escapes(path: &Path) -> Error {
    Error::Extract {
        path: path.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::InvalidData,
            "path escapes the target directory",
        ),
    }
}

/// `path` below `root`, the way tar entries are resolved.
fn resolve(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => continue,
            Component::ParentDir => return Err(escapes(path)),
            Component::Normal(part) => resolved.push(part),
        }
    }
    Ok(resolved)
}

fn remove_all(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Empties `dir` of everything this stream didn't put there.
fn clear_opaque(dir: &Path, applied: &HashSet<PathBuf>) -> io::Result<()> {
    let children = match fs::read_dir(dir) {
        Ok(children) => children,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for child in children {
        let child = child?;
        let path = child.path();
        if !applied.contains(&path) {
            trace!("opaque: removing {path:?}");
            remove_all(&path)?;
        } else if child.file_type()?.is_dir() {
            clear_opaque(&path, applied)?;
        }
    }
    Ok(())
}

/// Unpacks the tar stream in `reader` on top of `root`.
///
/// Returns the number of entries applied, whiteouts included.  Reading stops
/// at the end-of-archive marker; `reader` isn't read any further.
///
/// Entries that would land outside `root` fail the whole apply.  Whiteout
/// entries remove content instead of being created.
pub fn apply_tar(root: &Path, reader: impl Read) -> Result<u64> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut applied = HashSet::new();
    let mut count = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        trace!("extract: {path:?}");

        let parent = path.parent().unwrap_or(Path::new(""));
        match path.file_name().and_then(whiteout) {
            Some(Whiteout::Opaque) => {
                let dir = resolve(root, parent)?;
                clear_opaque(&dir, &applied).map_err(|source| Error::Extract {
                    path: path.clone(),
                    source,
                })?;
            }
            Some(Whiteout::Remove(name)) => {
                let target = resolve(root, &parent.join(name))?;
                remove_all(&target).map_err(|source| Error::Extract {
                    path: path.clone(),
                    source,
                })?;
            }
            Some(Whiteout::Invalid) => {
                return Err(Error::Extract {
                    path,
                    source: io::Error::new(io::ErrorKind::InvalidData, "invalid whiteout name"),
                });
            }
            None => match entry.unpack_in(root) {
                Ok(true) => {
                    applied.insert(resolve(root, &path)?);
                }
                Ok(false) => return Err(escapes(&path)),
                Err(source) => return Err(Error::Extract { path, source }),
            },
        }
        count += 1;
    }

    debug!("extract: applied {count} entries to {root:?}");
    Ok(count)
}
