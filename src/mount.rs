//! Temporary mounts of an apply target.

use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use rustix::{
    fs::CWD,
    mount::{
        fsconfig_create, fsconfig_set_flag, fsconfig_set_string, fsmount, fsopen, move_mount,
        mount_bind, mount_bind_recursive, unmount, FsMountFlags, FsOpenFlags, MountAttrFlags,
        MoveMountFlags, UnmountFlags,
    },
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::error::{Error, Result};

/// A filesystem mount, as handed out by a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type, or `bind`.
    #[serde(rename = "type")]
    pub kind: String,
    pub source: PathBuf,
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// A writable recursive bind mount of `source`.
    pub fn bind(source: impl Into<PathBuf>) -> Self {
        Self {
            kind: "bind".into(),
            source: source.into(),
            options: vec!["rbind".into(), "rw".into()],
        }
    }

    fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    fn is_bind(&self) -> bool {
        self.kind == "bind" || self.has_option("bind") || self.has_option("rbind")
    }

    fn is_readonly(&self) -> bool {
        self.has_option("ro")
    }

    fn mount_on(&self, target: &Path) -> io::Result<()> {
        if self.is_bind() {
            if self.has_option("rbind") {
                mount_bind_recursive(&self.source, target)?;
            } else {
                mount_bind(&self.source, target)?;
            }
            return Ok(());
        }

        let fs = FsHandle::open(&self.kind)?;
        fsconfig_set_string(fs.as_fd(), "source", &self.source)?;
        for option in &self.options {
            match option.split_once('=') {
                Some((key, value)) => fsconfig_set_string(fs.as_fd(), key, value)?,
                None => fsconfig_set_flag(fs.as_fd(), option.as_str())?,
            }
        }
        fsconfig_create(fs.as_fd())?;

        let mnt = fsmount(
            fs.as_fd(),
            FsMountFlags::FSMOUNT_CLOEXEC,
            MountAttrFlags::empty(),
        )?;
        move_mount(
            mnt.as_fd(),
            "",
            CWD,
            target,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )?;
        Ok(())
    }
}

struct FsHandle {
    pub fd: OwnedFd,
}

impl FsHandle {
    pub fn open(name: &str) -> io::Result<FsHandle> {
        Ok(FsHandle {
            fd: fsopen(name, FsOpenFlags::FSOPEN_CLOEXEC)?,
        })
    }
}

impl AsFd for FsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for FsHandle {
    fn drop(&mut self) {
        // the kernel queues messages explaining fsconfig() failures on the fd
        let mut buffer = [0u8; 1024];
        loop {
            match rustix::io::read(&self.fd, &mut buffer) {
                Err(_) | Ok(0) => return,
                Ok(size) => debug!("{}", String::from_utf8_lossy(&buffer[0..size])),
            }
        }
    }
}

/// A temporary directory with a stack of mounts on it.
struct TmpMount {
    dir: TempDir,
    mounted: usize,
}

impl TmpMount {
    fn mount(mounts: &[Mount]) -> Result<TmpMount> {
        let dir = tempfile::Builder::new()
            .prefix("winlayers-mount-")
            .tempdir()?;
        let mut tmp = TmpMount { dir, mounted: 0 };
        for mount in mounts {
            debug!("mounting {} {:?} on {:?}", mount.kind, mount.source, tmp.path());
            mount.mount_on(tmp.path()).map_err(|source| Error::Mount {
                target: tmp.path().to_path_buf(),
                source,
            })?;
            tmp.mounted += 1;
        }
        Ok(tmp)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for TmpMount {
    fn drop(&mut self) {
        for _ in 0..self.mounted {
            if let Err(err) = unmount(self.dir.path(), UnmountFlags::DETACH) {
                warn!("umount(MNT_DETACH) of {:?} failed: {err}", self.dir.path());
                return;
            }
        }
    }
}

/// Mounts `mounts` on a temporary directory and runs `f` on it.
///
/// The mounts are stacked in order and detached again once `f` returns,
/// whether it succeeded or not.  A single writable bind mount is used in
/// place, without mounting anything.
pub fn with_temp_mount<T>(mounts: &[Mount], f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
    if mounts.is_empty() {
        return Err(Error::Mount {
            target: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "no mounts to apply to"),
        });
    }
    if let Some(mount) = mounts.iter().find(|m| m.is_readonly()) {
        return Err(Error::Mount {
            target: mount.source.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "read-only mount"),
        });
    }

    if let [mount] = mounts {
        if mount.is_bind() {
            debug!("applying directly to {:?}", mount.source);
            return f(&mount.source);
        }
    }

    let tmp = TmpMount::mount(mounts)?;
    f(tmp.path())
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_single_bind_is_used_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let seen = with_temp_mount(&[Mount::bind(tmp.path())], |root| Ok(root.to_path_buf()));
        assert_eq!(seen.unwrap(), tmp.path());
    }

    #[test]
    fn test_no_mounts() {
        let err = with_temp_mount(&[], |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Mount { .. }));
    }

    #[test]
    fn test_readonly_rejected() {
        let mut mount = Mount::bind("/nonexistent");
        mount.options = vec!["bind".into(), "ro".into()];
        let err = with_temp_mount(&[mount], |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Mount { .. }));
    }

    #[test]
    fn test_closure_error_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let err = with_temp_mount(&[Mount::bind(tmp.path())], |_| -> Result<()> {
            Err(Error::Config("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_mount_json() {
        let mount: Mount = serde_json::from_str(
            r#"{"type": "overlay", "source": "overlay", "options": ["lowerdir=/a", "upperdir=/b", "workdir=/c"]}"#,
        )
        .unwrap();
        assert_eq!(mount.kind, "overlay");
        assert!(!mount.is_bind());
        assert!(!mount.is_readonly());
        assert_eq!(mount.options.len(), 3);
    }
}
