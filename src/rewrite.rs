//! The header rewrite rule for Windows layers.

use crate::filter::EntryHeader;

/// Where a Windows container layer keeps the container filesystem.
pub const WINDOWS_FILES_PREFIX: &str = "Files/";

/// Returns a decision function for [`crate::filter::filter`] that accepts only
/// entries below `prefix` and moves them to the root of the archive.
///
/// The prefix is removed from the entry path and, if the entry has one, from
/// the link target.  The entry for the prefix directory itself is dropped: it
/// would name the root of the extraction target.  Its metadata (mode, owner,
/// mtime) is therefore never applied to that root, which keeps whatever it
/// had before.
pub fn strip_prefix(
    prefix: impl Into<String>,
) -> impl FnMut(&mut EntryHeader) -> bool + Send + 'static {
    let prefix = prefix.into();
    move |header| {
        let Some(rest) = header.path.strip_prefix(prefix.as_bytes()) else {
            return false;
        };
        if rest.is_empty() {
            return false;
        }
        header.path = rest.to_vec();

        if let Some(target) = &mut header.link_name {
            if let Some(rest) = target.strip_prefix(prefix.as_bytes()) {
                *target = rest.to_vec();
            }
        }

        true
    }
}
