use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tar::{Archive, EntryType, Header};
use thiserror::Error;

/// Marker prefix a layer uses to record the deletion of a path from a lower
/// layer: an entry named `.wh.foo` deletes the sibling `foo`.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// What remains of the opaque-directory marker (`.wh..wh..opq`) after the
/// whiteout prefix is stripped.
const OPAQUE_MARKER: &str = ".wh..opq";

#[derive(Error, Debug, PartialEq)]
pub enum EntryError {
    #[error("Entry name {0:?} escapes the output directory")]
    Escape(String),
    #[error("Entry name {0:?} is not valid UTF-8")]
    NotUtf8(String),
    #[error("Unsupported tar entry type {kind:?} for {path:?}")]
    Unsupported { kind: EntryType, path: PathBuf },
}

/// Maps an archive entry name to a clean path relative to the output
/// directory.
///
/// Older images built on Windows wrote back-slash separated names, so the
/// name is split on back-slashes if it contains any, and on forward slashes
/// otherwise.  Empty and `.` components are dropped and `..` components
/// resolve against the components seen so far.  A name whose `..` components
/// would climb above the output directory is rejected, not clamped: such a
/// name only appears in a malformed or malicious image.
///
/// The archive's own top-level marker (`.`, `./`) normalizes to the empty
/// path.
pub fn clean_entry_path(name: &[u8]) -> Result<PathBuf, EntryError> {
    let name = std::str::from_utf8(name)
        .map_err(|_| EntryError::NotUtf8(String::from_utf8_lossy(name).into_owned()))?;

    let components: Vec<&str> = if name.contains('\\') {
        name.split('\\').collect()
    } else {
        name.split('/').collect()
    };

    let mut clean = PathBuf::new();
    for component in components {
        match component {
            "" | "." => continue,
            ".." => {
                if !clean.pop() {
                    return Err(EntryError::Escape(name.to_string()));
                }
            }
            normal => clean.push(normal),
        }
    }
    Ok(clean)
}

/// A deletion directive parsed from an entry name.
#[derive(Debug, PartialEq)]
pub enum Whiteout {
    /// Delete the path (a sibling of the marker entry) from lower layers.
    Single(PathBuf),
    /// Discard the whole lower-layer content of the directory containing the
    /// marker.
    Opaque(PathBuf),
}

/// Interprets the final component of a cleaned entry path as a whiteout
/// marker, if it carries the reserved prefix.
pub fn parse_whiteout(rel: &Path) -> Option<Whiteout> {
    let name = rel.file_name()?.to_str()?;
    let target = name.strip_prefix(WHITEOUT_PREFIX)?;
    let parent = rel.parent().unwrap_or(Path::new(""));

    if target == OPAQUE_MARKER {
        Some(Whiteout::Opaque(parent.to_path_buf()))
    } else {
        Some(Whiteout::Single(parent.join(target)))
    }
}

/// What a tar entry becomes on disk.
///
/// Links can point at sensitive host paths and device nodes are a privilege
/// escalation vector, so neither is ever materialized from an untrusted
/// image.  Anything outside the known set fails the run rather than being
/// silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDisposition {
    Directory,
    Regular,
    Skip,
    Unsupported,
}

pub fn classify(kind: EntryType) -> EntryDisposition {
    match kind {
        EntryType::Directory => EntryDisposition::Directory,
        EntryType::Regular | EntryType::Continuous => EntryDisposition::Regular,
        EntryType::Link | EntryType::Symlink => EntryDisposition::Skip,
        EntryType::Char | EntryType::Block | EntryType::Fifo => EntryDisposition::Skip,
        _ => EntryDisposition::Unsupported,
    }
}

/// Metadata carried from a tar header onto the materialized path.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub st_mode: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_mtim_sec: i64,
    pub st_atim_sec: i64,
}

pub fn stat_from_tar_header(header: &Header) -> Result<Stat> {
    let mtime = header.mtime()? as i64;
    // Only GNU headers carry an access time; everybody else gets the mtime
    // back twice.  An access time older than the mtime is clamped up to it.
    let atime = header
        .as_gnu()
        .and_then(|gnu| gnu.atime().ok())
        .map(|atime| atime as i64)
        .unwrap_or(mtime);

    Ok(Stat {
        st_mode: header.mode()?,
        st_uid: header.uid()? as u32,
        st_gid: header.gid()? as u32,
        st_mtim_sec: mtime,
        st_atim_sec: atime.max(mtime),
    })
}

/// Writes one line per entry in the stream: a type letter, the stored mode,
/// the entry size and the archive-relative name.
pub fn list_entries(stream: impl Read, out: &mut impl Write) -> Result<()> {
    let mut archive = Archive::new(stream);
    for entry in archive.entries()? {
        let entry = entry?;
        let header = entry.header();
        writeln!(
            out,
            "{} {:04o} {:>9} {}",
            type_letter(header.entry_type()),
            header.mode()? & 0o7777,
            header.size()?,
            String::from_utf8_lossy(&entry.path_bytes()),
        )?;
    }
    Ok(())
}

fn type_letter(kind: EntryType) -> char {
    match kind {
        EntryType::Directory => 'd',
        EntryType::Symlink => 'l',
        EntryType::Link => 'h',
        EntryType::Char => 'c',
        EntryType::Block => 'b',
        EntryType::Fifo => 'p',
        _ => '-',
    }
}
