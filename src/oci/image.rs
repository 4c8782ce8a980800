use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use rustix::process::getuid;
use tar::Archive;

use crate::fs::{remove_existing, reset_dir, write_directory, write_file};
use crate::oci::tar::{
    classify, clean_entry_path, parse_whiteout, stat_from_tar_header, EntryDisposition,
    EntryError, Whiteout,
};
use crate::oci::Layer;

/// Per-layer status sink.  Purely informational; implementations must not
/// influence the outcome of a run.
pub trait Progress {
    fn status(&self, message: &str);
}

/// Discards all status messages.
pub struct Silent;

impl Progress for Silent {
    fn status(&self, _message: &str) {}
}

/// What a newer layer already decided about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathFate {
    /// Removed by a whiteout marker.
    Deleted,
    /// Materialized as a directory; older directory entries merge into it
    /// instead of replacing it.
    Directory,
    /// Claimed by a non-directory entry (a regular file, or one of the entry
    /// types that are deliberately not materialized).
    NonDirectory,
}

/// Accumulated fate of archive paths across the layer stack.
///
/// Layers are walked newest first, so by the time an older layer mentions a
/// path the map already knows whether a newer layer deleted or claimed it.
/// Both suppress the older entry: deletions because the path is gone, claims
/// because the newest version of a path wins.
#[derive(Debug, Default)]
pub struct PathMap {
    paths: HashMap<PathBuf, PathFate>,
}

impl PathMap {
    fn record_deleted(&mut self, rel: &Path) {
        self.paths.insert(rel.to_path_buf(), PathFate::Deleted);
    }

    fn record_claimed(&mut self, rel: &Path, directory: bool) {
        let fate = if directory {
            PathFate::Directory
        } else {
            PathFate::NonDirectory
        };
        self.paths.entry(rel.to_path_buf()).or_insert(fate);
    }

    /// True when a newer layer put something at this exact path.
    fn claimed(&self, rel: &Path) -> bool {
        matches!(
            self.paths.get(rel),
            Some(PathFate::Directory | PathFate::NonDirectory)
        )
    }

    /// True when the path itself was whited out, or when any ancestor was
    /// whited out or claimed by a non-directory.  Nothing beneath a deleted
    /// or replaced directory may reappear from an older layer.
    fn suppressed(&self, rel: &Path) -> bool {
        if self.paths.get(rel) == Some(&PathFate::Deleted) {
            return true;
        }
        let mut current = rel;
        while let Some(parent) = current.parent() {
            if parent.as_os_str().is_empty() {
                break;
            }
            match self.paths.get(parent) {
                Some(PathFate::Deleted | PathFate::NonDirectory) => return true,
                _ => {}
            }
            current = parent;
        }
        false
    }
}

/// Materializes a stack of image layers into a single directory.
#[derive(Debug)]
pub struct Unpacker {
    dest: PathBuf,
    restore_owner: bool,
}

impl Unpacker {
    /// Restoring arbitrary ownership needs privileges, so the default is
    /// decided once here: restore when running as root, skip otherwise.
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            restore_owner: getuid().is_root(),
        }
    }

    /// Overrides the ownership-restoration default.
    pub fn restore_owner(mut self, restore_owner: bool) -> Self {
        self.restore_owner = restore_owner;
        self
    }

    /// Flattens `layers` (base to top, as listed in the manifest) into the
    /// destination directory.  Anything already at the destination is
    /// removed first; on error the destination contents are undefined and
    /// must be discarded.
    pub fn unpack(&self, layers: &[Layer], progress: &dyn Progress) -> Result<()> {
        reset_dir(&self.dest)?;

        // A whiteout always lives in a newer layer than the entries it
        // suppresses.  Walking the stack newest first records every deletion
        // and overwrite before the affected entries are seen, so suppression
        // is a lookup in the map built so far instead of a second pass.
        let total = layers.len();
        let mut paths = PathMap::default();
        for (idx, layer) in layers.iter().enumerate().rev() {
            let digest = hex::encode(layer.sha256());
            progress.status(&format!(
                "Extracting layer sha256:{digest} ({}/{total})",
                total - idx
            ));
            let stream = layer
                .open_tar()
                .with_context(|| format!("Opening layer sha256:{digest}"))?;
            self.apply_layer(stream, &mut paths)
                .with_context(|| format!("Extracting layer sha256:{digest}"))?;
        }
        Ok(())
    }

    /// Consumes one layer's tar stream, materializing the entries that are
    /// not superseded by a newer layer.  `paths` carries the accumulated
    /// layer state and must be shared across all layers of one run.
    pub fn apply_layer(&self, stream: impl Read, paths: &mut PathMap) -> Result<()> {
        let mut archive = Archive::new(stream);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = clean_entry_path(&entry.path_bytes())?;

            if let Some(marker) = parse_whiteout(&rel) {
                self.apply_whiteout(marker, paths);
                continue;
            }

            // the archive's own top-level marker; the destination root
            // already exists
            if rel.as_os_str().is_empty() {
                continue;
            }

            if paths.suppressed(&rel) {
                debug!("skipping {rel:?}: deleted by a newer layer");
                continue;
            }
            if paths.claimed(&rel) {
                debug!("skipping {rel:?}: written by a newer layer");
                continue;
            }

            let kind = entry.header().entry_type();
            let disposition = classify(kind);
            let dest = self.dest.join(&rel);

            // Directories merge across layers.  A non-directory entry whose
            // path is already a directory on disk lost to a newer layer's
            // children (the directory exists only because they were written
            // into it); anything else in the way is replaced.
            if let Ok(meta) = std::fs::symlink_metadata(&dest) {
                if meta.is_dir() && disposition != EntryDisposition::Directory {
                    debug!("skipping {rel:?}: a newer layer put a directory there");
                    continue;
                }
                if !meta.is_dir() {
                    remove_existing(&dest)
                        .with_context(|| format!("Replacing {rel:?}"))?;
                }
            }

            match disposition {
                EntryDisposition::Directory => {
                    paths.record_claimed(&rel, true);
                    let stat = stat_from_tar_header(entry.header())?;
                    write_directory(&dest, &stat, self.restore_owner)
                        .with_context(|| format!("Creating directory {rel:?}"))?;
                }
                EntryDisposition::Regular => {
                    paths.record_claimed(&rel, false);
                    let stat = stat_from_tar_header(entry.header())?;
                    write_file(&dest, &mut entry, &stat, self.restore_owner)
                        .with_context(|| format!("Writing {rel:?}"))?;
                }
                EntryDisposition::Skip => {
                    // never materialized, but still the newest claim on the
                    // path: older layers must not resurrect it
                    paths.record_claimed(&rel, false);
                    debug!("not materializing {kind:?} entry {rel:?}");
                }
                EntryDisposition::Unsupported => {
                    return Err(EntryError::Unsupported { kind, path: rel }.into());
                }
            }
        }
        Ok(())
    }

    fn apply_whiteout(&self, marker: Whiteout, paths: &mut PathMap) {
        match marker {
            Whiteout::Single(target) => {
                // A whiteout only hides what lies below it; a path already
                // claimed by a newer layer stays.
                if paths.claimed(&target) {
                    debug!("ignoring whiteout for {target:?}: written by a newer layer");
                    return;
                }
                if let Err(err) = remove_existing(&self.dest.join(&target)) {
                    warn!("whiteout removal of {target:?} failed: {err}");
                }
                paths.record_deleted(&target);
            }
            Whiteout::Opaque(dir) => {
                // only per-entry whiteouts are supported
                debug!("ignoring opaque whiteout below {dir:?}");
            }
        }
    }
}
