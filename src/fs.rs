use std::fs::{self, DirBuilder, File, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{chown, DirBuilderExt, PermissionsExt};
use std::path::Path;

use anyhow::{Context, Result};
use filetime::FileTime;

use crate::oci::tar::Stat;

/// Mode an entry gets on disk.
///
/// Group and other mirror the owner bits, so that a tree extracted by one
/// user stays usable when served to another.  If the image explicitly granted
/// any group or other permission the stored mode is honored as-is, special
/// bits included; the owner-replication case keeps only the permission
/// triple.
pub fn effective_mode(st_mode: u32) -> u32 {
    if st_mode & 0o077 != 0 {
        st_mode & 0o7777
    } else {
        let owner = st_mode & 0o700;
        owner | owner >> 3 | owner >> 6
    }
}

/// Removes whatever sits at `path`, file or tree.  An absent path is fine.
pub(crate) fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Wipes and recreates the output directory.  0o777 minus the umask, same as
/// a fresh mkdir.
pub fn reset_dir(path: &Path) -> Result<()> {
    remove_existing(path).context("Removing output directory")?;
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    builder.mode(0o777);
    builder.create(path).context("Creating output directory")?;
    Ok(())
}

pub(crate) fn write_directory(path: &Path, stat: &Stat, restore_owner: bool) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, Permissions::from_mode(effective_mode(stat.st_mode)))?;
    restore_attrs(path, stat, restore_owner)
}

pub(crate) fn write_file(
    path: &Path,
    data: &mut impl Read,
    stat: &Stat,
    restore_owner: bool,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    io::copy(data, &mut file)?;
    file.set_permissions(Permissions::from_mode(effective_mode(stat.st_mode)))?;
    drop(file);

    restore_attrs(path, stat, restore_owner)
}

/// Ownership, then timestamps.  Timestamps go last; any later touch to the
/// path would clobber them.
fn restore_attrs(path: &Path, stat: &Stat, restore_owner: bool) -> Result<()> {
    if restore_owner {
        chown(path, Some(stat.st_uid), Some(stat.st_gid))
            .with_context(|| format!("Restoring ownership of {path:?}"))?;
    }

    filetime::set_file_times(
        path,
        FileTime::from_unix_time(stat.st_atim_sec, 0),
        FileTime::from_unix_time(stat.st_mtim_sec, 0),
    )
    .with_context(|| format!("Restoring timestamps of {path:?}"))?;

    Ok(())
}
