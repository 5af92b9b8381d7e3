use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Same limit the kernel applies before failing with `ELOOP`.
const MAX_LINK_HOPS: usize = 40;

/// Follow `path` through symlinks, resolving absolute link targets below
/// `root` instead of the running host. `None` when the chain ends nowhere.
fn resolve_in_root(root: &Path, path: &Path) -> io::Result<Option<PathBuf>> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let meta = match fs::symlink_metadata(&current) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.file_type().is_symlink() {
            return Ok(Some(current));
        }
        let target = fs::read_link(&current)?;
        current = match target.strip_prefix("/") {
            Ok(inside) => root.join(inside),
            Err(_) => current.parent().unwrap_or(root).join(target),
        };
    }
    Err(io::Error::other(format!(
        "too many levels of symbolic links at {}",
        path.display()
    )))
}

/// Drop a symlink sitting at `dst` so a copy replaces it instead of writing
/// through it.
fn clear_link(dst: &Path) -> io::Result<()> {
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(dst),
        _ => Ok(()),
    }
}

/// Whether `path` exists as an entry, without following a final symlink.
pub(crate) fn entry_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Copy a file, or a directory tree, from `src` to `dst`.
///
/// `src` lives in the tree rooted at `root`; symlinks met on the way are
/// resolved inside that tree. A link whose target is missing there is
/// recreated as a link. Parent directories of `dst` are created. Returns
/// the number of entries copied.
pub(crate) fn copy_path(root: &Path, src: &Path, dst: &Path) -> io::Result<usize> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut count = 0;
    copy_entry(root, src, dst, &mut count)?;
    Ok(count)
}

fn copy_entry(root: &Path, src: &Path, dst: &Path, count: &mut usize) -> io::Result<()> {
    let Some(resolved) = resolve_in_root(root, src)? else {
        let target = fs::read_link(src)?;
        clear_link(dst)?;
        symlink(&target, dst)?;
        *count += 1;
        return Ok(());
    };

    if resolved.is_dir() {
        clear_link(dst)?;
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(&resolved)? {
            let entry = entry?;
            copy_entry(root, &entry.path(), &dst.join(entry.file_name()), count)?;
        }
    } else {
        clear_link(dst)?;
        fs::copy(&resolved, dst)?;
        *count += 1;
    }
    Ok(())
}
