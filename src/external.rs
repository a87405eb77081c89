use crate::error::{ExecError, ExecResult};
use nix::unistd::{Gid, Uid, getegid, geteuid, getgroups};
use std::borrow::Cow;
use std::ffi::OsStr;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it is an executable file.
/// - `./foo` or a relative path with several components (e.g., `bin/sh`):
///   returns it if it is an executable file, relative to the current directory.
/// - Single path component: search each directory in `search_paths` (PATH)
///   and return the first executable match, skipping entries we may not run.
/// - Empty path: returns `None`.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() || path.starts_with("./") {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        (None, None) => None,
        (Some(x), None) => find_in_path(search_paths, x.as_os_str()).map(Cow::Owned),
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

/// Like [`find_command_path`], but tells a missing command from one we may not run.
pub fn resolve_command(search_paths: &OsStr, name: &str) -> ExecResult<PathBuf> {
    let path = Path::new(name);
    if let Some(found) = find_command_path(search_paths, path) {
        return Ok(found.into_owned());
    }
    let explicit = path.components().nth(1).is_some() || path.is_absolute();
    if explicit && path.is_file() {
        return Err(ExecError::launch(name, "permission denied"));
    }
    Err(ExecError::Resolution(name.to_string()))
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|path| is_executable(path))
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if is_executable(path) { Some(path) } else { None }
}

/// Whether the effective user may execute the regular file at `path`.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = path.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    let groups = getgroups().unwrap_or_default();
    permits(meta.mode(), meta.uid(), meta.gid(), geteuid(), getegid(), &groups)
}

/// POSIX execute check: owner bits for the owner, group bits for members,
/// other bits for everyone. Root may run anything with some execute bit.
fn permits(mode: u32, owner: u32, group: u32, uid: Uid, gid: Gid, groups: &[Gid]) -> bool {
    if uid.is_root() {
        return mode & 0o111 != 0;
    }
    if uid.as_raw() == owner {
        return mode & 0o100 != 0;
    }
    let in_group = gid.as_raw() == group || groups.iter().any(|g| g.as_raw() == group);
    if in_group {
        return mode & 0o010 != 0;
    }
    mode & 0o001 != 0
}
