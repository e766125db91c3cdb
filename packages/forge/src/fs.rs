//! Filesystem operations tailored to the build service.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using. Tree walks
//! are blocking and run under `spawn_blocking`; the async wrappers are what
//! the rest of the crate uses.

use std::{
    fmt::Debug as StdDebug,
    io,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use tap::TapFallible;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace};
use walkdir::{DirEntry, WalkDir};

/// A uid/gid pair applied to files created on behalf of the build user.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Filters and ownership policy for [`copy_tree`].
#[derive(Clone, Debug, Default, Builder)]
pub struct CopyFlags {
    /// Omit entries whose base name begins with `.`, without descending
    /// into hidden directories.
    #[builder(default)]
    pub skip_hidden: bool,

    /// Omit symbolic links entirely (neither link nor target is copied).
    #[builder(default)]
    pub skip_symlinks: bool,

    /// Omit `testdata` directories and files ending with this suffix.
    #[builder(into)]
    pub skip_test_suffix: Option<String>,

    /// Destinations inherit the source uid/gid instead of `chown_to`.
    #[builder(default)]
    pub preserve_owner: bool,

    /// Owner for created entries when not preserving the source owner.
    pub chown_to: Option<Owner>,
}

impl CopyFlags {
    fn keep(&self, entry: &DirEntry) -> bool {
        // The copy root itself is never filtered.
        if entry.depth() == 0 {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if self.skip_hidden && name.starts_with('.') {
            return false;
        }
        if self.skip_symlinks && entry.file_type().is_symlink() {
            return false;
        }
        if let Some(suffix) = &self.skip_test_suffix {
            if entry.file_type().is_dir() && name == "testdata" {
                return false;
            }
            if entry.file_type().is_file() && name.ends_with(suffix.as_str()) {
                return false;
            }
        }
        true
    }

    /// Owner to apply to a destination entry copied from `meta`.
    fn owner_for(&self, meta: &std::fs::Metadata) -> Option<Owner> {
        if self.preserve_owner {
            Some(Owner {
                uid: meta.uid(),
                gid: meta.gid(),
            })
        } else {
            self.chown_to
        }
    }
}

/// Recursively mirror `src` into `dst`, applying `flags`.
///
/// Permission bits are always preserved. File contents are fsynced before
/// close; the first failure aborts the traversal, so partial output may
/// exist on failure. Copying over an existing destination overwrites files
/// in place.
#[instrument(skip(flags))]
pub async fn copy_tree(
    src: impl AsRef<Path> + StdDebug,
    dst: impl AsRef<Path> + StdDebug,
    flags: CopyFlags,
) -> Result<()> {
    let (src, dst) = (src.as_ref().to_path_buf(), dst.as_ref().to_path_buf());
    spawn_blocking(move || copy_tree_sync(&src, &dst, &flags))
        .await
        .context("join task")?
}

fn copy_tree_sync(src: &Path, dst: &Path, flags: &CopyFlags) -> Result<()> {
    let root_meta = std::fs::metadata(src).with_context(|| format!("stat source: {src:?}"))?;
    let root_owner = flags.owner_for(&root_meta);
    materialize_path(dst, root_meta.mode(), root_owner)
        .with_context(|| format!("materialize destination: {dst:?}"))?;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| flags.keep(entry));
    for entry in walker {
        let entry = entry.context("walk source tree")?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {:?} against {src:?}", entry.path()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        let meta = std::fs::symlink_metadata(entry.path())
            .with_context(|| format!("stat source entry: {:?}", entry.path()))?;
        let owner = flags.owner_for(&meta);

        if file_type.is_dir() {
            create_dir_owned(&target, meta.mode(), owner)
                .with_context(|| format!("create directory: {target:?}"))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target, owner)
                .with_context(|| format!("copy symlink: {target:?}"))?;
        } else {
            copy_file_sync(entry.path(), &target, &meta, owner)
                .with_context(|| format!("copy file: {target:?}"))?;
        }
    }
    Ok(())
}

/// Create every missing component of `dir` individually so ownership can be
/// applied per created component. Existing ancestors are left untouched.
fn materialize_path(dir: &Path, mode: u32, owner: Option<Owner>) -> Result<()> {
    let mut components = Vec::new();
    for ancestor in dir.ancestors() {
        if ancestor.as_os_str().is_empty() || ancestor.exists() {
            break;
        }
        components.push(ancestor.to_path_buf());
    }
    for component in components.into_iter().rev() {
        create_dir_owned(&component, mode, owner)
            .with_context(|| format!("create path component: {component:?}"))?;
    }
    Ok(())
}

fn create_dir_owned(dir: &Path, mode: u32, owner: Option<Owner>) -> Result<()> {
    match std::fs::create_dir(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(err) => return Err(err).context(format!("create directory: {dir:?}")),
    }
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode & 0o7777))
        .with_context(|| format!("set directory mode: {dir:?}"))?;
    apply_owner(dir, owner)
}

fn copy_symlink(src: &Path, dst: &Path, owner: Option<Owner>) -> Result<()> {
    let link = std::fs::read_link(src).context("read link target")?;
    match std::fs::remove_file(dst) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("remove stale destination"),
    }
    std::os::unix::fs::symlink(&link, dst).context("create symlink")?;
    if let Some(owner) = owner {
        std::os::unix::fs::lchown(dst, Some(owner.uid), Some(owner.gid))
            .context("chown symlink")?;
    }
    Ok(())
}

fn copy_file_sync(
    src: &Path,
    dst: &Path,
    meta: &std::fs::Metadata,
    owner: Option<Owner>,
) -> Result<()> {
    let mut reader = std::fs::File::open(src).context("open source file")?;
    let mut writer = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(dst)
        .context("open destination file")?;
    io::copy(&mut reader, &mut writer).context("copy file contents")?;
    writer
        .set_permissions(std::fs::Permissions::from_mode(meta.mode() & 0o7777))
        .context("set file mode")?;
    // Sync before close so a crash mid-traversal cannot leave a file that
    // looks copied but has no durable contents.
    writer.sync_all().context("sync destination file")?;
    drop(writer);
    apply_owner(dst, owner)
}

fn apply_owner(path: &Path, owner: Option<Owner>) -> Result<()> {
    if let Some(owner) = owner {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
            .with_context(|| format!("chown: {path:?}"))?;
    }
    Ok(())
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + StdDebug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Remove the directory and all its contents, tolerating a missing root.
pub async fn remove_dir_all(path: impl AsRef<Path> + StdDebug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Rename `from` to `to`.
#[instrument]
pub async fn rename(
    from: impl AsRef<Path> + StdDebug,
    to: impl AsRef<Path> + StdDebug,
) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    tokio::fs::rename(from, to)
        .await
        .with_context(|| format!("rename {from:?} to {to:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_utf8(path: impl AsRef<Path> + StdDebug) -> Result<Option<String>> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Replace the file's contents from a staged buffer, with the given mode.
#[instrument(skip(content))]
pub async fn write_with_mode(
    path: impl AsRef<Path> + StdDebug,
    content: impl AsRef<[u8]>,
    mode: u32,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let (path, content) = (path.as_ref(), content.as_ref());
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(mode)
        .open(path)
        .await
        .with_context(|| format!("open file: {path:?}"))?;
    file.write_all(content).await.context("write contents")?;
    // The mode in `open` only applies to newly created files.
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .await
        .context("set file mode")?;
    file.sync_all().await.context("sync file")?;
    trace!(?path, bytes = content.len(), "wrote file");
    Ok(())
}

/// Set the mode and ownership of an existing path.
#[instrument]
pub async fn set_mode_and_owner(
    path: impl AsRef<Path> + StdDebug,
    mode: u32,
    owner: Option<Owner>,
) -> Result<()> {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("set mode: {path:?}"))?;
        apply_owner(&path, owner)
    })
    .await
    .context("join task")?
}

/// Convert a `PathBuf` into a UTF-8 path or fail.
pub fn utf8(path: PathBuf) -> Result<camino::Utf8PathBuf> {
    camino::Utf8PathBuf::from_path_buf(path).map_err(|path| eyre!("path is not utf8: {path:?}"))
}
