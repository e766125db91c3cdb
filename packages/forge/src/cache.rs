//! Master cache locking and ephemeral workspace management.
//!
//! The master package cache is shared by every request; access is governed
//! by one reader-writer lock per cache root, created lazily in a
//! process-wide table. Workspaces are throwaway trees branched from the
//! master for the lifetime of a single request.

use std::sync::{Arc, LazyLock};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use tokio::{
    sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock},
    task::spawn_blocking,
};
use tracing::{instrument, trace, warn};

use crate::fs::{self, Owner};

/// Process-wide table of cache-root locks, created lazily per root.
static LOCKS: LazyLock<DashMap<Utf8PathBuf, Arc<RwLock<()>>>> = LazyLock::new(DashMap::new);

fn lock_for(root: &Utf8Path) -> Arc<RwLock<()>> {
    LOCKS.entry(root.to_owned()).or_default().clone()
}

/// Handle to the long-lived master package cache.
///
/// The cache is regenerable: it may be deleted between requests and is
/// rebuilt on demand by provisioning. Every read of the cache holds the
/// read-lock for its duration; every mutation holds the write-lock.
#[derive(Clone, Debug)]
pub struct MasterCache {
    root: Utf8PathBuf,
}

impl MasterCache {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Source directory of a package inside the master cache.
    pub fn src_path(&self, package: &str) -> Utf8PathBuf {
        self.root.join("src").join(package)
    }

    /// Acquire the shared read-lock for this cache root.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn read(&self) -> OwnedRwLockReadGuard<()> {
        lock_for(&self.root).read_owned().await
    }

    /// Acquire the exclusive write-lock for this cache root.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn write(&self) -> OwnedRwLockWriteGuard<()> {
        lock_for(&self.root).write_owned().await
    }
}

/// An ephemeral per-request source tree.
///
/// Lifecycle: Opened -> Provisioned -> (Deployed | Built) -> Closed.
/// Closing removes the tree unconditionally; dropping an unclosed workspace
/// also removes it as a safety net.
#[derive(Debug)]
pub struct Workspace {
    root: Utf8PathBuf,
    dir: Option<tempfile::TempDir>,
}

impl Workspace {
    /// Create a unique workspace root under the system temp area with a
    /// timestamped prefix, mode 0755, owned by the build user when one is
    /// configured.
    #[instrument]
    pub async fn create(owner: Option<Owner>) -> Result<Self> {
        let stamp = jiff::Timestamp::now().strftime("%Y%m%d%H%M%S").to_string();
        let dir = spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(&format!("forge_{stamp}_"))
                .tempdir()
        })
        .await
        .context("join task")?
        .context("create workspace directory")?;

        let root = fs::utf8(dir.path().to_path_buf()).context("workspace path as utf8")?;
        fs::set_mode_and_owner(&root, 0o755, owner)
            .await
            .context("set workspace mode")?;
        trace!(%root, "created workspace");
        Ok(Self {
            root,
            dir: Some(dir),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Source directory of a package inside the workspace.
    pub fn src_path(&self, package: &str) -> Utf8PathBuf {
        self.root.join("src").join(package)
    }

    /// Remove the workspace tree. Individual removal errors are reported
    /// through the first error encountered.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn close(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            warn!(root = %self.root, "workspace already closed");
            return Ok(());
        };
        spawn_blocking(move || dir.close())
            .await
            .context("join task")?
            .context("remove workspace")
    }
}

/// Walk upward from `path` until a directory containing a `.git` marker is
/// found. Returns `None` when the filesystem root is reached first.
pub fn repo_root(path: &Utf8Path) -> Option<Utf8PathBuf> {
    path.ancestors()
        .find(|candidate| candidate.join(".git").exists())
        .map(Utf8Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lock_table_returns_one_lock_per_root() {
        let a1 = lock_for(Utf8Path::new("/tmp/cache-a"));
        let a2 = lock_for(Utf8Path::new("/tmp/cache-a"));
        let b = lock_for(Utf8Path::new("/tmp/cache-b"));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let master = MasterCache::new("/tmp/cache-excl");
        let write = master.write().await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), master.read())
                .await
                .is_err(),
            "read must block while the write-lock is held",
        );
        drop(write);
        let _read = master.read().await;
    }

    #[tokio::test]
    async fn workspace_close_removes_the_tree() {
        let mut workspace = Workspace::create(None).await.expect("create workspace");
        let root = workspace.root().to_path_buf();
        assert!(root.exists());

        tokio::fs::write(root.join("file.txt"), "x").await.unwrap();
        workspace.close().await.expect("close workspace");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn workspaces_are_disjoint() {
        let mut a = Workspace::create(None).await.expect("workspace a");
        let mut b = Workspace::create(None).await.expect("workspace b");
        assert_ne!(a.root(), b.root());
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[test]
    fn repo_root_walks_upward() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("repo/.git")).unwrap();
        std::fs::create_dir_all(root.join("repo/sub/pkg")).unwrap();

        let found = repo_root(&root.join("repo/sub/pkg")).expect("find repo root");
        assert_eq!(found, root.join("repo"));
        assert_eq!(repo_root(&root.join("elsewhere")), None);
    }

    #[test]
    fn src_paths_follow_the_layout() {
        let master = MasterCache::new("/srv/master");
        assert_eq!(
            master.src_path("example.com/core"),
            Utf8PathBuf::from("/srv/master/src/example.com/core"),
        );
    }
}
