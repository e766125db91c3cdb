use std::{
    collections::BTreeMap,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use color_eyre::{Result, eyre::Context};
use forge::fs::{self, CopyFlags};
use pretty_assertions::assert_eq;
use walkdir::WalkDir;

use crate::{temporary_directory, write};

/// Everything we expect a mirror to preserve: relative path, kind, mode
/// bits, and file contents.
#[derive(Clone, Eq, PartialEq, Debug)]
struct Entry {
    directory: bool,
    mode: u32,
    contents: Option<Vec<u8>>,
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
struct Tree(BTreeMap<PathBuf, Entry>);

impl Tree {
    fn from_directory(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut entries = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.context("walk directory")?;
            if entry.depth() == 0 {
                continue;
            }
            let meta = entry.metadata().context("get metadata")?;
            let contents = meta
                .is_file()
                .then(|| std::fs::read(entry.path()))
                .transpose()
                .context("read file")?;
            entries.insert(
                entry.path().strip_prefix(root).context("relativize")?.to_path_buf(),
                Entry {
                    directory: meta.is_dir(),
                    mode: meta.permissions().mode() & 0o777,
                    contents,
                },
            );
        }
        Ok(Self(entries))
    }
}

fn seed_source(root: &Path) {
    write(root.join("repo/main.go"), "package main\n");
    write(root.join("repo/sub/util.go"), "package sub\n");
    write(root.join("repo/sub/deep/nested.go"), "package deep\n");
    write(root.join("repo/assets/site.css"), "body {}\n");
    std::fs::set_permissions(
        root.join("repo/main.go"),
        std::fs::Permissions::from_mode(0o640),
    )
    .expect("set mode");
}

#[test_log::test(tokio::test)]
async fn mirrored_trees_are_equivalent() -> Result<()> {
    let (_src_guard, src) = temporary_directory();
    let (_dst_guard, dst) = temporary_directory();
    seed_source(src.as_std_path());

    let mirror = dst.join("mirror");
    fs::copy_tree(&src, &mirror, CopyFlags::default())
        .await
        .context("copy tree")?;

    let (source, destination) = (
        Tree::from_directory(&src).context("index source")?,
        Tree::from_directory(&mirror).context("index mirror")?,
    );
    assert_eq!(source, destination, "directories should be equivalent");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn recopying_over_an_existing_mirror_converges() -> Result<()> {
    let (_src_guard, src) = temporary_directory();
    let (_dst_guard, dst) = temporary_directory();
    seed_source(src.as_std_path());

    let mirror = dst.join("mirror");
    fs::copy_tree(&src, &mirror, CopyFlags::default())
        .await
        .context("first copy")?;

    // Source changes between copies; the second copy must win.
    write(src.join("repo/main.go").as_std_path(), "package main // v2\n");
    fs::copy_tree(&src, &mirror, CopyFlags::default())
        .await
        .context("second copy")?;

    let copied = std::fs::read_to_string(mirror.join("repo/main.go"))?;
    assert_eq!(copied, "package main // v2\n");

    let (source, destination) = (
        Tree::from_directory(&src).context("index source")?,
        Tree::from_directory(&mirror).context("index mirror")?,
    );
    assert_eq!(source, destination);
    Ok(())
}
