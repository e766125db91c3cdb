//! Artifact naming and packaging.
//!
//! Finished builds ship as a single archive holding the binary next to the
//! distribution manifest from the Core repository. Windows and darwin
//! consumers get a `.zip`; everything else gets a `.tar.gz`.

use std::{
    fs::File,
    io,
    os::unix::fs::MetadataExt,
    path::Path,
};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{Result, eyre::Context};
use flate2::{Compression, write::GzEncoder};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument};
use zip::{ZipWriter, write::SimpleFileOptions};

/// The distribution manifest packaged beside the binary, resolved relative
/// to the Core repository's `dist/` directory.
pub const DIST_FILES: &[&str] = &["README.txt", "LICENSES.txt", "CHANGES.txt", "AUTHORS.txt"];

/// A packaged build artifact on disk.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: Utf8PathBuf,
    pub filename: String,
}

/// Archive extension for the target OS.
pub fn extension(os: &str) -> &'static str {
    match os {
        "windows" | "darwin" => ".zip",
        _ => ".tar.gz",
    }
}

/// Version component of the artifact name: long non-tag versions (commit
/// hashes) are truncated to eight characters; tags and short names pass
/// through.
fn short_version(version: &str) -> &str {
    if version.len() > 8 && !version.starts_with('v') {
        &version[..8]
    } else {
        version
    }
}

/// Deterministic artifact base name:
/// `"{prefix}_{ver}_{os}_{arch}{arm}{_custom if plugins present}"`.
pub fn base_name(
    prefix: &str,
    core_version: &str,
    os: &str,
    arch: &str,
    arm: &str,
    custom: bool,
) -> String {
    let mut name = format!(
        "{prefix}_{}_{os}_{arch}{arm}",
        short_version(core_version),
    );
    if custom {
        name.push_str("_custom");
    }
    name
}

/// Package the binary and distribution manifest into `{out_dir}/{base}{ext}`.
#[instrument(skip(binary, dist_dir))]
pub async fn pack(
    out_dir: &Utf8Path,
    base: &str,
    os: &str,
    binary: &Utf8Path,
    binary_name: &str,
    dist_dir: &Utf8Path,
) -> Result<Artifact> {
    let filename = format!("{base}{}", extension(os));
    let path = out_dir.join(&filename);

    let (zip, path_in, binary_in, binary_name_in, dist_in) = (
        extension(os) == ".zip",
        path.clone(),
        binary.to_path_buf(),
        binary_name.to_string(),
        dist_dir.to_path_buf(),
    );
    spawn_blocking(move || {
        if zip {
            pack_zip(&path_in, &binary_in, &binary_name_in, &dist_in)
        } else {
            pack_tar_gz(&path_in, &binary_in, &binary_name_in, &dist_in)
        }
    })
    .await
    .context("join task")?
    .with_context(|| format!("package artifact: {path}"))?;

    debug!(%path, "packaged artifact");
    Ok(Artifact { path, filename })
}

fn pack_tar_gz(
    archive: &Utf8Path,
    binary: &Utf8Path,
    binary_name: &str,
    dist_dir: &Utf8Path,
) -> Result<()> {
    let file = File::create(archive).context("create archive file")?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    builder
        .append_path_with_name(binary, binary_name)
        .context("append binary")?;
    for name in DIST_FILES {
        let source = dist_dir.join(name);
        builder
            .append_path_with_name(&source, name)
            .with_context(|| format!("append distribution file: {source}"))?;
    }

    let encoder = builder.into_inner().context("finish tar stream")?;
    let file = encoder.finish().context("finish gzip stream")?;
    file.sync_all().context("sync archive")
}

fn pack_zip(
    archive: &Utf8Path,
    binary: &Utf8Path,
    binary_name: &str,
    dist_dir: &Utf8Path,
) -> Result<()> {
    let file = File::create(archive).context("create archive file")?;
    let mut writer = ZipWriter::new(file);

    append_zip_entry(&mut writer, binary.as_std_path(), binary_name)
        .context("append binary")?;
    for name in DIST_FILES {
        let source = dist_dir.join(name);
        append_zip_entry(&mut writer, source.as_std_path(), name)
            .with_context(|| format!("append distribution file: {source}"))?;
    }

    let file = writer.finish().context("finish zip stream")?;
    file.sync_all().context("sync archive")
}

fn append_zip_entry(writer: &mut ZipWriter<File>, source: &Path, name: &str) -> Result<()> {
    let meta = std::fs::metadata(source).context("stat entry")?;
    let options = SimpleFileOptions::default().unix_permissions(meta.mode() & 0o7777);
    writer.start_file(name, options).context("start entry")?;
    let mut reader = File::open(source).context("open entry source")?;
    io::copy(&mut reader, writer).context("write entry contents")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn name_follows_the_grammar() {
        assert_eq!(
            base_name("caddy", "master", "linux", "amd64", "", false),
            "caddy_master_linux_amd64",
        );
        assert_eq!(
            base_name("caddy", "master", "linux", "arm", "7", false),
            "caddy_master_linux_arm7",
        );
        assert_eq!(
            base_name("caddy", "master", "darwin", "amd64", "", true),
            "caddy_master_darwin_amd64_custom",
        );
    }

    #[test]
    fn commit_versions_truncate_but_tags_do_not() {
        assert_eq!(
            base_name("caddy", "0123456789abcdef", "linux", "amd64", "", false),
            "caddy_01234567_linux_amd64",
        );
        assert_eq!(
            base_name("caddy", "v0.10.10", "linux", "amd64", "", false),
            "caddy_v0.10.10_linux_amd64",
        );
        assert_eq!(short_version("v1"), "v1");
        assert_eq!(short_version("short"), "short");
    }

    #[test]
    fn extension_depends_on_os() {
        assert_eq!(extension("windows"), ".zip");
        assert_eq!(extension("darwin"), ".zip");
        assert_eq!(extension("linux"), ".tar.gz");
        assert_eq!(extension("freebsd"), ".tar.gz");
    }

    fn seed_dist(root: &Path) -> (Utf8PathBuf, Utf8PathBuf) {
        let dist = root.join("dist");
        std::fs::create_dir_all(&dist).unwrap();
        for name in DIST_FILES {
            std::fs::write(dist.join(name), format!("{name} contents")).unwrap();
        }
        let binary = root.join("core-binary");
        std::fs::write(&binary, b"\x7fELFfake").unwrap();
        (
            Utf8PathBuf::from_path_buf(binary).unwrap(),
            Utf8PathBuf::from_path_buf(dist).unwrap(),
        )
    }

    #[tokio::test]
    async fn tar_archives_start_with_the_gzip_magic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (binary, dist) = seed_dist(tmp.path());
        let out = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        let artifact = pack(&out, "caddy_master_linux_amd64", "linux", &binary, "caddy", &dist)
            .await
            .expect("pack tar.gz");
        assert_eq!(artifact.filename, "caddy_master_linux_amd64.tar.gz");

        let bytes = std::fs::read(&artifact.path).unwrap();
        assert_eq!(&bytes[..2], &[0x1F, 0x8B]);
    }

    #[tokio::test]
    async fn zip_archives_carry_every_manifest_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (binary, dist) = seed_dist(tmp.path());
        let out = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

        let artifact = pack(
            &out,
            "caddy_master_darwin_amd64_custom",
            "darwin",
            &binary,
            "caddy",
            &dist,
        )
        .await
        .expect("pack zip");
        assert_eq!(artifact.filename, "caddy_master_darwin_amd64_custom.zip");

        let file = File::open(artifact.path.as_std_path()).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&String::from("caddy")));
        for name in DIST_FILES {
            assert!(names.contains(&name.to_string()), "missing {name}");
        }
    }
}
