use std::path::Path;

use tempfile::TempDir;

pub mod copy;

#[track_caller]
pub fn temporary_directory() -> (TempDir, camino::Utf8PathBuf) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .expect("temp dir path is utf8");
    (dir, path)
}

#[track_caller]
pub fn write(path: impl AsRef<Path>, contents: &str) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(path, contents).expect("write file");
}
