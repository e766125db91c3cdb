//! Library for the build orchestrator.
//!
//! `forge` provisions ephemeral build workspaces from a long-lived master
//! package cache, injects plugin registrations into the Core's entry point,
//! runs the toolchain's verification matrix, cross-compiles, packages, and
//! signs artifacts. The HTTP surface lives in the `foreman` package; this
//! library is the whole build pipeline behind it.

use bon::Builder;
use camino::Utf8PathBuf;

pub mod archive;
pub mod buildenv;
pub mod cache;
pub mod error;
pub mod exec;
pub mod fs;
pub mod inject;
pub mod log;
pub mod platform;
pub mod request;
pub mod sign;
pub mod vcs;

pub use error::{Error, Kind};

use crate::{exec::Executor, fs::Owner};

/// Service-wide build settings, immutable after startup.
///
/// The `entry_*` and `stamp_import` fields describe the Core's source layout:
/// which package `go build` compiles, which source file receives plugin
/// imports (relative to the Core package directory), and which import path
/// holds the version-stamp string symbols.
#[derive(Clone, Debug, Builder)]
pub struct Settings {
    /// Root of the master package cache (the master `GOPATH`).
    #[builder(into)]
    pub master_root: Utf8PathBuf,

    /// Import path of the Core package.
    #[builder(into)]
    pub core_package: String,

    /// Prefix for artifact names and the packaged binary.
    #[builder(into)]
    pub core_prefix: String,

    /// Import path of the package compiled into the shipped binary.
    #[builder(into)]
    pub entry_package: String,

    /// Path of the plugin-registration source file, relative to the Core
    /// package directory.
    #[builder(into)]
    pub entry_source: String,

    /// Import path whose string symbols receive the version stamp.
    #[builder(into)]
    pub stamp_import: String,

    /// Unprivileged uid/gid for child processes and workspace files.
    pub build_owner: Option<Owner>,

    /// Filesystem jail for child processes.
    pub chroot: Option<Utf8PathBuf>,

    /// Compiler parallelism hint (`go build -p N`).
    #[builder(default = 4)]
    pub parallel_build_ops: u32,

    /// Suffix identifying test sources excluded from workspace copies.
    #[builder(default = String::from("_test.go"))]
    pub test_file_suffix: String,
}

impl Settings {
    /// Executor configured with this service's privilege drop and jail.
    pub fn executor(&self) -> Executor {
        Executor::new(self.build_owner, self.chroot.clone())
    }
}
