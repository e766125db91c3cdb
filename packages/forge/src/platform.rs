//! Build-target enumeration and denylisting.
//!
//! The toolchain is the source of truth for which `(os, arch)` pairs exist;
//! this module expands bare ARM entries into the sub-revisions we ship and
//! removes the combinations known to produce broken binaries.

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    exec::{Executor, Invocation},
    log::BuildLog,
};

/// One build target.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Default, Deserialize, Serialize)]
#[display("{os}/{arch}{arm}")]
pub struct Platform {
    pub os: String,
    pub arch: String,

    /// ARM sub-revision, `"5" | "6" | "7"`; meaningful only when
    /// `arch == "arm"`.
    #[serde(rename = "arm-variant", default)]
    pub arm: String,

    #[serde(rename = "cgo-supported", default)]
    pub cgo: bool,
}

impl Platform {
    /// Look up the catalog entry matching this request's triple.
    pub fn resolve<'a>(&self, catalog: &'a [Platform]) -> Option<&'a Platform> {
        catalog
            .iter()
            .find(|entry| entry.os == self.os && entry.arch == self.arch && entry.arm == self.arm)
    }
}

/// A denylist rule. A rule matches a platform when every non-empty field
/// equals the candidate's corresponding field.
#[derive(Copy, Clone, Debug)]
pub struct Rule {
    pub os: &'static str,
    pub arch: &'static str,
    pub arm: &'static str,
}

impl Rule {
    fn matches(&self, platform: &Platform) -> bool {
        (self.os.is_empty() || self.os == platform.os)
            && (self.arch.is_empty() || self.arch == platform.arch)
            && (self.arm.is_empty() || self.arm == platform.arm)
    }
}

/// Known-broken combinations, excluded from the supported catalog.
pub const DENYLIST: &[Rule] = &[
    Rule { os: "android", arch: "", arm: "" },
    Rule { os: "darwin", arch: "arm", arm: "" },
    Rule { os: "darwin", arch: "arm64", arm: "" },
    Rule { os: "linux", arch: "s390x", arm: "" },
    Rule { os: "nacl", arch: "", arm: "" },
    Rule { os: "plan9", arch: "", arm: "" },
];

/// One entry of the toolchain's target enumeration.
#[derive(Debug, Deserialize)]
struct DistEntry {
    #[serde(rename = "GOOS")]
    os: String,
    #[serde(rename = "GOARCH")]
    arch: String,
    #[serde(rename = "CgoSupported", default)]
    cgo: bool,
}

/// Parse the toolchain's JSON target list into the supported catalog:
/// expand bare ARM entries into sub-revisions 5/6/7, then drop every entry
/// matched by the denylist. ARM revision 5 only links on linux.
pub fn parse_catalog(json: &str) -> Result<Vec<Platform>> {
    let entries: Vec<DistEntry> = serde_json::from_str(json).context("parse target list")?;

    let mut catalog = Vec::with_capacity(entries.len() + 2);
    for entry in entries {
        if entry.arch == "arm" {
            for arm in ["5", "6", "7"] {
                catalog.push(Platform {
                    os: entry.os.clone(),
                    arch: entry.arch.clone(),
                    arm: arm.to_string(),
                    cgo: entry.cgo,
                });
            }
        } else {
            catalog.push(Platform {
                os: entry.os,
                arch: entry.arch,
                arm: String::new(),
                cgo: entry.cgo,
            });
        }
    }

    catalog.retain(|platform| {
        if DENYLIST.iter().any(|rule| rule.matches(platform)) {
            return false;
        }
        !(platform.arm == "5" && platform.os != "linux")
    });
    Ok(catalog)
}

/// Enumerate the supported platforms by asking the toolchain.
#[instrument(skip_all)]
pub async fn supported(
    exec: &Executor,
    log: &BuildLog,
    env: Vec<(String, String)>,
    workdir: &Utf8Path,
) -> Result<Vec<Platform>> {
    let json = exec
        .output(
            log,
            Invocation::builder()
                .program("go")
                .args(
                    ["tool", "dist", "list", "-json"]
                        .map(String::from)
                        .to_vec(),
                )
                .workdir(workdir)
                .env(env)
                .build(),
        )
        .await
        .context("enumerate build targets")?;
    parse_catalog(&json)
}
