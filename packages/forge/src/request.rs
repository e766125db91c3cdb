//! Request data model shared by the build pipeline and the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// Default Core tracking branch when a request omits the version.
pub const DEFAULT_CORE_VERSION: &str = "master";

/// A user-supplied source extension.
///
/// `package` and `version` identify what gets built; `name` and `id` only
/// accompany the plugin for logging and the build fingerprint.
#[derive(Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Plugin {
    pub package: String,

    /// Any revision identifier the version control client accepts: tag,
    /// branch, or commit.
    pub version: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub id: String,
}

impl Plugin {
    /// The name used in logs and fingerprints; falls back to the package
    /// path when no display name was supplied.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.package
        } else {
            &self.name
        }
    }
}

/// A request to build the Core for one platform with a set of plugins.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BuildRequest {
    #[serde(default)]
    pub core_version: String,

    pub os: String,
    pub arch: String,

    #[serde(default)]
    pub arm: String,

    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

impl BuildRequest {
    pub fn core_version(&self) -> &str {
        if self.core_version.is_empty() {
            DEFAULT_CORE_VERSION
        } else {
            &self.core_version
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            os: self.os.clone(),
            arch: self.arch.clone(),
            arm: self.arm.clone(),
            cgo: false,
        }
    }

    /// Canonical serialization of the request, used as a cache fingerprint:
    /// `"{core-version}:{os}.{arch}.{arm}:{plugin-names}"` with plugin names
    /// lowercased and sorted, so name sets equal up to case and order render
    /// identically. Plugin versions are intentionally omitted; two requests
    /// that differ only in plugin versions collide.
    pub fn fingerprint(&self) -> String {
        let mut names: Vec<String> = self
            .plugins
            .iter()
            .map(|plugin| plugin.display_name().to_lowercase())
            .collect();
        names.sort();
        format!(
            "{}:{}.{}.{}:{}",
            self.core_version(),
            self.os,
            self.arch,
            self.arm,
            names.join(","),
        )
    }
}

/// A request to promote a new Core version into the master cache.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeployCoreRequest {
    #[serde(default)]
    pub core_version: String,
}

impl DeployCoreRequest {
    pub fn core_version(&self) -> &str {
        if self.core_version.is_empty() {
            DEFAULT_CORE_VERSION
        } else {
            &self.core_version
        }
    }
}

/// A request to promote a plugin version into the master cache, verified
/// against the named platforms.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DeployPluginRequest {
    #[serde(default)]
    pub core_version: String,

    pub plugin_package: String,
    pub plugin_version: String,

    #[serde(default)]
    pub required_platforms: Vec<Platform>,
}

impl DeployPluginRequest {
    pub fn core_version(&self) -> &str {
        if self.core_version.is_empty() {
            DEFAULT_CORE_VERSION
        } else {
            &self.core_version
        }
    }

    pub fn plugin(&self) -> Plugin {
        Plugin {
            package: self.plugin_package.clone(),
            version: self.plugin_version.clone(),
            name: String::new(),
            id: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn plugin(name: &str, package: &str, version: &str) -> Plugin {
        Plugin {
            package: package.into(),
            version: version.into(),
            name: name.into(),
            id: String::new(),
        }
    }

    fn request(core: &str, plugins: Vec<Plugin>) -> BuildRequest {
        BuildRequest {
            core_version: core.into(),
            os: "linux".into(),
            arch: "arm".into(),
            arm: "7".into(),
            plugins,
        }
    }

    #[test]
    fn fingerprint_sorts_names_case_insensitively() {
        let a = request(
            "master",
            vec![
                plugin("Markdown", "example.com/md", "v1"),
                plugin("git", "example.com/git", "v2"),
            ],
        );
        let b = request(
            "master",
            vec![
                plugin("git", "example.com/git", "v2"),
                plugin("Markdown", "example.com/md", "v1"),
            ],
        );
        assert_eq!(a.fingerprint(), "master:linux.arm.7:git,markdown");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_case_invariant_in_the_rendered_string() {
        let a = request("master", vec![plugin("Markdown", "example.com/md", "v1")]);
        let b = request("master", vec![plugin("markdown", "example.com/md", "v1")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "master:linux.arm.7:markdown");
    }

    #[test]
    fn fingerprint_ignores_plugin_versions() {
        let a = request("master", vec![plugin("git", "example.com/git", "v1")]);
        let b = request("master", vec![plugin("git", "example.com/git", "v2")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_core_version_and_platform() {
        let a = request("master", vec![]);
        let mut b = request("v0.10.0", vec![]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        b.core_version = "master".into();
        b.arm = "6".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn empty_core_version_defaults_to_the_tracking_branch() {
        let request = request("", vec![]);
        assert_eq!(request.core_version(), "master");
        assert!(request.fingerprint().starts_with("master:"));
    }

    #[test]
    fn build_request_parses_from_json() {
        let request: BuildRequest = serde_json::from_str(
            r#"{
                "core_version": "v0.10.10",
                "os": "darwin",
                "arch": "amd64",
                "plugins": [{"package": "example.com/x", "version": "v1"}]
            }"#,
        )
        .unwrap();
        assert_eq!(request.arm, "");
        assert_eq!(request.plugins[0].display_name(), "example.com/x");
    }
}
