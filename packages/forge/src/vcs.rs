//! Source fetching through the toolchain and version-control clients.
//!
//! All operations are idempotent against a repository checkout and run
//! through the privileged executor so their transcripts land in the build
//! log. When multiple plugins share a repository root but request different
//! versions, the last checkout wins; the canonical use case deploys one
//! plugin at a time.

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use tracing::instrument;

use crate::{
    exec::{Executor, Invocation},
    log::BuildLog,
};

/// Fetches and pins package sources inside a cache or workspace root.
#[derive(Clone, Debug)]
pub struct Fetcher<'a> {
    exec: &'a Executor,
    log: &'a BuildLog,
}

impl<'a> Fetcher<'a> {
    pub fn new(exec: &'a Executor, log: &'a BuildLog) -> Self {
        Self { exec, log }
    }

    fn go(&self, env: &[(String, String)], workdir: &Utf8Path, args: Vec<String>) -> Invocation {
        Invocation::builder()
            .program("go")
            .args(args)
            .workdir(workdir)
            .env(env.to_vec())
            .build()
    }

    fn git(&self, env: &[(String, String)], repo: &Utf8Path, args: Vec<String>) -> Invocation {
        Invocation::builder()
            .program("git")
            .args(args)
            .workdir(repo)
            .env(env.to_vec())
            .build()
    }

    /// Obtain the package and its transitive dependencies without upgrading
    /// anything already present. `recursive` expands to all sub-packages
    /// (used for the Core).
    #[instrument(skip(self, env))]
    pub async fn ensure_present(
        &self,
        env: &[(String, String)],
        workdir: &Utf8Path,
        package: &str,
        recursive: bool,
    ) -> Result<()> {
        let target = if recursive {
            format!("{package}/...")
        } else {
            package.to_string()
        };
        self.exec
            .run(
                self.log,
                self.go(env, workdir, vec!["get".into(), "-d".into(), target]),
            )
            .await
            .with_context(|| format!("fetch package: {package}"))
    }

    /// Obtain upstream updates for the package and its dependencies. This is
    /// the mutation that motivates the deploy snapshot and rollback.
    #[instrument(skip(self, env))]
    pub async fn update_with_dependencies(
        &self,
        env: &[(String, String)],
        workdir: &Utf8Path,
        package: &str,
    ) -> Result<()> {
        self.exec
            .run(
                self.log,
                self.go(
                    env,
                    workdir,
                    vec!["get".into(), "-d".into(), "-u".into(), package.to_string()],
                ),
            )
            .await
            .with_context(|| format!("update package: {package}"))
    }

    /// Fetch upstream references without mutating the working tree.
    #[instrument(skip(self, env))]
    pub async fn refresh_refs(&self, env: &[(String, String)], repo: &Utf8Path) -> Result<()> {
        self.exec
            .run(
                self.log,
                self.git(env, repo, vec!["fetch".into(), "--all".into(), "--tags".into()]),
            )
            .await
            .with_context(|| format!("refresh refs: {repo}"))
    }

    /// Switch the working tree to the named revision (tag, branch, commit).
    #[instrument(skip(self, env))]
    pub async fn checkout(
        &self,
        env: &[(String, String)],
        repo: &Utf8Path,
        version: &str,
    ) -> Result<()> {
        self.exec
            .run(
                self.log,
                self.git(env, repo, vec!["checkout".into(), version.to_string()]),
            )
            .await
            .with_context(|| format!("checkout {version} in {repo}"))
    }

    /// Collect the version stamp from the Core's repository.
    #[instrument(skip(self, env))]
    pub async fn stamp(&self, env: &[(String, String)], repo: &Utf8Path) -> Result<Stamp> {
        let describe = |args: Vec<String>| self.git(env, repo, args);

        // An absent tag exits non-zero; that is not an error for the stamp.
        let tag = self
            .exec
            .output(self.log, describe(svec(&["describe", "--exact-match", "HEAD"])))
            .await
            .unwrap_or_default();
        let nearest_tag = self
            .exec
            .output(self.log, describe(svec(&["describe", "--abbrev=0", "--tags"])))
            .await
            .unwrap_or_default();
        let short_stat = self
            .exec
            .output(self.log, describe(svec(&["diff", "--shortstat"])))
            .await
            .unwrap_or_default();
        let files_modified = self
            .exec
            .output(self.log, describe(svec(&["diff", "--name-only"])))
            .await
            .unwrap_or_default();
        let commit = self
            .exec
            .output(self.log, describe(svec(&["rev-parse", "--short", "HEAD"])))
            .await
            .with_context(|| format!("resolve HEAD in {repo}"))?;

        Ok(Stamp {
            build_date: jiff::Timestamp::now()
                .strftime("%a %b %d %H:%M:%S UTC %Y")
                .to_string(),
            tag: tag.trim().to_string(),
            nearest_tag: nearest_tag.trim().to_string(),
            commit: commit.trim().to_string(),
            short_stat: short_stat.trim().to_string(),
            files_modified: files_modified.trim().to_string(),
        })
    }
}

fn svec(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Version metadata embedded into the compiled binary via linker flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stamp {
    /// UTC build timestamp in the toolchain's human-readable layout.
    pub build_date: String,
    /// Exact tag on HEAD; empty when HEAD is untagged.
    pub tag: String,
    /// Nearest tag reachable from HEAD.
    pub nearest_tag: String,
    /// Short commit hash of HEAD.
    pub commit: String,
    /// Summary line of uncommitted changes.
    pub short_stat: String,
    /// Newline-separated list of modified files.
    pub files_modified: String,
}

impl Stamp {
    /// Render the linker flags that bake this stamp into string symbols of
    /// the given import path. Each value is quoted so embedded whitespace
    /// survives the linker's flag splitting.
    pub fn ldflags(&self, import: &str) -> String {
        let fields = [
            ("buildDate", &self.build_date),
            ("gitTag", &self.tag),
            ("gitNearestTag", &self.nearest_tag),
            ("gitCommit", &self.commit),
            ("gitShortStat", &self.short_stat),
            ("gitFilesModified", &self.files_modified),
        ];
        fields
            .iter()
            .map(|(symbol, value)| {
                let value = value.replace('"', "");
                format!("-X \"{import}.{symbol}={value}\"")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ldflags_quote_every_symbol() {
        let stamp = Stamp {
            build_date: "Fri Aug 01 12:00:00 UTC 2026".into(),
            tag: "v1.2.3".into(),
            nearest_tag: "v1.2.3".into(),
            commit: "abc1234".into(),
            short_stat: "1 file changed".into(),
            files_modified: "main.go".into(),
        };
        let flags = stamp.ldflags("example.com/core/entry");
        assert!(flags.contains(
            "-X \"example.com/core/entry.buildDate=Fri Aug 01 12:00:00 UTC 2026\""
        ));
        assert!(flags.contains("-X \"example.com/core/entry.gitTag=v1.2.3\""));
        assert!(flags.contains("-X \"example.com/core/entry.gitCommit=abc1234\""));
        assert_eq!(flags.matches("-X ").count(), 6);
    }

    #[test]
    fn ldflags_strip_embedded_quotes() {
        let stamp = Stamp {
            short_stat: "say \"hi\"".into(),
            ..Stamp::default()
        };
        let flags = stamp.ldflags("example.com/core");
        assert!(flags.contains("gitShortStat=say hi"));
    }
}
