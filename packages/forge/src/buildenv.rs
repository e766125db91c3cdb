//! Build environment orchestration.
//!
//! A [`BuildEnv`] owns one ephemeral workspace branched from the master
//! cache and pinned to the requested Core and plugin versions. Builds
//! inject plugin imports, cross-compile, and package artifacts inside the
//! workspace; deploys promote new versions into the master cache behind
//! verification, with snapshot-and-rollback when checks fail.

use std::{collections::BTreeMap, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{info, instrument, warn};

use crate::{
    Settings,
    archive::{self, Artifact},
    cache::{self, MasterCache, Workspace},
    error::{Categorize, Error, Kind},
    exec::{self, Executor, Invocation},
    fs::{self, CopyFlags},
    inject,
    log::BuildLog,
    platform::Platform,
    request::{DEFAULT_CORE_VERSION, Plugin},
    vcs::{Fetcher, Stamp},
};

/// What a deploy promotes into the master cache.
#[derive(Clone, Debug)]
enum DeployTarget {
    Core,
    Plugin(Plugin),
}

/// One provisioned build environment.
///
/// Lifecycle: [`BuildEnv::open`] provisions the workspace; [`BuildEnv::build`]
/// or [`BuildEnv::deploy`] runs the workflow; the caller must finish with
/// [`BuildEnv::close`] on every exit path.
#[derive(Debug)]
pub struct BuildEnv {
    settings: Arc<Settings>,
    master: MasterCache,
    workspace: Workspace,
    exec: Executor,
    log: BuildLog,
    core_version: String,
    plugins: Vec<Plugin>,
    /// Desired version per package path, including the Core.
    versions: BTreeMap<String, String>,
}

impl BuildEnv {
    /// Allocate a workspace and provision it with the Core and every plugin
    /// at their requested versions. On failure the workspace is removed
    /// before returning.
    #[instrument(skip(settings, plugins), fields(plugins = plugins.len()))]
    pub async fn open(
        settings: Arc<Settings>,
        core_version: impl Into<String> + std::fmt::Debug,
        plugins: Vec<Plugin>,
    ) -> Result<Self, Error> {
        let core_version = match core_version.into() {
            version if version.is_empty() => DEFAULT_CORE_VERSION.to_string(),
            version => version,
        };
        for plugin in &plugins {
            if plugin.package.is_empty() {
                return Err(Error::validation("plugin package path is required"));
            }
        }

        let mut versions = BTreeMap::new();
        versions.insert(settings.core_package.clone(), core_version.clone());
        for plugin in &plugins {
            versions.insert(plugin.package.clone(), plugin.version.clone());
        }

        let workspace = Workspace::create(settings.build_owner)
            .await
            .categorize(Kind::Internal)?;
        let mut env = Self {
            exec: settings.executor(),
            master: MasterCache::new(settings.master_root.clone()),
            settings,
            workspace,
            log: BuildLog::new(),
            core_version,
            plugins,
            versions,
        };
        info!(workspace = %env.workspace.root(), "buildenv.opened");

        if let Err(error) = env.provision().await {
            if let Err(close_error) = env.workspace.close().await {
                warn!(?close_error, "could not remove workspace after failed provision");
            }
            return Err(error);
        }
        Ok(env)
    }

    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    /// Scratch directory for build outputs, removed with the workspace.
    pub fn out_dir(&self) -> Utf8PathBuf {
        self.workspace.root().join("out")
    }

    /// Remove the workspace tree. Safe to call exactly once on every exit
    /// path; the drop guard covers panics.
    #[instrument(skip(self))]
    pub async fn close(&mut self) -> Result<(), Error> {
        self.workspace.close().await.categorize(Kind::Internal)
    }

    fn is_core(&self, package: &str) -> bool {
        package == self.settings.core_package
    }

    /// Whitelisted environment for master-only operations.
    fn master_env(&self) -> Vec<(String, String)> {
        exec::base_env(self.master.root())
    }

    /// Whitelisted environment preferring workspace-pinned sources over the
    /// master cache.
    fn combined_env(&self) -> Vec<(String, String)> {
        exec::base_env(format!("{}:{}", self.workspace.root(), self.master.root()))
    }

    fn entry_source_path(&self) -> Utf8PathBuf {
        self.workspace
            .src_path(&self.settings.core_package)
            .join(&self.settings.entry_source)
    }

    fn workspace_repo(&self, package: &str) -> Result<Utf8PathBuf, Error> {
        let src = self.workspace.src_path(package);
        cache::repo_root(&src).ok_or_else(|| {
            Error::logged(
                Kind::Provisioning,
                eyre!("no repository root above {src}"),
                &self.log,
            )
        })
    }

    /// Populate the master cache with every desired package, then branch the
    /// workspace from it and pin the requested versions.
    ///
    /// Idempotent: a second provision of the same environment only re-runs
    /// the idempotent fetch and checkout steps.
    #[instrument(skip(self))]
    async fn provision(&mut self) -> Result<(), Error> {
        let exec = self.exec.clone();
        let log = self.log.clone();
        let fetcher = Fetcher::new(&exec, &log);
        let master_env = self.master_env();

        {
            let _write = self.master.write().await;
            // The master cache is a warm cache, not a durable store: it may
            // have been deleted since the last request and regenerates here.
            fs::create_dir_all(self.master.root())
                .await
                .categorize(Kind::Provisioning)?;
            for package in self.versions.keys() {
                fetcher
                    .ensure_present(&master_env, self.master.root(), package, self.is_core(package))
                    .await
                    .categorize_logged(Kind::Provisioning, &log)?;
            }
        }

        let _read = self.master.read().await;
        for (package, version) in &self.versions {
            let master_src = self.master.src_path(package);
            let master_repo = cache::repo_root(&master_src).ok_or_else(|| {
                Error::logged(
                    Kind::Provisioning,
                    eyre!("no repository root above {master_src}"),
                    &log,
                )
            })?;
            let rel = master_repo
                .strip_prefix(self.master.root())
                .with_context(|| format!("relativize {master_repo} against the master cache"))
                .categorize(Kind::Provisioning)?;
            let workspace_repo = self.workspace.root().join(rel);

            if !workspace_repo.exists() {
                let flags = CopyFlags::builder()
                    .skip_test_suffix(self.settings.test_file_suffix.clone())
                    .maybe_chown_to(self.settings.build_owner)
                    .build();
                fs::copy_tree(&master_repo, &workspace_repo, flags)
                    .await
                    .categorize_logged(Kind::Provisioning, &log)?;
                log.line(format!("copied {master_repo} into the workspace"));
            }

            let combined = self.combined_env();
            fetcher
                .refresh_refs(&combined, &workspace_repo)
                .await
                .categorize_logged(Kind::Provisioning, &log)?;
            fetcher
                .checkout(&combined, &workspace_repo, version)
                .await
                .categorize_logged(Kind::Provisioning, &log)?;
            // The pinned revision may depend on packages the previous one
            // did not; pull them into the workspace half of the path.
            fetcher
                .ensure_present(&combined, self.workspace.root(), package, self.is_core(package))
                .await
                .categorize_logged(Kind::Provisioning, &log)?;
        }
        Ok(())
    }

    /// Compile and package the Core (with plugins) for one platform.
    ///
    /// The workspace stays open afterwards; the caller streams the artifact
    /// and then closes the environment.
    #[instrument(skip(self), fields(platform = %platform))]
    pub async fn build(
        &mut self,
        platform: &Platform,
        out_dir: &Utf8Path,
    ) -> Result<Artifact, Error> {
        let log = self.log.clone();
        fs::create_dir_all(out_dir).await.categorize(Kind::Internal)?;

        let packages: Vec<String> = self.plugins.iter().map(|p| p.package.clone()).collect();
        if !packages.is_empty() {
            inject::inject_file(&self.entry_source_path(), &packages)
                .await
                .categorize_logged(Kind::Build, &log)?;
            log.line(format!("registered {} plugin import(s)", packages.len()));
        }

        let exec = self.exec.clone();
        let fetcher = Fetcher::new(&exec, &log);
        let core_repo = self.workspace_repo(&self.settings.core_package)?;
        let stamp = fetcher
            .stamp(&self.combined_env(), &core_repo)
            .await
            .categorize_logged(Kind::Build, &log)?;

        let binary_name = match platform.os.as_str() {
            "windows" => format!("{}.exe", self.settings.core_prefix),
            _ => self.settings.core_prefix.clone(),
        };
        let binary = out_dir.join(&binary_name);
        self.compile(platform, Some(&stamp), &binary)
            .await
            .categorize_logged(Kind::Build, &log)?;

        let base = archive::base_name(
            &self.settings.core_prefix,
            &self.core_version,
            &platform.os,
            &platform.arch,
            &platform.arm,
            !self.plugins.is_empty(),
        );
        let artifact = archive::pack(
            out_dir,
            &base,
            &platform.os,
            &binary,
            &binary_name,
            &core_repo.join("dist"),
        )
        .await
        .categorize_logged(Kind::Build, &log)?;
        info!(filename = %artifact.filename, "buildenv.artifact.created");
        Ok(artifact)
    }

    async fn compile(
        &self,
        platform: &Platform,
        stamp: Option<&Stamp>,
        out: &Utf8Path,
    ) -> color_eyre::Result<()> {
        let mut env = self.combined_env();
        env.push((String::from("GOOS"), platform.os.clone()));
        env.push((String::from("GOARCH"), platform.arch.clone()));
        if !platform.arm.is_empty() {
            env.push((String::from("GOARM"), platform.arm.clone()));
        }
        // CGO stays off for cross builds; darwin requires it.
        let cgo = if platform.os == "darwin" { "1" } else { "0" };
        env.push((String::from("CGO_ENABLED"), cgo.to_string()));

        let mut args = vec![
            String::from("build"),
            String::from("-p"),
            self.settings.parallel_build_ops.to_string(),
        ];
        if let Some(stamp) = stamp {
            args.push(String::from("-ldflags"));
            args.push(stamp.ldflags(&self.settings.stamp_import));
        }
        args.push(String::from("-o"));
        args.push(out.to_string());
        args.push(self.settings.entry_package.clone());

        self.exec
            .run(
                &self.log,
                Invocation::builder()
                    .program("go")
                    .args(args)
                    .workdir(self.workspace.root())
                    .env(env)
                    .build(),
            )
            .await
            .with_context(|| format!("compile for {platform}"))
    }

    /// Promote the environment's target into the master cache.
    ///
    /// The environment must contain exactly the Core (Core deploy) or the
    /// Core plus one plugin (plugin deploy). Checks that fail after the
    /// master has been updated roll it back from a snapshot taken up front.
    #[instrument(skip(self, required_platforms), fields(platforms = required_platforms.len()))]
    pub async fn deploy(&mut self, required_platforms: &[Platform]) -> Result<(), Error> {
        let target = match self.plugins.as_slice() {
            [] => DeployTarget::Core,
            [plugin] => DeployTarget::Plugin(plugin.clone()),
            plugins => {
                return Err(Error::validation(format!(
                    "deploy requires exactly the Core or the Core plus one plugin, got {} plugins",
                    plugins.len(),
                )));
            }
        };

        let stamp = jiff::Timestamp::now().strftime("%Y%m%d%H%M%S");
        let snapshot = Utf8PathBuf::from(format!("{}.backup_{stamp}", self.master.root()));
        {
            let _read = self.master.read().await;
            fs::copy_tree(
                self.master.root(),
                &snapshot,
                CopyFlags::builder().preserve_owner(true).build(),
            )
            .await
            .context("snapshot the master cache")
            .categorize(Kind::Integrity)?;
        }
        self.log.line(format!("snapshotted master cache to {snapshot}"));

        let result = self.deploy_inner(&target, required_platforms).await;
        let result = match result {
            // Failed checks (and failed updates) may have left the master
            // newer than what verification accepted; restore the snapshot.
            Err(error) if matches!(error.kind(), Kind::Verification | Kind::Provisioning) => {
                warn!(kind = %error.kind(), "deploy failed; rolling back the master cache");
                match self.rollback(&snapshot).await {
                    Ok(()) => Err(error),
                    Err(rollback_error) => Err(rollback_error),
                }
            }
            other => other,
        };

        if let Err(error) = fs::remove_dir_all(&snapshot).await {
            warn!(?error, "could not remove master cache snapshot");
        }
        result
    }

    async fn deploy_inner(
        &mut self,
        target: &DeployTarget,
        required_platforms: &[Platform],
    ) -> Result<(), Error> {
        let exec = self.exec.clone();
        let log = self.log.clone();
        let fetcher = Fetcher::new(&exec, &log);
        let master_env = self.master_env();
        let package = match target {
            DeployTarget::Core => self.settings.core_package.clone(),
            DeployTarget::Plugin(plugin) => plugin.package.clone(),
        };

        // Scratch space for the cross-build checks. Created before the
        // update: once the master has been touched, every failure must be
        // one the rollback condition matches.
        let scratch = self.workspace.root().join("tmp");
        fs::create_dir_all(&scratch).await.categorize(Kind::Internal)?;

        {
            let _write = self.master.write().await;
            fetcher
                .update_with_dependencies(&master_env, self.master.root(), &package)
                .await
                .categorize_logged(Kind::Provisioning, &log)?;
        }

        let _read = self.master.read().await;
        match target {
            DeployTarget::Plugin(plugin) => {
                // Vet and test the updated plugin against the master cache,
                // then prove the pinned Core still builds and tests with the
                // plugin registered.
                self.vet(&master_env, self.master.root(), &plugin.package).await?;
                self.test(&master_env, self.master.root(), &plugin.package).await?;
                inject::inject_file(&self.entry_source_path(), &[plugin.package.clone()])
                    .await
                    .categorize_logged(Kind::Verification, &log)?;
                self.test(
                    &self.combined_env(),
                    self.workspace.root(),
                    &self.settings.core_package,
                )
                .await?;
            }
            DeployTarget::Core => {
                self.vet(&master_env, self.master.root(), &self.settings.core_package)
                    .await?;
                self.test(&master_env, self.master.root(), &self.settings.core_package)
                    .await?;
            }
        }

        // Cross-builds run serialized; compiler parallelism is already
        // saturated by the -p hint.
        for platform in required_platforms {
            let out = scratch.join(format!(
                "check_{}_{}{}",
                platform.os, platform.arch, platform.arm,
            ));
            self.compile(platform, None, &out)
                .await
                .categorize_logged(Kind::Verification, &log)?;
        }
        Ok(())
    }

    async fn vet(
        &self,
        env: &[(String, String)],
        workdir: &Utf8Path,
        package: &str,
    ) -> Result<(), Error> {
        self.exec
            .run(
                &self.log,
                Invocation::builder()
                    .program("go")
                    .args(vec![String::from("vet"), format!("{package}/...")])
                    .workdir(workdir)
                    .env(env.to_vec())
                    .build(),
            )
            .await
            .with_context(|| format!("vet {package}"))
            .categorize_logged(Kind::Verification, &self.log)
    }

    async fn test(
        &self,
        env: &[(String, String)],
        workdir: &Utf8Path,
        package: &str,
    ) -> Result<(), Error> {
        self.exec
            .run(
                &self.log,
                Invocation::builder()
                    .program("go")
                    .args(vec![String::from("test"), format!("{package}/...")])
                    .workdir(workdir)
                    .env(env.to_vec())
                    .build(),
            )
            .await
            .with_context(|| format!("test {package}"))
            .categorize_logged(Kind::Verification, &self.log)
    }

    /// Restore the master cache from the snapshot: displace the current
    /// master, deep-copy the snapshot into place, then clean up the
    /// displaced tree.
    async fn rollback(&self, snapshot: &Utf8Path) -> Result<(), Error> {
        let _write = self.master.write().await;
        let stamp = jiff::Timestamp::now().strftime("%Y%m%d%H%M%S");
        let displaced = Utf8PathBuf::from(format!("{}.broken_{stamp}", self.master.root()));

        fs::rename(self.master.root(), &displaced)
            .await
            .context("displace the updated master cache; it may be inconsistent")
            .categorize(Kind::Integrity)?;
        fs::copy_tree(
            snapshot,
            self.master.root(),
            CopyFlags::builder().preserve_owner(true).build(),
        )
        .await
        .context("restore the master cache from snapshot; it may be inconsistent")
        .categorize(Kind::Integrity)?;
        fs::remove_dir_all(&displaced)
            .await
            .context("remove the displaced master cache")
            .categorize(Kind::Integrity)?;

        self.log.line("master cache rolled back from snapshot");
        Ok(())
    }
}
