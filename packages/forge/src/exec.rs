//! Subprocess execution with an explicit environment and dropped privileges.
//!
//! Children inherit nothing: the environment is whitelisted per invocation,
//! stdout and stderr are merged into the build log, and when configured the
//! child runs under an unprivileged uid/gid inside a chroot jail.

use std::{ffi::CString, io, process::Stdio};

use bon::Builder;
use camino::Utf8PathBuf;
use color_eyre::{
    Result,
    eyre::{Context, OptionExt, bail},
};
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{instrument, trace};

use crate::{fs::Owner, log::BuildLog};

/// Environment variables passed through from the service to children when
/// present, in addition to the workspace path variable.
const PASSTHROUGH: &[&str] = &["PATH", "TMPDIR"];

/// The whitelisted base environment for toolchain children.
///
/// `gopath` is either `"{workspace}:{master}"` (workspace first, so lookups
/// prefer pinned sources) or the master root alone for master-only
/// operations.
pub fn base_env(gopath: impl AsRef<str>) -> Vec<(String, String)> {
    let mut env = vec![(String::from("GOPATH"), gopath.as_ref().to_string())];
    for key in PASSTHROUGH {
        if let Ok(value) = std::env::var(key) {
            env.push((key.to_string(), value));
        }
    }
    env
}

/// One subprocess invocation: program, arguments, working directory, and the
/// exact environment the child sees.
#[derive(Clone, Debug, Builder)]
pub struct Invocation {
    #[builder(into)]
    pub program: String,

    #[builder(default)]
    pub args: Vec<String>,

    #[builder(into)]
    pub workdir: Utf8PathBuf,

    #[builder(default)]
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// The command line as logged to the build log.
    fn render(&self) -> String {
        let mut line = format!("$ cd {} && {}", self.workdir, self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Spawns children with privileges dropped to the configured uid/gid inside
/// an optional chroot jail.
#[derive(Clone, Debug, Default)]
pub struct Executor {
    owner: Option<Owner>,
    chroot: Option<Utf8PathBuf>,
}

impl Executor {
    pub fn new(owner: Option<Owner>, chroot: Option<Utf8PathBuf>) -> Self {
        Self { owner, chroot }
    }

    /// Run the invocation to completion, streaming all output to `log`.
    #[instrument(skip(self, log), fields(program = %invocation.program))]
    pub async fn run(&self, log: &BuildLog, invocation: Invocation) -> Result<()> {
        self.capture(log, invocation).await.map(drop)
    }

    /// Run the invocation and additionally return its captured stdout.
    ///
    /// Stdout still lands in `log` alongside stderr, so failures carry the
    /// full transcript either way.
    #[instrument(skip(self, log), fields(program = %invocation.program))]
    pub async fn output(&self, log: &BuildLog, invocation: Invocation) -> Result<String> {
        let stdout = self.capture(log, invocation).await?;
        String::from_utf8(stdout).context("decode child stdout")
    }

    async fn capture(&self, log: &BuildLog, invocation: Invocation) -> Result<Vec<u8>> {
        let line = invocation.render();
        log.line(&line);
        trace!(command = %line, "spawning child");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        // Inside a jail the configured workdir is meaningless; "/" is the
        // only directory guaranteed to exist.
        let jail = match &self.chroot {
            Some(root) => Some(CString::new(root.as_str()).context("chroot path contains NUL")?),
            None => {
                cmd.current_dir(&invocation.workdir);
                None
            }
        };

        // Jail entry and the privilege drop must share one child-side hook:
        // chroot needs the privileges that setuid gives up, so the ordering
        // is session, then jail, then gid, then uid.
        let owner = self.owner;
        if owner.is_some() || jail.is_some() {
            unsafe {
                cmd.pre_exec(move || {
                    if owner.is_some() && libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    if let Some(root) = &jail {
                        enter_jail(root)?;
                    }
                    if let Some(owner) = owner {
                        if libc::setgid(owner.gid) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                        if libc::setuid(owner.uid) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", invocation.program))?;
        let stdout = child.stdout.take().ok_or_eyre("child stdout not piped")?;
        let stderr = child.stderr.take().ok_or_eyre("child stderr not piped")?;

        let (captured, _, status) = tokio::join!(
            pump(stdout, log.clone(), true),
            pump(stderr, log.clone(), false),
            child.wait(),
        );
        let status = status.context("wait for child")?;

        if status.success() {
            Ok(captured)
        } else {
            log.line(format!("command failed: {status}"));
            bail!("{line} failed: {status}");
        }
    }
}

/// Drain one child pipe into the log, optionally keeping a copy.
async fn pump(
    mut reader: impl tokio::io::AsyncRead + Unpin,
    log: BuildLog,
    keep: bool,
) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                log.append(&chunk[..n]);
                if keep {
                    captured.extend_from_slice(&chunk[..n]);
                }
            }
            Err(err) => {
                log.line(format!("error reading child output: {err}"));
                break;
            }
        }
    }
    captured
}

/// Child-side jail entry: change root, then force the working directory to
/// the new root.
fn enter_jail(root: &CString) -> io::Result<()> {
    if unsafe { libc::chroot(root.as_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
