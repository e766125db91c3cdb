//! `foreman`: the build orchestrator's HTTP surface.
//!
//! Serves authenticated build and deploy requests over the `forge` pipeline.
//! The service is stateless across restarts: the master cache regenerates on
//! demand and in-flight requests are not resumable.

use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use forge::{Settings, fs::Owner, sign::Signer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt,
};
use tracing_tree::time::Uptime;

mod api;
mod auth;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    /// Bind address.
    #[arg(long, env = "FOREMAN_LISTEN", default_value = "127.0.0.1:2017")]
    listen: String,

    /// Log sink: a file path, `stdout`, `stderr`, or empty to disable.
    #[arg(long, env = "FOREMAN_LOG", default_value = "foreman.log")]
    log_sink: String,

    /// Unprivileged uid (and gid) for child processes; -1 disables the drop.
    #[arg(long, env = "FOREMAN_BUILD_UID", default_value_t = -1)]
    build_uid: i64,

    /// Filesystem jail for child processes; unset to disable.
    #[arg(long, env = "FOREMAN_CHROOT_DIR")]
    chroot_dir: Option<Utf8PathBuf>,

    /// Basic auth client id.
    #[arg(long, env = "CLIENT_ID", hide_env_values = true)]
    client_id: Option<String>,

    /// Basic auth client key.
    #[arg(long, env = "CLIENT_KEY", hide_env_values = true)]
    client_key: Option<String>,

    /// Armored secret key for artifact signatures.
    #[arg(long, env = "FOREMAN_SIGNING_KEY_FILE", default_value = "signing_key.asc")]
    signing_key_file: Utf8PathBuf,

    /// Password for the signing key.
    #[arg(
        long,
        env = "FOREMAN_KEY_PASSWORD_FILE",
        default_value = "signing_key_password.txt"
    )]
    key_password_file: Utf8PathBuf,

    /// Compiler parallelism hint (`go build -p`).
    #[arg(long, env = "FOREMAN_PARALLEL_BUILD_OPS", default_value_t = 4)]
    parallel_build_ops: u32,

    /// Master package cache root; defaults to the toolchain's workspace.
    #[arg(long, env = "FOREMAN_MASTER_CACHE_ROOT")]
    master_cache_root: Option<Utf8PathBuf>,

    /// Import path of the Core package.
    #[arg(long, env = "FOREMAN_CORE_PACKAGE", default_value = "github.com/mholt/caddy")]
    core_package: String,

    /// Prefix for artifact names and the packaged binary.
    #[arg(long, env = "FOREMAN_CORE_PREFIX", default_value = "caddy")]
    core_prefix: String,
}

impl Config {
    fn build_owner(&self) -> Result<Option<Owner>> {
        match self.build_uid {
            -1 => Ok(None),
            uid if (0..=i64::from(u32::MAX)).contains(&uid) => Ok(Some(Owner {
                uid: uid as u32,
                gid: uid as u32,
            })),
            uid => bail!("build uid out of range: {uid}"),
        }
    }

    fn master_root(&self) -> Result<Utf8PathBuf> {
        if let Some(root) = &self.master_cache_root {
            return Ok(root.clone());
        }
        let home = home::home_dir()
            .context("determine the home directory for the default master cache")?;
        forge::fs::utf8(home.join("go")).context("master cache path as utf8")
    }

    fn settings(&self) -> Result<Settings> {
        // The reference Core keeps its shippable entry point in
        // `{core}/caddy` with the registration file one level deeper.
        let settings = Settings::builder()
            .master_root(self.master_root()?)
            .core_package(self.core_package.clone())
            .core_prefix(self.core_prefix.clone())
            .entry_package(format!("{}/caddy", self.core_package))
            .entry_source("caddy/caddymain/run.go")
            .stamp_import(format!("{}/caddy/caddymain", self.core_package))
            .maybe_build_owner(self.build_owner()?)
            .maybe_chroot(self.chroot_dir.clone())
            .parallel_build_ops(self.parallel_build_ops)
            .build();
        Ok(settings)
    }
}

fn init_tracing(sink: &str) -> Result<()> {
    let writer = match sink {
        "" => BoxMakeWriter::new(std::io::sink),
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        "stderr" => BoxMakeWriter::new(std::io::stderr),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log sink: {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
    };

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_tree::HierarchicalLayer::default()
                .with_indent_lines(true)
                .with_indent_amount(2)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_verbose_exit(false)
                .with_verbose_entry(false)
                .with_deferred_spans(true)
                .with_bracketed_fields(true)
                .with_span_retrace(true)
                .with_timer(Uptime::default())
                .with_writer(writer)
                .with_targets(false),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    color_eyre::install()?;
    init_tracing(&config.log_sink)?;

    let credentials = match (&config.client_id, &config.client_key) {
        (Some(id), Some(key)) => Some(auth::Credentials::new(id, key)),
        _ => {
            warn!("CLIENT_ID/CLIENT_KEY not configured; all requests will be rejected");
            None
        }
    };

    let signer = Signer::load(&config.signing_key_file, &config.key_password_file)
        .context("load signing key")?;
    if signer.is_none() {
        warn!("signing is disabled; build requests will fail");
    }

    let settings = Arc::new(config.settings()?);
    info!(
        master = %settings.master_root,
        core = %settings.core_package,
        uid = ?settings.build_owner,
        chroot = ?settings.chroot,
        "configured",
    );

    let app = Arc::new(api::App {
        settings,
        credentials,
        signer,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, api::router(app)).await?;

    Ok(())
}
