//! Deploy endpoints: promote a Core or plugin version into the master cache.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use forge::{
    Error,
    buildenv::BuildEnv,
    platform::Platform,
    request::{DeployCoreRequest, DeployPluginRequest},
};
use tracing::{info, instrument};

use crate::{api::Failure, auth::Authenticated};

#[instrument(skip_all, fields(core_version = %request.core_version()))]
pub async fn core(
    _auth: Authenticated,
    State(app): State<crate::api::State>,
    Json(request): Json<DeployCoreRequest>,
) -> Response {
    match run_core(app, request).await {
        Ok(()) => {
            info!("deploy.core.succeeded");
            StatusCode::OK.into_response()
        }
        Err(error) => Failure(error).into_response(),
    }
}

async fn run_core(app: crate::api::State, request: DeployCoreRequest) -> Result<(), Error> {
    // A Core deploy must keep every supported platform buildable.
    let supported = super::platforms::catalog(&app).await?;
    let mut env = BuildEnv::open(app.settings.clone(), request.core_version(), vec![]).await?;
    let result = env.deploy(&supported).await;
    finish(env, result).await
}

#[instrument(skip_all, fields(plugin = %request.plugin_package, version = %request.plugin_version))]
pub async fn plugin(
    _auth: Authenticated,
    State(app): State<crate::api::State>,
    Json(request): Json<DeployPluginRequest>,
) -> Response {
    match run_plugin(app, request).await {
        Ok(()) => {
            info!("deploy.plugin.succeeded");
            StatusCode::OK.into_response()
        }
        Err(error) => Failure(error).into_response(),
    }
}

async fn run_plugin(app: crate::api::State, request: DeployPluginRequest) -> Result<(), Error> {
    if request.plugin_package.is_empty() {
        return Err(Error::validation("plugin_package is required"));
    }
    if request.plugin_version.is_empty() {
        return Err(Error::validation("plugin_version is required"));
    }
    let supported = super::platforms::catalog(&app).await?;
    let required = resolve_required(&request.required_platforms, &supported)?;

    let mut env = BuildEnv::open(
        app.settings.clone(),
        request.core_version(),
        vec![request.plugin()],
    )
    .await?;
    let result = env.deploy(&required).await;
    finish(env, result).await
}

/// Every requested platform must appear in the supported catalog; the
/// resolved entries carry the catalog's cgo flag.
fn resolve_required(
    requested: &[Platform],
    supported: &[Platform],
) -> Result<Vec<Platform>, Error> {
    requested
        .iter()
        .map(|platform| {
            platform
                .resolve(supported)
                .cloned()
                .ok_or_else(|| Error::validation(format!("unsupported platform: {platform}")))
        })
        .collect()
}

/// Close the workspace on every exit path, reporting the workflow error
/// first when both fail.
async fn finish(mut env: BuildEnv, result: Result<(), Error>) -> Result<(), Error> {
    let close = env.close().await;
    result?;
    close
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn platform(os: &str, arch: &str, arm: &str, cgo: bool) -> Platform {
        Platform {
            os: os.into(),
            arch: arch.into(),
            arm: arm.into(),
            cgo,
        }
    }

    #[test]
    fn required_platforms_resolve_against_the_catalog() {
        let supported = vec![
            platform("linux", "amd64", "", true),
            platform("linux", "arm", "7", true),
        ];
        let resolved = resolve_required(&[platform("linux", "arm", "7", false)], &supported)
            .expect("resolve known platform");
        assert_eq!(resolved, vec![platform("linux", "arm", "7", true)]);

        let error = resolve_required(&[platform("plan9", "386", "", false)], &supported)
            .expect_err("plan9 is not supported");
        assert_eq!(error.kind(), forge::Kind::Validation);
    }
}
