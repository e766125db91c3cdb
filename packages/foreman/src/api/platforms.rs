//! Read-only platform catalog endpoint.

use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use camino::Utf8Path;
use forge::{Kind, log::BuildLog, platform::Platform};

use crate::{api::Failure, auth::Authenticated};

#[tracing::instrument(skip_all)]
pub async fn handle(_auth: Authenticated, State(app): State<crate::api::State>) -> Response {
    match catalog(&app).await {
        Ok(platforms) => Json(platforms).into_response(),
        Err(error) => Failure(error).into_response(),
    }
}

/// Ask the toolchain for the supported platform catalog.
///
/// The enumeration needs no sources, so it runs against the master
/// environment from a working directory guaranteed to exist.
pub async fn catalog(app: &crate::api::State) -> Result<Vec<Platform>, forge::Error> {
    let log = BuildLog::new();
    let exec = app.settings.executor();
    forge::platform::supported(
        &exec,
        &log,
        forge::exec::base_env(&app.settings.master_root),
        Utf8Path::new("/"),
    )
    .await
    .map_err(|report| forge::Error::logged(Kind::Internal, report, &log))
}
