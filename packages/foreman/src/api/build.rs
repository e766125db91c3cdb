//! Build endpoint: compile, sign, and stream an artifact.
//!
//! The response is `multipart/form-data` with two parts in order: the
//! detached signature and the archive bytes. The archive is streamed from an
//! open file handle, so the workspace can be torn down before the body
//! finishes sending.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use color_eyre::eyre::{Context, eyre};
use forge::{
    Error, Kind,
    buildenv::BuildEnv,
    error::Categorize,
    request::BuildRequest,
};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{api::Failure, auth::Authenticated};

#[instrument(skip_all, fields(fingerprint = %request.fingerprint()))]
pub async fn handle(
    _auth: Authenticated,
    State(app): State<crate::api::State>,
    Json(request): Json<BuildRequest>,
) -> Response {
    info!("build.requested");
    match run(app, request).await {
        Ok(response) => response,
        Err(error) => Failure(error).into_response(),
    }
}

async fn run(app: crate::api::State, request: BuildRequest) -> Result<Response, Error> {
    if request.os.is_empty() || request.arch.is_empty() {
        return Err(Error::validation("os and arch are required"));
    }
    if app.signer.is_none() {
        return Err(Error::internal(eyre!("signing key not configured")));
    }

    let supported = super::platforms::catalog(&app).await?;
    let platform = request
        .platform()
        .resolve(&supported)
        .cloned()
        .ok_or_else(|| Error::validation(format!("unsupported platform: {}", request.platform())))?;

    let mut env = BuildEnv::open(
        app.settings.clone(),
        request.core_version(),
        request.plugins.clone(),
    )
    .await?;

    let result = build_response(&app, &mut env, &platform).await;
    // The archive is held open by the response body; the workspace tree can
    // go away regardless of the outcome.
    if let Err(error) = env.close().await {
        warn!(message = %error.message(), "could not close workspace");
    }
    result
}

async fn build_response(
    app: &crate::api::State,
    env: &mut BuildEnv,
    platform: &forge::platform::Platform,
) -> Result<Response, Error> {
    let out_dir = env.out_dir();
    let artifact = env.build(platform, &out_dir).await?;

    let signature = {
        let app = app.clone();
        let path = artifact.path.clone();
        tokio::task::spawn_blocking(move || -> color_eyre::Result<Vec<u8>> {
            let file = std::fs::File::open(path.as_std_path()).context("open artifact")?;
            match &app.signer {
                Some(signer) => signer.sign(file),
                None => Err(eyre!("signing key not configured")),
            }
        })
        .await
        .context("join task")
        .categorize(Kind::Internal)?
        .context("sign artifact")
        .categorize(Kind::Internal)?
    };

    let archive = tokio::fs::File::open(artifact.path.as_std_path())
        .await
        .context("open artifact for streaming")
        .categorize(Kind::Internal)?;

    info!(filename = %artifact.filename, "build.succeeded");
    multipart_response(&artifact.filename, signature, archive).categorize(Kind::Internal)
}

/// Assemble the two-part multipart body: signature first, archive second,
/// both carrying the generated filename.
fn multipart_response(
    filename: &str,
    signature: Vec<u8>,
    archive: tokio::fs::File,
) -> color_eyre::Result<Response> {
    let boundary = format!("forge{}", Uuid::new_v4().simple());
    let head = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"signature\"; filename=\"{filename}\"\r\n\
         Content-Type: application/pgp-signature\r\n\r\n",
    );
    let mid = format!(
        "\r\n--{boundary}\r\n\
         Content-Disposition: form-data; name=\"archive\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n",
    );
    let tail = format!("\r\n--{boundary}--\r\n");

    let prologue = futures::stream::iter(
        [head.into_bytes(), signature, mid.into_bytes()]
            .map(|part| Ok::<_, std::io::Error>(Bytes::from(part))),
    );
    let epilogue = futures::stream::iter([Ok(Bytes::from(tail.into_bytes()))]);
    let body = prologue.chain(ReaderStream::new(archive)).chain(epilogue);

    Response::builder()
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from_stream(body))
        .context("assemble response")
}
