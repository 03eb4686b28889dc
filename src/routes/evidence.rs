use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::utils::image::ImageKind;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub sig: String,
}

/// Serves a stored evidence file behind a signed, expiring link.
#[axum::debug_handler]
pub async fn serve_evidence(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
) -> Result<Response> {
    if !state.blobs.verify(&key, q.expires, &q.sig) {
        tracing::warn!(key = %key, "rejected evidence link");
        return Err(Error::Forbidden("Invalid or expired evidence link".to_string()));
    }
    let bytes = state.blobs.get(&key).await?;
    let mime = ImageKind::sniff(&bytes)
        .map(|k| k.mime())
        .unwrap_or("application/octet-stream");
    Ok((
        [
            (header::CONTENT_TYPE, mime),
            (header::CACHE_CONTROL, "private, max-age=300"),
        ],
        bytes,
    )
        .into_response())
}
