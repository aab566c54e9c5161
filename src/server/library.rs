//! `/library`: browse, fetch, and delete books kept on disk.

use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::AppState;
use super::ws::session_cookie;
use crate::tracker::filename::is_temporary_name;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LibraryEntry {
    name: String,
    download_link: String,
    time: DateTime<Utc>,
}

/// Only browsers holding a well-formed session cookie may touch the library.
pub(super) async fn require_user(request: Request, next: Next) -> Response {
    let authorized = session_cookie(request.headers())
        .is_some_and(|token| Uuid::parse_str(&token).is_ok());
    if authorized {
        next.run(request).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Lists persisted books, newest first. 404 unless downloads are persisted.
pub(super) async fn list_books(State(state): State<AppState>) -> Response {
    if !state.config.persist {
        return StatusCode::NOT_FOUND.into_response();
    }

    let books_dir = state.config.books_dir();
    let files = match state.probe.list_files(&books_dir).await {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, books_dir = %books_dir.display(), "unable to list books");
            Vec::new()
        }
    };

    let mut entries: Vec<LibraryEntry> = files
        .into_iter()
        .filter(|f| !is_temporary_name(&f.name))
        .map(|f| LibraryEntry {
            download_link: format!("library/{}", f.name),
            name: f.name,
            time: f.modified.into(),
        })
        .collect();
    entries.sort_by(|a, b| b.time.cmp(&a.time));

    Json(entries).into_response()
}

/// Rejects anything that could escape the books directory.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

/// Serves a book as an attachment, deleting it afterwards unless persisted.
pub(super) async fn get_book(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    if !valid_name(&file) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let path = state.config.books_dir().join(&file);

    let bytes = match state.probe.read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => {
            warn!(error = %e, path = %path.display(), "unable to read book");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if !state.config.persist {
        if let Err(e) = state.probe.remove(&path).await {
            warn!(error = %e, path = %path.display(), "error deleting served book");
        }
    }

    let disposition = format!("attachment; filename=\"{}\"", file.replace('"', "'"));
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

pub(super) async fn delete_book(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> StatusCode {
    if !valid_name(&file) {
        return StatusCode::BAD_REQUEST;
    }
    let path = state.config.books_dir().join(&file);
    match state.probe.remove(&path).await {
        Ok(()) => StatusCode::OK,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "error deleting book");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name_rejects_traversal() {
        assert!(valid_name("Dune.epub"));
        assert!(valid_name("Dune - Frank Herbert.epub"));
        assert!(!valid_name(""));
        assert!(!valid_name("../secret"));
        assert!(!valid_name("a/b.epub"));
        assert!(!valid_name("a\\b.epub"));
        assert!(!valid_name(".."));
        assert!(!valid_name("."));
    }

    #[test]
    fn test_valid_name_allows_dots_inside_a_name() {
        assert!(valid_name("Vol..2.epub"));
        assert!(valid_name("...And Justice.epub"));
        assert!(valid_name("Dune..epub"));
    }
}
