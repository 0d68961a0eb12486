//! Static file serving for Files-kind services.

use crate::error::{full_body, GateBody};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Serve a file from `root` for the request path.
///
/// Directory requests fall back to their `index.html`. Anything that is not
/// GET or HEAD is rejected, and paths that try to climb out of the root 404.
pub async fn serve(root: &str, req: Request<Incoming>) -> Response<GateBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(full_body("Method not allowed"))
            .expect("valid response with StatusCode enum");
    }

    let Some(path) = resolve_path(root, req.uri().path()) else {
        return not_found();
    };

    let path = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.join("index.html"),
        Ok(_) => path,
        Err(_) => return not_found(),
    };

    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Static file read failed");
            return not_found();
        }
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let length = content.len();
    let body = if req.method() == Method::HEAD {
        full_body("")
    } else {
        full_body(content)
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, mime.as_ref())
        .header(hyper::header::CONTENT_LENGTH, length)
        .body(body)
        .expect("valid response with StatusCode enum")
}

fn not_found() -> Response<GateBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full_body("Not found"))
        .expect("valid response with StatusCode enum")
}

/// Map a URL path onto the served directory, refusing any component that
/// would escape it.
fn resolve_path(root: &str, url_path: &str) -> Option<PathBuf> {
    let relative = url_path.trim_start_matches('/');
    let relative = Path::new(relative);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(Path::new(root).join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path_stays_inside_root() {
        assert_eq!(
            resolve_path("/srv/www", "/a/b.html").unwrap(),
            PathBuf::from("/srv/www/a/b.html")
        );
        assert_eq!(
            resolve_path("/srv/www", "/").unwrap(),
            PathBuf::from("/srv/www")
        );
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        assert!(resolve_path("/srv/www", "/../etc/passwd").is_none());
        assert!(resolve_path("/srv/www", "/a/../../etc").is_none());
    }
}
