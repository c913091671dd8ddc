use std::path::{Path, PathBuf};

use bytes::Bytes;
use hyper::StatusCode;

use crate::response::Response;

/// Extension to MIME type inference for the static content tree.
fn mime_of(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "css" => "text/css",
        "js" => "application/javascript",
        "html" | "htm" => "text/html",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Serve one file of a static tree. `rel_segments` are the normalized path
/// segments below the mount point; escaping segments were rejected by the
/// router before this point is reached.
pub(crate) async fn serve(root: &Path, rel_segments: &str, request_path: &str) -> Response {
    let mut path = PathBuf::from(root);
    for seg in rel_segments.split('/').filter(|s| !s.is_empty()) {
        // Normalization happened upstream; a leftover dot segment means a
        // logic error, refuse rather than resolve.
        if seg == ".." || seg == "." {
            return Response::error_html(StatusCode::FORBIDDEN, "path escapes the static root");
        }
        path.push(seg);
    }

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        Err(_) => return Response::error_html(StatusCode::NOT_FOUND, "no such file"),
    };

    if metadata.is_dir() {
        if !request_path.ends_with('/') {
            return Response::new(StatusCode::MOVED_PERMANENTLY)
                .with_header("Location", &format!("{request_path}/"));
        }
        path.push("index.html");
    }

    match tokio::fs::read(&path).await {
        Ok(content) => Response::text(StatusCode::OK, Bytes::from(content), mime_of(&path)),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Response::error_html(StatusCode::FORBIDDEN, "access denied")
        }
        Err(_) => Response::error_html(StatusCode::NOT_FOUND, "no such file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_inference() {
        assert_eq!(mime_of(Path::new("style.css")), "text/css");
        assert_eq!(mime_of(Path::new("app.JS")), "application/javascript");
        assert_eq!(mime_of(Path::new("index.html")), "text/html");
        assert_eq!(mime_of(Path::new("page.htm")), "text/html");
        assert_eq!(mime_of(Path::new("a.gif")), "image/gif");
        assert_eq!(mime_of(Path::new("b.jpeg")), "image/jpeg");
        assert_eq!(mime_of(Path::new("c.png")), "image/png");
        assert_eq!(mime_of(Path::new("data.bin")), "application/octet-stream");
    }
}
