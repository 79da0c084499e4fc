//! Static file application.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::{Dispatch, Request, Response};
use crate::error::{DispatchError, StartupFailure};

/// Serves files below a public directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    public_dir: PathBuf,
}

impl StaticFiles {
    /// Fails with `LoadError` when `public_dir` is not a directory.
    pub fn load(public_dir: &Path) -> Result<Self, StartupFailure> {
        if !public_dir.is_dir() {
            return Err(StartupFailure::load(format!(
                "public directory {} does not exist",
                public_dir.display()
            )));
        }
        Ok(Self {
            public_dir: public_dir.to_path_buf(),
        })
    }

    /// Map a request path to a file below the public directory. Returns
    /// `None` for paths that try to leave it.
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let path = request_path.split(['?', '#']).next().unwrap_or_default();
        let mut resolved = self.public_dir.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if path.is_empty() || path.ends_with('/') {
            resolved.push("index.html");
        }
        Some(resolved)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Dispatch for StaticFiles {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        if !matches!(request.method.as_str(), "GET" | "HEAD") {
            return Ok(Response::new(405, "method not allowed").with_header("allow", "GET, HEAD"));
        }

        let Some(path) = self.resolve(&request.path) else {
            return Ok(Response::new(403, "forbidden"));
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                // Bodies are text frames; binary content cannot be carried as-is.
                let text = String::from_utf8(bytes).map_err(|_| {
                    DispatchError::new(
                        "binary_content",
                        format!("{} is not valid UTF-8", request.path),
                    )
                })?;
                let length = text.len().to_string();
                let body = if request.method == "HEAD" {
                    String::new()
                } else {
                    text
                };
                Ok(Response::new(200, body)
                    .with_header("content-type", content_type(&path))
                    .with_header("content-length", length))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::IsADirectory
                ) =>
            {
                Ok(Response::new(404, "not found"))
            }
            Err(e) => Err(DispatchError::io(&e)),
        }
    }
}
