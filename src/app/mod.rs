//! The application seen from the worker: a single dispatch capability.
//!
//! The framework behind it is opaque. `load` turns an `AppManifest` into a
//! `Dispatch` implementation by matching on its `FrameworkKind`.

pub mod command;
pub mod echo;
pub mod manifest;
pub mod static_files;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, StartupFailure};

pub use command::CommandApp;
pub use echo::Echo;
pub use manifest::{AppManifest, FrameworkKind, MANIFEST_FILE};
pub use static_files::StaticFiles;

/// An inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-assigned id, honoured under `RequestIdPolicy::SharedAcrossRetries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// 1-based attempt number when the caller retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            id: None,
            attempt: None,
            method: default_method(),
            path: path.into(),
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The application's answer, relayed to the client unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Hands one request to an application and returns its response.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError>;
}

#[async_trait]
impl<T: Dispatch + ?Sized> Dispatch for Arc<T> {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        (**self).dispatch(request).await
    }
}

#[async_trait]
impl<T: Dispatch + ?Sized> Dispatch for Box<T> {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        (**self).dispatch(request).await
    }
}

/// Build the application described by `manifest`.
pub fn load(manifest: &AppManifest) -> Result<Arc<dyn Dispatch>, StartupFailure> {
    let app: Arc<dyn Dispatch> = match &manifest.framework {
        FrameworkKind::Static { public_dir } => {
            Arc::new(StaticFiles::load(&manifest.root.join(public_dir))?)
        }
        FrameworkKind::Echo => Arc::new(Echo),
        FrameworkKind::Command {
            program,
            args,
            timeout_ms,
        } => Arc::new(CommandApp::load(
            &manifest.root,
            program,
            args.clone(),
            std::time::Duration::from_millis(*timeout_ms),
        )?),
    };
    tracing::info!(
        framework = manifest.framework.name(),
        root = %manifest.root.display(),
        "Application loaded"
    );
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_when_deserializing() {
        let request: Request = serde_json::from_str(r#"{"path":"/"}"#).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.headers.is_empty());
        assert!(request.id.is_none());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let request = Request::get("/").with_header("X-Request-Start", "t=1");
        assert_eq!(request.header("x-request-start"), Some("t=1"));
        assert_eq!(request.header("X-REQUEST-START"), Some("t=1"));
    }

    #[tokio::test]
    async fn arc_dispatch_forwards() {
        let app: Arc<dyn Dispatch> = Arc::new(Echo);
        let response = app
            .dispatch(Request::get("/x").with_body("hi"))
            .await
            .unwrap();
        assert_eq!(response.body, "hi");
    }
}
