//! Echo application: reflects requests back, for smoke tests.

use async_trait::async_trait;

use super::{Dispatch, Request, Response};
use crate::error::DispatchError;

#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl Dispatch for Echo {
    async fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        let content_type = request
            .header("content-type")
            .unwrap_or("text/plain")
            .to_string();
        Ok(Response::new(200, request.body)
            .with_header("content-type", content_type)
            .with_header("x-echo-method", request.method)
            .with_header("x-echo-path", request.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_body_and_route() {
        let response = Echo
            .dispatch(
                Request::get("/hello")
                    .with_method("POST")
                    .with_header("Content-Type", "application/json")
                    .with_body("{}"),
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "{}");
        assert_eq!(response.headers["content-type"], "application/json");
        assert_eq!(response.headers["x-echo-method"], "POST");
        assert_eq!(response.headers["x-echo-path"], "/hello");
    }
}
