pub mod context;
pub mod handler;
pub mod headers;

pub use context::{BoxBody, RequestContext};
pub use handler::handle_request;

use context::full_body;
use hyper::Response;

/// The seam to the host application: allowed requests are handed here, and
/// whatever this returns (plus the rate-limit headers) goes back to the
/// client. The service never transforms success payloads.
pub trait HostHandler: Send + Sync + 'static {
    fn respond(&self, ctx: &RequestContext) -> Response<BoxBody>;
}

/// Bundled demo handler: echoes method and path as JSON. Real deployments
/// register their own `HostHandler` at bootstrap.
pub struct EchoHandler;

impl HostHandler for EchoHandler {
    fn respond(&self, ctx: &RequestContext) -> Response<BoxBody> {
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(format!(
                r#"{{"status":"ok","method":"{}","path":"{}"}}"#,
                ctx.method, ctx.path
            )))
            .unwrap()
    }
}
