use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};

use crate::errors::Error;
use crate::session::Session;
use crate::sid::Sid;

/// Contract of the engine consumed by a server: a registry of live
/// sessions fed by the HTTP layer. `accept` yields each freshly opened
/// session exactly once; closing the engine makes `accept` fail.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Wait for the next session opened by a client.
    async fn accept(&self) -> Result<Arc<Session>, Error>;

    /// Remove a session from the registry once it is done being served.
    fn remove(&self, sid: Sid);

    /// Number of live sessions.
    fn count(&self) -> usize;

    /// Close the engine and every session it tracks.
    async fn close(&self);

    /// Public HTTP surface of the engine. Engines without one answer 501.
    async fn serve_http(&self, _req: Request<Bytes>) -> Response<Bytes> {
        Response::builder()
            .status(StatusCode::NOT_IMPLEMENTED)
            .body(Bytes::new())
            .unwrap()
    }
}
