#![forbid(unsafe_code)]

use anyhow::Result;
use askdb_domain::{Request, RequestId, Trace};

/// Durable, write-once storage for request traces.
pub trait TraceStore {
    /// Prepare the storage location. Safe to call more than once.
    #[allow(clippy::missing_errors_doc)]
    fn init(&self) -> Result<()>;

    /// Serialize the request's full step log. Each request is written exactly once.
    #[allow(clippy::missing_errors_doc)]
    fn persist(&self, request: &Request) -> Result<Trace>;

    #[allow(clippy::missing_errors_doc)]
    fn retrieve(&self, request_id: RequestId) -> Result<Option<Trace>>;

    /// The stored bytes, unparsed.
    #[allow(clippy::missing_errors_doc)]
    fn retrieve_raw(&self, request_id: RequestId) -> Result<Option<String>>;

    #[allow(clippy::missing_errors_doc)]
    fn list(&self) -> Result<Vec<RequestId>>;
}
