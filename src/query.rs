//! Similarity queries: requests, cancellation, per-segment fan-out, and the
//! merge of ranked results.

pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod merge;
pub mod request;
pub mod response;

pub use cancel::CancelToken;
pub use config::QueryConfig;
pub use coordinator::{QueryCoordinator, SearchScope};
pub use request::{Consistency, Include, QueryRequest};
pub use response::{QueryHit, QueryResponse};
