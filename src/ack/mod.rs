//! Request/acknowledgement correlation
//!
//! Maps transaction ids of in-flight requests to their pending state and
//! wake signal.

mod tracker;

pub use tracker::{PendingRequest, RegisterError, RequestState, RequestTracker};
