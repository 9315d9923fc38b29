mod deadline;
mod dns;
mod http;
mod prober;
mod ratelimit;
pub mod recovery;
mod report;
mod service;
mod store;
mod types;

pub use deadline::Deadline;
pub use prober::{check_all, worker_count, Probe, Prober};
pub use recovery::RecoveryError;
pub use report::Report;
pub use service::{LinkService, ResultSink, ServiceError};
pub use store::{FileStore, StoreError};
pub use types::{
    status_label, FanOutConfig, Link, ProbeConfig, ProbeError, QueueConfig, Set, AVAILABLE,
    NOT_AVAILABLE,
};

