//! Database module for ProxyGauge.
//!
//! SQLite storage for the endpoint inventory and the append-only test audit
//! log, plus the collaborator traits the runner and reconciler depend on.

mod models;
mod store;

pub use models::*;
pub use store::*;

/// Read/write access to the endpoint inventory.
pub trait Inventory: Send + Sync {
    /// Fetch endpoints for a run.
    ///
    /// With `ids` the matching rows are returned whether or not a SOCKS5 port
    /// is configured, so a misconfigured endpoint still produces a result;
    /// `exclude_deleted` drops soft-deleted rows. Without `ids` only live
    /// rows with a configured port are returned, capped by `limit`.
    fn list_testable_endpoints(
        &self,
        ids: Option<&[i64]>,
        limit: Option<usize>,
        exclude_deleted: bool,
    ) -> Result<Vec<Endpoint>, DbError>;

    /// Apply a status update produced by a completed test.
    fn update_endpoint_status(&self, update: &StatusUpdate) -> Result<(), DbError>;
}

/// Append-only audit log of test outcomes.
pub trait Audit: Send + Sync {
    fn append_test_result(&self, result: &TestResult) -> Result<(), DbError>;
}
