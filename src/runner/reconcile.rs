//! Result reconciliation: audit append plus endpoint status updates.

use std::sync::Arc;

use crate::db::{Audit, EndpointStatus, ErrorKind, Inventory, StatusUpdate, TestResult};

/// Aggregate outcome of a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub persisted: usize,
    pub status_updates: usize,
}

/// Writes test outcomes to the audit log and folds them into endpoint status.
pub struct Reconciler {
    inventory: Arc<dyn Inventory>,
    audit: Arc<dyn Audit>,
}

impl Reconciler {
    pub fn new(inventory: Arc<dyn Inventory>, audit: Arc<dyn Audit>) -> Self {
        Self { inventory, audit }
    }

    /// Persist every result. Write failures are logged per item and surface
    /// only as shortfalls in the returned counts.
    pub fn reconcile(&self, results: &[TestResult]) -> ReconcileSummary {
        let mut summary = ReconcileSummary {
            persisted: 0,
            status_updates: 0,
        };

        for result in results {
            match self.audit.append_test_result(result) {
                Ok(()) => summary.persisted += 1,
                Err(e) => {
                    tracing::error!(
                        "Reconciler: failed to record result for endpoint {}: {}",
                        result.endpoint_id,
                        e
                    );
                }
            }

            // Never-attempted endpoints keep their stored status.
            if result.error_kind == Some(ErrorKind::Config) {
                continue;
            }

            let update = if result.reachable {
                StatusUpdate {
                    endpoint_id: result.endpoint_id,
                    status: EndpointStatus::Active,
                    last_ip: result.external_ip.clone(),
                    last_latency_ms: result.latency_ms,
                    last_throughput_kbps: result.throughput_kbps,
                    tested_at: result.tested_at,
                }
            } else {
                StatusUpdate {
                    endpoint_id: result.endpoint_id,
                    status: EndpointStatus::Unreachable,
                    last_ip: None,
                    last_latency_ms: None,
                    last_throughput_kbps: None,
                    tested_at: result.tested_at,
                }
            };

            match self.inventory.update_endpoint_status(&update) {
                Ok(()) => summary.status_updates += 1,
                Err(e) => {
                    tracing::error!(
                        "Reconciler: failed to update status for endpoint {}: {}",
                        result.endpoint_id,
                        e
                    );
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbError, Endpoint, Store};
    use crate::runner::NO_PORT_ERROR;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct RecordingInventory {
        updates: Mutex<Vec<StatusUpdate>>,
        fail_for: Option<i64>,
    }

    impl RecordingInventory {
        fn new(fail_for: Option<i64>) -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    impl Inventory for RecordingInventory {
        fn list_testable_endpoints(
            &self,
            _ids: Option<&[i64]>,
            _limit: Option<usize>,
            _exclude_deleted: bool,
        ) -> Result<Vec<Endpoint>, DbError> {
            Ok(Vec::new())
        }

        fn update_endpoint_status(&self, update: &StatusUpdate) -> Result<(), DbError> {
            if self.fail_for == Some(update.endpoint_id) {
                return Err(DbError::NotFound);
            }
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    struct RecordingAudit {
        rows: Mutex<Vec<TestResult>>,
        fail_for: Option<i64>,
    }

    impl RecordingAudit {
        fn new(fail_for: Option<i64>) -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                fail_for,
            }
        }
    }

    impl Audit for RecordingAudit {
        fn append_test_result(&self, result: &TestResult) -> Result<(), DbError> {
            if self.fail_for == Some(result.endpoint_id) {
                return Err(DbError::NotFound);
            }
            self.rows.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn reachable_result(id: i64) -> TestResult {
        TestResult {
            endpoint_id: id,
            host: "a.example.com".to_string(),
            port: Some(1080),
            reachable: true,
            latency_ms: Some(45),
            throughput_kbps: Some(812),
            external_ip: Some("203.0.113.9".to_string()),
            error_kind: None,
            error: None,
            tested_at: Utc::now(),
        }
    }

    fn unreachable_result(id: i64) -> TestResult {
        TestResult {
            reachable: false,
            latency_ms: None,
            throughput_kbps: None,
            external_ip: None,
            error_kind: Some(ErrorKind::Timeout),
            error: Some("timeout after 30s".to_string()),
            ..reachable_result(id)
        }
    }

    fn config_result(id: i64) -> TestResult {
        TestResult {
            port: None,
            reachable: false,
            latency_ms: None,
            throughput_kbps: None,
            external_ip: None,
            error_kind: Some(ErrorKind::Config),
            error: Some(NO_PORT_ERROR.to_string()),
            ..reachable_result(id)
        }
    }

    fn throughput_failed_result(id: i64) -> TestResult {
        TestResult {
            throughput_kbps: None,
            error_kind: Some(ErrorKind::Throughput),
            error: Some("timeout after 20s".to_string()),
            ..reachable_result(id)
        }
    }

    #[test]
    fn test_update_branches_and_counts() {
        let inventory = Arc::new(RecordingInventory::new(None));
        let audit = Arc::new(RecordingAudit::new(None));
        let reconciler = Reconciler::new(inventory.clone(), audit.clone());

        let summary = reconciler.reconcile(&[
            reachable_result(1),
            unreachable_result(2),
            config_result(3),
        ]);
        assert_eq!(
            summary,
            ReconcileSummary {
                persisted: 3,
                status_updates: 2,
            }
        );

        // Every outcome lands in the audit log, never-attempted ones included.
        assert_eq!(audit.rows.lock().unwrap().len(), 3);

        let updates = inventory.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status, EndpointStatus::Active);
        assert_eq!(updates[0].last_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(updates[0].last_latency_ms, Some(45));
        assert_eq!(updates[0].last_throughput_kbps, Some(812));
        assert_eq!(updates[1].status, EndpointStatus::Unreachable);
        assert!(updates[1].last_ip.is_none());
        assert!(updates[1].last_latency_ms.is_none());
    }

    #[test]
    fn test_per_item_failure_isolation() {
        let inventory = Arc::new(RecordingInventory::new(Some(1)));
        let audit = Arc::new(RecordingAudit::new(Some(2)));
        let reconciler = Reconciler::new(inventory.clone(), audit.clone());

        let summary = reconciler.reconcile(&[
            reachable_result(1),
            unreachable_result(2),
            reachable_result(3),
        ]);

        // One failed write never stops the loop; it just lowers the count.
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.status_updates, 2);
        assert_eq!(audit.rows.lock().unwrap().len(), 2);

        let updates = inventory.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].endpoint_id, 2);
        assert_eq!(updates[1].endpoint_id, 3);
    }

    #[test]
    fn test_reconcile_against_store() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        let mut tested = Endpoint {
            host: "a.example.com".to_string(),
            socks5_port: Some(1080),
            ..Default::default()
        };
        let mut portless = Endpoint {
            host: "b.example.com".to_string(),
            ..Default::default()
        };
        let a = store.add_endpoint(&mut tested).unwrap();
        let b = store.add_endpoint(&mut portless).unwrap();

        let reconciler = Reconciler::new(store.clone(), store.clone());

        let summary = reconciler.reconcile(&[reachable_result(a), config_result(b)]);
        assert_eq!(
            summary,
            ReconcileSummary {
                persisted: 2,
                status_updates: 1,
            }
        );

        let refreshed = store.get_endpoint(a).unwrap();
        assert_eq!(refreshed.status, EndpointStatus::Active);
        assert_eq!(refreshed.last_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(refreshed.last_latency_ms, Some(45));
        assert_eq!(refreshed.last_throughput_kbps, Some(812));
        assert!(refreshed.last_tested_at.is_some());

        // The never-attempted endpoint is indistinguishable from before.
        let untouched = store.get_endpoint(b).unwrap();
        assert_eq!(untouched.status, EndpointStatus::Unknown);
        assert!(untouched.last_tested_at.is_none());
        assert_eq!(store.recent_test_results(b, 10).unwrap().len(), 1);

        // A later unreachable run flips status but keeps the measurements.
        let summary = reconciler.reconcile(&[unreachable_result(a)]);
        assert_eq!(summary.status_updates, 1);
        let refreshed = store.get_endpoint(a).unwrap();
        assert_eq!(refreshed.status, EndpointStatus::Unreachable);
        assert_eq!(refreshed.last_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(refreshed.last_latency_ms, Some(45));
        assert_eq!(refreshed.last_throughput_kbps, Some(812));
    }

    #[test]
    fn test_failed_throughput_still_reconciles_to_active() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut endpoint = Endpoint {
            host: "a.example.com".to_string(),
            socks5_port: Some(1080),
            ..Default::default()
        };
        let id = store.add_endpoint(&mut endpoint).unwrap();
        let reconciler = Reconciler::new(store.clone(), store.clone());

        // Seed a full measurement set, then a run whose throughput probe failed.
        reconciler.reconcile(&[reachable_result(id)]);
        let summary = reconciler.reconcile(&[throughput_failed_result(id)]);
        assert_eq!(
            summary,
            ReconcileSummary {
                persisted: 1,
                status_updates: 1,
            }
        );

        let refreshed = store.get_endpoint(id).unwrap();
        assert_eq!(refreshed.status, EndpointStatus::Active);
        assert_eq!(refreshed.last_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(refreshed.last_latency_ms, Some(45));
        // A reachable run with no throughput figure clears the stored one.
        assert_eq!(refreshed.last_throughput_kbps, None);
        assert_eq!(store.recent_test_results(id, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_identical_reruns_are_idempotent() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mut endpoint = Endpoint {
            host: "a.example.com".to_string(),
            socks5_port: Some(1080),
            ..Default::default()
        };
        let id = store.add_endpoint(&mut endpoint).unwrap();
        let reconciler = Reconciler::new(store.clone(), store.clone());

        let result = reachable_result(id);
        reconciler.reconcile(&[result.clone()]);
        let first = store.get_endpoint(id).unwrap();
        reconciler.reconcile(&[result.clone()]);
        let second = store.get_endpoint(id).unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.last_ip, second.last_ip);
        assert_eq!(first.last_latency_ms, second.last_latency_ms);
        assert_eq!(first.last_throughput_kbps, second.last_throughput_kbps);
    }
}
