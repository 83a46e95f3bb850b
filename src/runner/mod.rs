//! Runner module: per-endpoint test orchestration and windowed batches.

mod reconcile;

pub use reconcile::*;

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{DbError, Endpoint, ErrorKind, Inventory, TestResult};
use crate::probe::{
    check_connectivity, measure_throughput, ConnectError, ConnectivityReport, ProbeSettings,
};

/// Pre-check message for endpoints that cannot be dialed at all.
pub const NO_PORT_ERROR: &str = "No SOCKS5 port configured";

/// Batch run error types.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("no testable endpoints found")]
    NoEndpoints,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Windowed batch runner over the endpoint inventory.
pub struct Runner {
    inventory: Arc<dyn Inventory>,
    settings: ProbeSettings,
    allow_deleted_targets: bool,
}

impl Runner {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        settings: ProbeSettings,
        allow_deleted_targets: bool,
    ) -> Self {
        Self {
            inventory,
            settings,
            allow_deleted_targets,
        }
    }

    /// Test the requested endpoints, one result per id in input order.
    pub async fn run_ids(
        &self,
        ids: &[i64],
        window_size: usize,
    ) -> Result<Vec<TestResult>, RunError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let found =
            self.inventory
                .list_testable_endpoints(Some(ids), None, !self.allow_deleted_targets)?;
        if found.is_empty() {
            return Err(RunError::NoEndpoints);
        }

        // One work item per requested id, duplicates included; an id with no
        // inventory row becomes a configuration-error result.
        let items: Vec<Item> = ids
            .iter()
            .map(|id| match found.iter().find(|e| e.id == *id) {
                Some(endpoint) => Item::Found(endpoint.clone()),
                None => Item::Missing(*id),
            })
            .collect();

        Ok(self.run_items(items, window_size).await)
    }

    /// Test every eligible endpoint, optionally capped.
    pub async fn run_all(
        &self,
        limit: Option<usize>,
        window_size: usize,
    ) -> Result<Vec<TestResult>, RunError> {
        let found = self.inventory.list_testable_endpoints(None, limit, true)?;
        if found.is_empty() {
            return Err(RunError::NoEndpoints);
        }

        let items = found.into_iter().map(Item::Found).collect();
        Ok(self.run_items(items, window_size).await)
    }

    async fn run_items(&self, items: Vec<Item>, window_size: usize) -> Vec<TestResult> {
        tracing::info!("Runner: testing {} endpoints", items.len());
        let settings = self.settings.clone();
        run_windows(items, window_size, move |item| {
            let settings = settings.clone();
            async move {
                match item {
                    Item::Found(endpoint) => test_endpoint(&endpoint, &settings).await,
                    Item::Missing(id) => missing_result(id),
                }
            }
        })
        .await
    }
}

/// One unit of work in a batch: an inventory row, or a requested id that
/// matched nothing.
#[derive(Debug, Clone)]
pub(crate) enum Item {
    Found(Endpoint),
    Missing(i64),
}

impl Item {
    fn meta(&self) -> RunMeta {
        match self {
            Item::Found(endpoint) => RunMeta {
                endpoint_id: endpoint.id,
                host: endpoint.host.clone(),
                port: endpoint.socks5_port,
            },
            Item::Missing(id) => RunMeta {
                endpoint_id: *id,
                host: String::new(),
                port: None,
            },
        }
    }
}

/// Identity captured before a test task is spawned, used when the task
/// itself is lost to a fault.
#[derive(Debug, Clone)]
pub(crate) struct RunMeta {
    endpoint_id: i64,
    host: String,
    port: Option<u16>,
}

/// Execute tests window by window.
///
/// Within a window every item runs as its own spawned task; the next window
/// starts only after the whole window is joined, so peak concurrency never
/// exceeds `window_size`. A task that dies is logged and reported as an
/// internal-error result without disturbing its siblings. Results come back
/// in item order, never completion order.
pub(crate) async fn run_windows<F, Fut>(
    items: Vec<Item>,
    window_size: usize,
    tester: F,
) -> Vec<TestResult>
where
    F: Fn(Item) -> Fut,
    Fut: std::future::Future<Output = TestResult> + Send + 'static,
{
    let window_size = window_size.max(1);
    let mut results = Vec::with_capacity(items.len());

    for window in items.chunks(window_size) {
        let metas: Vec<RunMeta> = window.iter().map(Item::meta).collect();
        let handles: Vec<_> = window
            .iter()
            .cloned()
            .map(|item| tokio::spawn(tester(item)))
            .collect();

        for (meta, joined) in metas.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        "Runner: test task for endpoint {} failed: {}",
                        meta.endpoint_id,
                        e
                    );
                    results.push(fault_result(&meta));
                }
            }
        }
    }

    results
}

/// Run the two-step test for one endpoint. Every failure mode is captured in
/// the returned result; this function never fails.
pub async fn test_endpoint(endpoint: &Endpoint, settings: &ProbeSettings) -> TestResult {
    let port = match endpoint.socks5_port {
        Some(p) => p,
        None => {
            let mut result = base_result(endpoint);
            result.error_kind = Some(ErrorKind::Config);
            result.error = Some(NO_PORT_ERROR.to_string());
            return result;
        }
    };

    let connectivity = check_connectivity(&endpoint.host, port, endpoint.auth(), settings).await;
    // Throughput is measured only once the endpoint proved reachable.
    let throughput = match &connectivity {
        Ok(_) => Some(measure_throughput(&endpoint.host, port, endpoint.auth(), settings).await),
        Err(_) => None,
    };

    probe_result(endpoint, connectivity, throughput)
}

fn base_result(endpoint: &Endpoint) -> TestResult {
    TestResult {
        endpoint_id: endpoint.id,
        host: endpoint.host.clone(),
        port: endpoint.socks5_port,
        reachable: false,
        latency_ms: None,
        throughput_kbps: None,
        external_ip: None,
        error_kind: None,
        error: None,
        tested_at: Utc::now(),
    }
}

/// Fold the probe outcomes into one result.
fn probe_result(
    endpoint: &Endpoint,
    connectivity: Result<ConnectivityReport, ConnectError>,
    throughput: Option<Result<i64, ConnectError>>,
) -> TestResult {
    let mut result = base_result(endpoint);

    match connectivity {
        Ok(report) => {
            result.reachable = true;
            result.latency_ms = Some(report.latency_ms);
            result.external_ip = Some(report.external_ip);
        }
        Err(e) => {
            tracing::info!("Runner: endpoint {} unreachable: {}", endpoint.host, e);
            result.error_kind = Some(e.kind());
            result.error = Some(e.to_string());
            return result;
        }
    }

    match throughput {
        Some(Ok(kbps)) => {
            result.throughput_kbps = Some(kbps);
        }
        Some(Err(e)) => {
            // Reachability stands; the measurement is simply absent.
            tracing::warn!(
                "Runner: throughput probe failed for {}: {}",
                endpoint.host,
                e
            );
            result.error_kind = Some(ErrorKind::Throughput);
            result.error = Some(e.to_string());
        }
        None => {}
    }

    result
}

fn missing_result(id: i64) -> TestResult {
    TestResult {
        endpoint_id: id,
        host: String::new(),
        port: None,
        reachable: false,
        latency_ms: None,
        throughput_kbps: None,
        external_ip: None,
        error_kind: Some(ErrorKind::Config),
        error: Some("Endpoint not found in inventory".to_string()),
        tested_at: Utc::now(),
    }
}

fn fault_result(meta: &RunMeta) -> TestResult {
    TestResult {
        endpoint_id: meta.endpoint_id,
        host: meta.host.clone(),
        port: meta.port,
        reachable: false,
        latency_ms: None,
        throughput_kbps: None,
        external_ip: None,
        error_kind: Some(ErrorKind::Internal),
        error: Some("test task failed unexpectedly".to_string()),
        tested_at: Utc::now(),
    }
}
