//! SQLite store backing the endpoint inventory and the test audit log.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;
use super::{Audit, Inventory};

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with the embedded schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Endpoints ---

    /// Add a new endpoint and return its ID.
    pub fn add_endpoint(&self, endpoint: &mut Endpoint) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO endpoints (name, host, socks5_port, username, password, status, deleted) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                endpoint.name,
                endpoint.host,
                endpoint.socks5_port,
                endpoint.username,
                endpoint.password,
                endpoint.status.as_str(),
                endpoint.deleted,
            ],
        )?;
        let id = conn.last_insert_rowid();
        endpoint.id = id;
        Ok(id)
    }

    /// Get an endpoint by ID.
    pub fn get_endpoint(&self, id: i64) -> Result<Endpoint, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, name, host, socks5_port, username, password, status, last_ip, last_latency_ms, last_throughput_kbps, last_tested_at, deleted FROM endpoints WHERE id = ?1",
            params![id],
            map_endpoint_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
            other => DbError::Sqlite(other),
        })
    }

    // --- Audit log ---

    /// Recent audit rows for an endpoint, newest first.
    pub fn recent_test_results(
        &self,
        endpoint_id: i64,
        limit: i64,
    ) -> Result<Vec<TestResult>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT endpoint_id, host, port, reachable, latency_ms, throughput_kbps, external_ip, error_kind, error_message, tested_at
             FROM test_results WHERE endpoint_id = ?1 ORDER BY tested_at DESC LIMIT ?2",
        )?;

        let results = stmt
            .query_map(params![endpoint_id, limit], |row| {
                let kind: Option<String> = row.get(7)?;
                let tested_at: String = row.get(9)?;
                Ok(TestResult {
                    endpoint_id: row.get(0)?,
                    host: row.get(1)?,
                    port: row.get(2)?,
                    reachable: row.get(3)?,
                    latency_ms: row.get(4)?,
                    throughput_kbps: row.get(5)?,
                    external_ip: row.get(6)?,
                    error_kind: kind.as_deref().and_then(ErrorKind::parse),
                    error: row.get(8)?,
                    tested_at: parse_db_time(&tested_at).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(results)
    }
}

impl Inventory for Store {
    fn list_testable_endpoints(
        &self,
        ids: Option<&[i64]>,
        limit: Option<usize>,
        exclude_deleted: bool,
    ) -> Result<Vec<Endpoint>, DbError> {
        match ids {
            Some(ids) => {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                // Targeted lookups keep portless rows so the tester can report
                // them as never attempted.
                let placeholders = vec!["?"; ids.len()].join(", ");
                let mut sql = format!(
                    "SELECT id, name, host, socks5_port, username, password, status, last_ip, last_latency_ms, last_throughput_kbps, last_tested_at, deleted FROM endpoints WHERE id IN ({})",
                    placeholders
                );
                if exclude_deleted {
                    sql.push_str(" AND deleted = 0");
                }
                let conn = self.conn.lock().unwrap();
                let mut stmt = conn.prepare(&sql)?;
                let endpoints = stmt
                    .query_map(params_from_iter(ids.iter()), map_endpoint_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(endpoints)
            }
            None => {
                // Scan mode only considers live rows that can actually be dialed.
                let conn = self.conn.lock().unwrap();
                let mut stmt = conn.prepare(
                    "SELECT id, name, host, socks5_port, username, password, status, last_ip, last_latency_ms, last_throughput_kbps, last_tested_at, deleted FROM endpoints WHERE deleted = 0 AND socks5_port IS NOT NULL ORDER BY id ASC LIMIT ?1",
                )?;
                let cap = limit.map(|n| n as i64).unwrap_or(-1);
                let endpoints = stmt
                    .query_map(params![cap], map_endpoint_row)?
                    .collect::<SqlResult<Vec<_>>>()?;
                Ok(endpoints)
            }
        }
    }

    fn update_endpoint_status(&self, update: &StatusUpdate) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let tested_at = update.tested_at.format("%Y-%m-%d %H:%M:%S%.9f").to_string();
        if update.status == EndpointStatus::Active {
            conn.execute(
                "UPDATE endpoints SET status=?1, last_ip=?2, last_latency_ms=?3, last_throughput_kbps=?4, last_tested_at=?5 WHERE id=?6",
                params![
                    update.status.as_str(),
                    update.last_ip,
                    update.last_latency_ms,
                    update.last_throughput_kbps,
                    tested_at,
                    update.endpoint_id,
                ],
            )?;
        } else {
            // Non-active updates leave the last good measurements in place.
            conn.execute(
                "UPDATE endpoints SET status=?1, last_tested_at=?2 WHERE id=?3",
                params![update.status.as_str(), tested_at, update.endpoint_id],
            )?;
        }
        Ok(())
    }
}

impl Audit for Store {
    fn append_test_result(&self, result: &TestResult) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO test_results (endpoint_id, host, port, reachable, latency_ms, throughput_kbps, external_ip, error_kind, error_message, tested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.endpoint_id,
                result.host,
                result.port,
                result.reachable,
                result.latency_ms,
                result.throughput_kbps,
                result.external_ip,
                result.error_kind.map(|k| k.as_str()),
                result.error,
                result.tested_at.format("%Y-%m-%d %H:%M:%S%.9f").to_string(),
            ],
        )?;
        Ok(())
    }
}

fn map_endpoint_row(row: &rusqlite::Row<'_>) -> SqlResult<Endpoint> {
    let status: String = row.get(6)?;
    let tested_at: Option<String> = row.get(10)?;
    Ok(Endpoint {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        socks5_port: row.get(3)?,
        username: row.get(4)?,
        password: row.get(5)?,
        status: EndpointStatus::parse(&status),
        last_ip: row.get(7)?,
        last_latency_ms: row.get(8)?,
        last_throughput_kbps: row.get(9)?,
        last_tested_at: tested_at.as_deref().and_then(parse_db_time),
        deleted: row.get(11)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
