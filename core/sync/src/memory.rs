//! In-memory sync server for tests and local development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use musichub_common::{Error, Result, SecretToken};
use musichub_store::row::row_id;
use musichub_store::{ChangeSet, Row};

use crate::transport::{push_rejection, PullRequest, PullResponse, PushRequest, SyncTransport};

#[derive(Debug, Clone)]
struct ServerRecord {
    row: Row,
    created_at: i64,
    changed_at: i64,
    deleted: bool,
}

#[derive(Default)]
struct ServerState {
    tables: BTreeMap<String, BTreeMap<String, ServerRecord>>,
    now: i64,
    unreachable: bool,
    latency: Duration,
    revoked: HashSet<String>,
    next_pull_status: Option<u16>,
    next_push_status: Option<u16>,
    pulls: usize,
    pushes: usize,
    pull_requests: Vec<PullRequest>,
    pushed: Vec<ChangeSet>,
}

impl ServerState {
    fn check(&mut self, token: &SecretToken, injected: Option<u16>) -> Result<()> {
        if self.unreachable {
            return Err(Error::ServerUnreachable("connection refused".to_string()));
        }
        if self.revoked.contains(token.expose()) {
            return Err(Error::ServerRejected {
                status: 401,
                message: "Invalid token".to_string(),
            });
        }
        if let Some(status) = injected {
            return Err(Error::ServerRejected {
                status,
                message: format!("Injected failure {}", status),
            });
        }
        Ok(())
    }

    /// Upsert keyed by id. Identical content leaves the record untouched.
    fn upsert(&mut self, table: &str, row: &Row, now: i64) {
        let Some(id) = row_id(row) else {
            return;
        };
        let records = self.tables.entry(table.to_string()).or_default();
        match records.get_mut(id) {
            Some(existing) if !existing.deleted && existing.row == *row => {}
            Some(existing) => {
                existing.row = row.clone();
                existing.changed_at = now;
                existing.deleted = false;
            }
            None => {
                records.insert(
                    id.to_string(),
                    ServerRecord {
                        row: row.clone(),
                        created_at: now,
                        changed_at: now,
                        deleted: false,
                    },
                );
            }
        }
    }

    fn delete(&mut self, table: &str, id: &str, now: i64) {
        if let Some(existing) = self
            .tables
            .get_mut(table)
            .and_then(|records| records.get_mut(id))
        {
            if !existing.deleted {
                existing.deleted = true;
                existing.changed_at = now;
            }
        }
    }
}

/// A [`SyncTransport`] that behaves like the `/sync` endpoint.
///
/// Records are keyed by table and id, so re-sending a change set leaves the
/// server as it was after the first delivery. Every push moves the server
/// clock forward by one millisecond.
#[derive(Default)]
pub struct MemorySyncServer {
    state: Mutex<ServerState>,
}

impl MemorySyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server clock, in milliseconds.
    pub fn set_time(&self, now: i64) {
        self.lock().now = now;
    }

    pub fn now(&self) -> i64 {
        self.lock().now
    }

    /// Store a row as if another client had pushed it at the current time.
    pub fn seed(&self, table: &str, row: Row) {
        let mut state = self.lock();
        let now = state.now;
        state.upsert(table, &row, now);
    }

    pub fn seed_deletion(&self, table: &str, id: &str) {
        let mut state = self.lock();
        let now = state.now;
        state.delete(table, id, now);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Answer requests carrying `token` with 401.
    pub fn revoke_token(&self, token: &str) {
        self.lock().revoked.insert(token.to_string());
    }

    /// Fail the next pull with `status`.
    pub fn fail_next_pull(&self, status: u16) {
        self.lock().next_pull_status = Some(status);
    }

    /// Fail the next push with `status`. 409 and 422 surface as validation
    /// conflicts.
    pub fn fail_next_push(&self, status: u16) {
        self.lock().next_push_status = Some(status);
    }

    /// Live rows of `table`, keyed by id.
    pub fn rows(&self, table: &str) -> BTreeMap<String, Row> {
        self.lock()
            .tables
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, r)| !r.deleted)
                    .map(|(id, r)| (id.clone(), r.row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.rows(table).remove(id)
    }

    pub fn pull_count(&self) -> usize {
        self.lock().pulls
    }

    pub fn push_count(&self) -> usize {
        self.lock().pushes
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.lock().pull_requests.clone()
    }

    /// Change sets accepted so far, in order.
    pub fn pushed(&self) -> Vec<ChangeSet> {
        self.lock().pushed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SyncTransport for MemorySyncServer {
    async fn pull(&self, token: &SecretToken, request: &PullRequest) -> Result<PullResponse> {
        self.delay().await;
        let mut state = self.lock();
        state.pulls += 1;
        state.pull_requests.push(request.clone());
        let injected = state.next_pull_status.take();
        state.check(token, injected)?;

        let since = request.last_pulled_at;
        let mut changes = ChangeSet::new();
        for (table, records) in &state.tables {
            if !request.relations.is_empty() && !request.relations.contains(table) {
                continue;
            }
            for (id, record) in records {
                if since.is_some_and(|since| record.changed_at <= since) {
                    continue;
                }
                let entry = changes.table_mut(table);
                if record.deleted {
                    if since.is_some() {
                        entry.deleted.push(id.clone());
                    }
                } else if since.map_or(true, |since| record.created_at > since) {
                    entry.created.push(record.row.clone());
                } else {
                    entry.updated.push(record.row.clone());
                }
            }
        }

        Ok(PullResponse {
            changes,
            timestamp: state.now,
        })
    }

    async fn push(&self, token: &SecretToken, request: &PushRequest) -> Result<()> {
        self.delay().await;
        let mut state = self.lock();
        state.pushes += 1;
        let injected = state.next_push_status.take();
        state.check(token, injected).map_err(push_rejection)?;

        state.now += 1;
        let now = state.now;
        for (table, changes) in request.changes.iter() {
            for row in changes.created.iter().chain(&changes.updated) {
                state.upsert(table, row, now);
            }
            for id in &changes.deleted {
                state.delete(table, id, now);
            }
        }
        state.pushed.push(request.changes.clone());
        Ok(())
    }
}
