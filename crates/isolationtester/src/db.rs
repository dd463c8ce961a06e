//! The narrow database capability (§6) this crate needs, adapted onto
//! `tokio_postgres`: open a connection, dispatch a statement without
//! blocking the driver loop, poll it, cancel it, and read back its backend
//! pid. This is the one place `tokio_postgres`'s two-halves-and-a-background-task
//! shape is dealt with; everything above this module just sees
//! [`Conn::dispatch`] / [`Conn::poll`].

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// The canonical lock-wait probe interval (§5). Exposed as a constructor
/// parameter on [`crate::runner::PermutationRunner`] but defaults to this.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type QueryResult = Result<Vec<SimpleQueryMessage>, tokio_postgres::Error>;

/// A single connection, driven by a background task the way every
/// `tokio_postgres` consumer that doesn't need to intercept the wire
/// protocol message-by-message drives one (see `StatementExecutor::new` in
/// the `locksmith` crate this crate is descended from).
pub struct Conn {
    client: Arc<Client>,
    inflight: Option<oneshot::Receiver<QueryResult>>,
}

impl Conn {
    /// Open a connection, spawning its background I/O task, and apply
    /// `SET client_min_messages = warning` (§6.9) before returning.
    pub async fn connect(connstring: &str) -> anyhow::Result<Self> {
        let (client, connection) = tokio_postgres::connect(connstring, NoTls)
            .await
            .with_context(|| format!("connecting to {connstring:?}"))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(%err, "connection task terminated with an error");
            }
        });
        client
            .batch_execute("SET client_min_messages = warning")
            .await
            .context("setting client_min_messages")?;
        Ok(Self {
            client: Arc::new(client),
            inflight: None,
        })
    }

    /// `SELECT pg_backend_pid()` (§6.7).
    pub async fn backend_pid(&self) -> anyhow::Result<i32> {
        let row = self
            .client
            .query_one("SELECT pg_backend_pid()", &[])
            .await
            .context("querying pg_backend_pid()")?;
        Ok(row.get(0))
    }

    /// Prepare a named statement with the query text this connection will
    /// reuse for the lifetime of the run (the wait-detector query).
    pub async fn prepare(&self, sql: &str) -> anyhow::Result<tokio_postgres::Statement> {
        self.client
            .prepare(sql)
            .await
            .with_context(|| format!("preparing statement {sql:?}"))
    }

    /// Execute SQL to completion, synchronously from the caller's
    /// perspective, discarding any rows it returns. Used where the result is
    /// genuinely irrelevant (`ROLLBACK` during invalid-permutation cleanup).
    pub async fn batch_execute(&self, sql: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .with_context(|| format!("executing {sql:?}"))
    }

    /// Execute SQL to completion and return its messages, rows included.
    /// Used for setup/teardown, whose result set (if any) belongs in the
    /// transcript the same way a step's does.
    pub async fn simple_query(&self, sql: &str) -> QueryResult {
        self.client.simple_query(sql).await
    }

    /// Run a prepared statement and return its rows (used by the wait
    /// detector).
    pub async fn query_prepared(
        &self,
        statement: &tokio_postgres::Statement,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> anyhow::Result<Vec<tokio_postgres::Row>> {
        self.client
            .query(statement, params)
            .await
            .context("executing wait-detector query")
    }

    /// Non-blocking send (§6.5): spawn the simple-query future onto a
    /// background task and stash the result channel. A second dispatch
    /// before the first is drained is a programmer error (a session has at
    /// most one outstanding query at a time, by construction of the
    /// permutation runner's state machine).
    pub fn dispatch(&mut self, sql: &str) {
        assert!(
            self.inflight.is_none(),
            "dispatched a step while a previous one was still in flight"
        );
        let client = self.client.clone();
        let sql = sql.to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = client.simple_query(&sql).await;
            // The receiver may already be gone (e.g. the driver shut down
            // mid-permutation); that's fine, there's nothing left to report to.
            let _ = tx.send(result);
        });
        self.inflight = Some(rx);
    }

    /// Race the in-flight query against a timer; returns `Ok(Some(result))`
    /// once the query completes (consuming the in-flight slot), `Ok(None)`
    /// if `timeout` elapsed first (the slot is left in flight), or `Err` if
    /// the background dispatch task vanished without reporting a result,
    /// which is itself a fatal driver error.
    pub async fn poll_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<Option<QueryResult>> {
        let rx = self.inflight.as_mut().expect("no query in flight to poll");
        tokio::select! {
            biased;
            result = rx => {
                self.inflight = None;
                Ok(Some(result.context("query dispatch task was dropped before completing")?))
            }
            () = tokio::time::sleep(timeout) => Ok(None),
        }
    }

    /// Block until the in-flight query completes (the "blocking drain"
    /// path, flags without `NONBLOCK`).
    pub async fn drain_blocking(&mut self) -> anyhow::Result<QueryResult> {
        let rx = self.inflight.take().expect("no query in flight to drain");
        rx.await.context("query dispatch task was dropped before completing")
    }

    /// Cancel the in-flight statement (§5 Cancellation; used only on the
    /// invalid-permutation path).
    pub async fn cancel_inflight(&self) {
        self.client.cancel_token().cancel_query(NoTls).await.ok();
    }

    pub fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }
}
