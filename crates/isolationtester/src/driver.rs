//! §4.5: opens connections, then for every permutation runs setup, dispatches
//! the permutation's steps to the [`PermutationRunner`], and runs teardown,
//! fresh for each permutation, matching `run_permutation`'s own setup →
//! steps → `teardown:` shape in the original tool. Owns every connection for
//! the life of the run.

use crate::db::Conn;
use crate::enumerator::{format_dry_run_line, resolve_permutations};
use crate::executor::emit_result_sets;
use crate::runner::{PermutationRunner, RunOutcome};
use crate::spec::{ConnInfo, TestSpec};
use crate::wait_detector::WaitDetector;
use anyhow::Context;
use std::io::Write;
use std::time::Duration;

/// The global connection, prepared wait-query, and candidate-holder pidlist
/// for one `ConnInfo` (§3). One of these exists per distinct server the spec
/// talks to.
pub struct RuntimeConnInfo {
    pub name: String,
    pub global: Conn,
    pub wait_detector: WaitDetector,
    /// Backend pids of every session sharing this `ConnInfo`, in the order
    /// their connections were opened. Kept as the parameter to the
    /// wait-detector query; §4.5 step 5's literal `{p1,...,pN}` string is a
    /// diagnostic rendering of the same data (see [`RuntimeConnInfo::pidlist_literal`]).
    pub pids: Vec<i32>,
}

impl RuntimeConnInfo {
    pub fn pidlist_literal(&self) -> String {
        let joined = self
            .pids
            .iter()
            .map(i32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!("{{{joined}}}")
    }
}

/// One session's dedicated connection and identity (§3).
pub struct RuntimeSession {
    pub name: String,
    pub conn_index: usize,
    pub conn: Conn,
    pub backend_pid: i32,
}

pub struct Driver {
    spec: TestSpec,
    conn_infos: Vec<RuntimeConnInfo>,
    sessions: Vec<RuntimeSession>,
}

impl Driver {
    /// Open every connection the spec needs (§4.5 steps 2-5). Setup runs
    /// later, fresh for each permutation (see [`Driver::run`]), not here.
    /// `default_connstring` is used when the spec declares no connections at
    /// all (the CLI's `dbname = postgres` fallback, §6).
    pub async fn connect(mut spec: TestSpec, default_connstring: &str) -> anyhow::Result<Self> {
        if spec.connections.is_empty() {
            spec.connections.push(ConnInfo {
                name: String::new(),
                connstring: default_connstring.to_string(),
            });
        }

        let mut conn_infos = Vec::with_capacity(spec.connections.len());
        for info in &spec.connections {
            let global = Conn::connect(&info.connstring)
                .await
                .with_context(|| format!("opening global connection for {:?}", info.name))?;
            let wait_detector = WaitDetector::prepare(&global)
                .await
                .with_context(|| format!("preparing wait-detector query for {:?}", info.name))?;
            conn_infos.push(RuntimeConnInfo {
                name: info.name.clone(),
                global,
                wait_detector,
                pids: Vec::new(),
            });
        }

        let mut sessions = Vec::with_capacity(spec.sessions.len());
        for session in &spec.sessions {
            let connstring = &spec.connections[session.conn_index].connstring;
            let conn = Conn::connect(connstring)
                .await
                .with_context(|| format!("opening connection for session {:?}", session.name))?;
            let backend_pid = conn
                .backend_pid()
                .await
                .with_context(|| format!("fetching backend pid for session {:?}", session.name))?;
            conn_infos[session.conn_index].pids.push(backend_pid);
            sessions.push(RuntimeSession {
                name: session.name.clone(),
                conn_index: session.conn_index,
                conn,
                backend_pid,
            });
        }

        for info in &conn_infos {
            tracing::debug!(conninfo = %info.name, pidlist = %info.pidlist_literal(), "opened connections");
        }

        Ok(Self {
            spec,
            conn_infos,
            sessions,
        })
    }

    /// Run every permutation, in order, writing the byte-exact transcript
    /// (§6) to `out`. Setup runs fresh before each permutation and teardown
    /// runs after it (including after an [`RunOutcome::InvalidPermutation`]
    /// abort), so that one permutation's steps never run against state a
    /// prior permutation's steps left behind. Returns each permutation's
    /// outcome, in the same order, mainly so callers (tests, an external
    /// harness summarizing a run) can tell an invalid permutation from a
    /// clean completion without scraping stderr.
    pub async fn run(
        &mut self,
        out: &mut impl Write,
        poll_interval: Duration,
    ) -> anyhow::Result<Vec<RunOutcome>> {
        writeln!(out, "Parsed test spec with {} sessions", self.spec.sessions.len())?;

        let permutations = resolve_permutations(&self.spec)?;
        let runner = PermutationRunner::new(poll_interval);
        let mut outcomes = Vec::with_capacity(permutations.len());

        for permutation in &permutations {
            writeln!(out)?;
            write!(out, "starting permutation:")?;
            for step_ref in permutation {
                write!(out, " {}", self.spec.step(*step_ref).name)?;
            }
            writeln!(out)?;

            self.run_global_setup(out).await?;
            self.run_session_setup(out).await?;

            let outcome = runner
                .run(out, &mut self.spec, &mut self.sessions, &self.conn_infos, permutation)
                .await?;
            if outcome == RunOutcome::InvalidPermutation {
                tracing::debug!("permutation aborted as invalid; continuing with the next one");
            }

            self.teardown(out).await;

            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Print every permutation the spec would run, in spec-file syntax,
    /// without opening any connection (§4.5 Dry run).
    pub fn dry_run(spec: &TestSpec, out: &mut impl Write) -> anyhow::Result<()> {
        for permutation in resolve_permutations(spec)? {
            writeln!(out, "{}", format_dry_run_line(spec, &permutation))?;
        }
        Ok(())
    }

    /// §4.3: "Global setup runs on the first global connection". A setup
    /// statement's result set, if it has one, is part of the transcript the
    /// same way a step's is. A setup failure is fatal (§7 kind 1).
    async fn run_global_setup(&self, out: &mut impl Write) -> anyhow::Result<()> {
        let Some(global) = self.conn_infos.first() else {
            return Ok(());
        };
        for sql in &self.spec.setup {
            let messages = global
                .global
                .simple_query(sql)
                .await
                .context("running global setup")?;
            emit_result_sets(out, messages)?;
        }
        Ok(())
    }

    /// §4.3: "per-session setup on each session connection, in session
    /// order".
    async fn run_session_setup(&self, out: &mut impl Write) -> anyhow::Result<()> {
        for (session, runtime) in self.spec.sessions.iter().zip(self.sessions.iter()) {
            if let Some(sql) = &session.setup {
                let messages = runtime
                    .conn
                    .simple_query(sql)
                    .await
                    .with_context(|| format!("running setup for session {:?}", session.name))?;
                emit_result_sets(out, messages)?;
            }
        }
        Ok(())
    }

    /// §7 kind 3: teardown failures are logged, never fatal; run after every
    /// permutation, symmetric with setup (per-session, then global).
    async fn teardown(&self, out: &mut impl Write) {
        for (session, runtime) in self.spec.sessions.iter().zip(self.sessions.iter()) {
            if let Some(sql) = &session.teardown {
                match runtime.conn.simple_query(sql).await {
                    Ok(messages) => {
                        if let Err(err) = emit_result_sets(out, messages) {
                            tracing::warn!(session = %session.name, %err, "writing session teardown result failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(session = %session.name, %err, "session teardown failed");
                    }
                }
            }
        }
        if let Some(global) = self.conn_infos.first() {
            for sql in &self.spec.teardown {
                match global.global.simple_query(sql).await {
                    Ok(messages) => {
                        if let Err(err) = emit_result_sets(out, messages) {
                            tracing::warn!(%err, "writing global teardown result failed");
                        }
                    }
                    Err(err) => tracing::warn!(%err, "global teardown failed"),
                }
            }
        }
    }

    /// §4.5 step 7 / §8 invariant ("every connection opened is closed
    /// before normal exit"). Every [`Conn`] holds the last reference to its
    /// `Arc<Client>`; dropping it lets the background connection task
    /// observe EOF and exit on its own, the idiomatic `tokio_postgres`
    /// shutdown path.
    pub fn close(self) {
        drop(self);
    }
}
