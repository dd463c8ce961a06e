//! The in-memory representation of a parsed isolation test spec.
//!
//! Nothing in this module talks to a database; it is pure data, built by
//! [`crate::spec_format::parse`] and consumed by [`crate::driver::Driver`].

use std::collections::HashMap;

/// A named (server, connect-string) pair. Sessions reference a `ConnInfo` by
/// name; multiple sessions may share one, in which case they also share the
/// server the [`crate::wait_detector::WaitDetector`] scopes its pidlist to.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub name: String,
    pub connstring: String,
}

/// A single step: one SQL statement (or `;`-separated batch) belonging to
/// exactly one session.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub session: usize,
    pub sql: String,
    /// Transient error message slot: empty except between capture (by the
    /// step executor) and the next report by the permutation runner.
    pub errormsg: Option<String>,
}

/// One of the concurrent sessions a test spec drives. `connection` is the
/// name of the `ConnInfo` to use, resolved to `conn_index` once the spec is
/// loaded; an absent `connection` resolves to connection index 0.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub connection: Option<String>,
    pub conn_index: usize,
    pub setup: Option<String>,
    pub teardown: Option<String>,
    pub steps: Vec<Step>,
}

/// A permutation as written in the spec: an ordered list of step names. Step
/// names are resolved against the global step table at run time; see
/// [`crate::enumerator`].
#[derive(Debug, Clone)]
pub struct Permutation {
    pub steps: Vec<String>,
}

/// A fully parsed, immutable test spec.
///
/// `permutations` is empty when the spec declares none, in which case the
/// driver falls back to enumerating every legal interleaving (see
/// [`crate::enumerator::enumerate_all`]).
#[derive(Debug, Clone, Default)]
pub struct TestSpec {
    pub connections: Vec<ConnInfo>,
    pub sessions: Vec<Session>,
    pub setup: Vec<String>,
    pub teardown: Vec<String>,
    pub permutations: Vec<Permutation>,
}

/// Identifies a single step by its position in `TestSpec.sessions`.
pub type StepRef = (usize, usize);

impl TestSpec {
    /// Resolve each session's `connection` name to an index into
    /// `self.connections`, defaulting to `0` (the first declared connection,
    /// or the synthetic default connection the driver installs when the spec
    /// declares none at all).
    pub fn resolve_connections(&mut self) -> anyhow::Result<()> {
        let by_name: HashMap<&str, usize> = self
            .connections
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        for session in &mut self.sessions {
            session.conn_index = match &session.connection {
                Some(name) => *by_name.get(name.as_str()).ok_or_else(|| {
                    anyhow::anyhow!(
                        "session {:?} references undefined connection {:?}",
                        session.name,
                        name
                    )
                })?,
                None => 0,
            };
        }
        Ok(())
    }

    /// The global step table, sorted by name, used to resolve named
    /// permutations (§4.4: "Resolve names via a global step table sorted by
    /// name and binary-searched").
    pub fn step_table(&self) -> Vec<(&str, StepRef)> {
        let mut table: Vec<(&str, StepRef)> = self
            .sessions
            .iter()
            .enumerate()
            .flat_map(|(si, session)| {
                session
                    .steps
                    .iter()
                    .enumerate()
                    .map(move |(ti, step)| (step.name.as_str(), (si, ti)))
            })
            .collect();
        table.sort_unstable_by_key(|(name, _)| *name);
        table
    }

    /// Resolve a step name to its `StepRef` via the sorted step table.
    pub fn resolve_step<'a>(table: &'a [(&'a str, StepRef)], name: &str) -> anyhow::Result<StepRef> {
        table
            .binary_search_by_key(&name, |(n, _)| *n)
            .map(|i| table[i].1)
            .map_err(|_| anyhow::anyhow!("undefined step name {:?}", name))
    }

    pub fn step(&self, step_ref: StepRef) -> &Step {
        &self.sessions[step_ref.0].steps[step_ref.1]
    }
}
