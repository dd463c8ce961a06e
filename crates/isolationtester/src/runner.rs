//! §4.3: the permutation state machine. Tracks at most one *waiting* step,
//! dispatches the next step in sequence, detects invalid permutations, and
//! coalesces the error report of an unblock pair.

use crate::driver::{RuntimeConnInfo, RuntimeSession};
use crate::executor::{RunFlags, StepExecutor};
use crate::spec::{StepRef, TestSpec};
use std::io::Write;
use std::time::Duration;

/// The two ways a permutation can end. Not an error type: an invalid
/// permutation is an expected, named outcome (§7), distinguished at the
/// type level instead of by a logged side effect or a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    InvalidPermutation,
}

pub struct PermutationRunner {
    executor: StepExecutor,
}

impl Default for PermutationRunner {
    fn default() -> Self {
        Self {
            executor: StepExecutor::default(),
        }
    }
}

impl PermutationRunner {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            executor: StepExecutor::new(poll_interval),
        }
    }

    /// Execute one permutation to completion (or to an invalid-permutation
    /// abort), writing its transcript to `out`.
    pub async fn run(
        &self,
        out: &mut impl Write,
        spec: &mut TestSpec,
        sessions: &mut [RuntimeSession],
        conn_infos: &[RuntimeConnInfo],
        permutation: &[StepRef],
    ) -> anyhow::Result<RunOutcome> {
        let mut waiting: Option<StepRef> = None;

        for &step_ref in permutation {
            if let Some(w) = waiting {
                if w.0 == step_ref.0 {
                    eprintln!("invalid permutation detected");
                    self.cancel_and_drain(sessions, w).await?;
                    self.rollback_all(sessions).await;
                    return Ok(RunOutcome::InvalidPermutation);
                }
            }

            self.dispatch(sessions, spec, step_ref);

            match waiting {
                Some(w) => {
                    self.run_one(out, spec, sessions, conn_infos, step_ref, RunFlags::BLOCKING)
                        .await?;
                    let still_waiting = self
                        .run_one(out, spec, sessions, conn_infos, w, RunFlags::NONBLOCK_RETRY)
                        .await?;
                    if still_waiting {
                        report_single(out, spec.step(step_ref))?;
                    } else {
                        report_coalesced(out, spec.step(step_ref), spec.step(w))?;
                        waiting = None;
                    }
                }
                None => {
                    let waited = self
                        .run_one(out, spec, sessions, conn_infos, step_ref, RunFlags::NONBLOCK)
                        .await?;
                    report_single(out, spec.step(step_ref))?;
                    if waited {
                        waiting = Some(step_ref);
                    }
                }
            }
        }

        if let Some(w) = waiting {
            self.run_one(out, spec, sessions, conn_infos, w, RunFlags::RETRY)
                .await?;
            report_single(out, spec.step(w))?;
        }

        Ok(RunOutcome::Completed)
    }

    fn dispatch(&self, sessions: &mut [RuntimeSession], spec: &TestSpec, step_ref: StepRef) {
        let sql = spec.step(step_ref).sql.clone();
        sessions[step_ref.0].conn.dispatch(&sql);
    }

    async fn run_one(
        &self,
        out: &mut impl Write,
        spec: &mut TestSpec,
        sessions: &mut [RuntimeSession],
        conn_infos: &[RuntimeConnInfo],
        step_ref: StepRef,
        flags: RunFlags,
    ) -> anyhow::Result<bool> {
        let session_idx = step_ref.0;
        let conn_index = sessions[session_idx].conn_index;
        let waiter_pid = sessions[session_idx].backend_pid;
        let conn_info = &conn_infos[conn_index];
        let step = &mut spec.sessions[step_ref.0].steps[step_ref.1];
        self.executor
            .run(
                out,
                &mut sessions[session_idx].conn,
                &conn_info.wait_detector,
                &conn_info.global,
                waiter_pid,
                &conn_info.pids,
                step,
                flags,
            )
            .await
    }

    /// §5 Cancellation: the invalid-permutation path asynchronously cancels
    /// the stuck session's in-flight statement, then drains whatever comes
    /// back. The drain's outcome is discarded: the permutation is already
    /// being abandoned.
    async fn cancel_and_drain(
        &self,
        sessions: &mut [RuntimeSession],
        w: StepRef,
    ) -> anyhow::Result<()> {
        let conn = &mut sessions[w.0].conn;
        conn.cancel_inflight().await;
        if conn.has_inflight() {
            let _ = conn.drain_blocking().await;
        }
        Ok(())
    }

    /// Every session's connection gets a `ROLLBACK`, independently and
    /// concurrently: order doesn't matter here the way it does for
    /// setup/teardown, only that every session is released before teardown
    /// runs.
    async fn rollback_all(&self, sessions: &mut [RuntimeSession]) {
        let rollbacks = sessions.iter_mut().map(|session| async move {
            if let Err(err) = session.conn.batch_execute("ROLLBACK").await {
                tracing::warn!(session = %session.name, %err, "rollback during invalid-permutation cleanup failed");
            }
        });
        futures_util::future::join_all(rollbacks).await;
    }
}

fn report_single(out: &mut impl Write, step: &crate::spec::Step) -> anyhow::Result<()> {
    if let Some(msg) = &step.errormsg {
        writeln!(out, "{msg}")?;
    }
    Ok(())
}

/// §6: "Coalesced errors use prefix `error in steps N1 N2: …`." Each of
/// `waker`/`awakened` that captured an error gets its own complete line
/// carrying the full `error in steps N1 N2: ` prefix, in the order (wakening
/// step, awakened step); a step with no captured message contributes no
/// line at all.
fn report_coalesced(
    out: &mut impl Write,
    waker: &crate::spec::Step,
    awakened: &crate::spec::Step,
) -> anyhow::Result<()> {
    for step in [waker, awakened] {
        if let Some(msg) = &step.errormsg {
            writeln!(out, "error in steps {} {}: {msg}", waker.name, awakened.name)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Step;

    fn step(name: &str, errormsg: Option<&str>) -> Step {
        Step {
            name: name.to_string(),
            session: 0,
            sql: String::new(),
            errormsg: errormsg.map(str::to_string),
        }
    }

    /// §8 scenario 4: a deadlock's two sides each get a full, independent
    /// `error in steps ...` line, not a shared bare header.
    #[test]
    fn coalesced_errors_each_carry_the_full_prefix() {
        let waker = step("w3", Some("ERROR:  deadlock detected"));
        let awakened = step("r2", Some("ERROR:  deadlock detected"));
        let mut out = Vec::new();
        report_coalesced(&mut out, &waker, &awakened).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "error in steps w3 r2: ERROR:  deadlock detected\n\
             error in steps w3 r2: ERROR:  deadlock detected\n"
        );
    }

    #[test]
    fn coalesced_errors_omit_a_step_with_no_captured_message() {
        let waker = step("w3", None);
        let awakened = step("r2", Some("ERROR:  deadlock detected"));
        let mut out = Vec::new();
        report_coalesced(&mut out, &waker, &awakened).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "error in steps w3 r2: ERROR:  deadlock detected\n");
    }

    #[test]
    fn coalesced_errors_emit_nothing_when_neither_step_has_one() {
        let waker = step("w3", None);
        let awakened = step("r2", None);
        let mut out = Vec::new();
        report_coalesced(&mut out, &waker, &awakened).unwrap();
        assert!(out.is_empty());
    }
}
