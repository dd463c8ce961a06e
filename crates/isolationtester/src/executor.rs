//! §4.2: drives a single step on a single session connection, distinguishing
//! "still running", "blocked on a lock", and "finished" (possibly with an
//! error, captured rather than propagated).

use crate::db::{Conn, QueryResult};
use crate::spec::Step;
use crate::wait_detector::WaitDetector;
use anyhow::Context;
use std::io::Write;
use std::time::Duration;
use tokio_postgres::SimpleQueryMessage;

/// Column width the original tool pads tabular output to (`%-15s`).
const COLUMN_WIDTH: usize = 15;

/// Flags controlling how [`StepExecutor::run`] drives a dispatched step.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Poll with a timeout and consult the wait detector on timeout, rather
    /// than draining the query to completion synchronously.
    pub nonblock: bool,
    /// This step has already emitted its `<waiting ...>` line on a prior
    /// call; a block detected now is not re-announced, and completion is
    /// reported as `<... completed>` rather than re-printing the SQL.
    pub retry: bool,
}

impl RunFlags {
    pub const BLOCKING: Self = Self {
        nonblock: false,
        retry: false,
    };
    pub const NONBLOCK: Self = Self {
        nonblock: true,
        retry: false,
    };
    pub const NONBLOCK_RETRY: Self = Self {
        nonblock: true,
        retry: true,
    };
    /// Final forced drain of a step that is still the waiter once a
    /// permutation's step list is exhausted (§4.3): blocking, but treated as
    /// a retry for transcript purposes.
    pub const RETRY: Self = Self {
        nonblock: false,
        retry: true,
    };
}

pub struct StepExecutor {
    poll_interval: Duration,
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self {
            poll_interval: crate::db::DEFAULT_POLL_INTERVAL,
        }
    }
}

impl StepExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Run `step`, whose SQL has already been [`Conn::dispatch`]ed on
    /// `conn`, to either blocked-on-a-lock or drained. Returns `true` (and
    /// emits a `<waiting ...>` line unless `flags.retry`) the moment the
    /// wait detector confirms a lock wait; returns `false` once the query
    /// has fully drained, having emitted the step's completion line and any
    /// tabular result to `out`, and having stashed an error message on
    /// `step` if the query failed.
    pub async fn run(
        &self,
        out: &mut impl Write,
        conn: &mut Conn,
        wait_detector: &WaitDetector,
        wait_conn: &Conn,
        waiter_pid: i32,
        holder_pids: &[i32],
        step: &mut Step,
        flags: RunFlags,
    ) -> anyhow::Result<bool> {
        step.errormsg = None;
        if flags.nonblock {
            loop {
                if let Some(result) = conn.poll_with_timeout(self.poll_interval).await? {
                    self.report_completion(out, step, flags, result)?;
                    return Ok(false);
                }
                if wait_detector
                    .is_blocked(wait_conn, waiter_pid, holder_pids)
                    .await?
                {
                    if !flags.retry {
                        writeln!(out, "step {}: {} <waiting ...>", step.name, step.sql.trim())?;
                    }
                    return Ok(true);
                }
            }
        }

        let result = conn.drain_blocking().await?;
        self.report_completion(out, step, flags, result)?;
        Ok(false)
    }

    fn report_completion(
        &self,
        out: &mut impl Write,
        step: &mut Step,
        flags: RunFlags,
        result: QueryResult,
    ) -> anyhow::Result<()> {
        if flags.retry {
            writeln!(out, "step {}: <... completed>", step.name)?;
        } else {
            writeln!(out, "step {}: {}", step.name, step.sql.trim())?;
        }

        match result {
            Ok(messages) => emit_result_sets(out, messages),
            Err(err) => {
                // A server-reported SQL error is a step error (kind 2): data,
                // not a fatal condition. A dead connection, which the server
                // never got a chance to respond to, is the async analogue of
                // a synchronous send failure (kind 1) and propagates instead.
                if err.as_db_error().is_none() && err.is_closed() {
                    return Err(err).context("connection closed while completing step");
                }
                step.errormsg = Some(format_db_error(&err));
                Ok(())
            }
        }
    }
}

/// Render every result set in `messages` as a padded table (§6), in order.
/// Shared between the step executor and the driver's setup/teardown
/// execution: both hand a server's response to the transcript the same way.
pub(crate) fn emit_result_sets(
    out: &mut impl Write,
    messages: Vec<SimpleQueryMessage>,
) -> anyhow::Result<()> {
    let mut columns: Option<Vec<String>> = None;
    let mut rows: Vec<Vec<Option<String>>> = Vec::new();

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(cols) => {
                columns = Some(cols.iter().map(|c| c.name().to_string()).collect());
                rows.clear();
            }
            SimpleQueryMessage::Row(row) => {
                let values = (0..row.len()).map(|i| row.get(i).map(str::to_string)).collect();
                rows.push(values);
            }
            SimpleQueryMessage::CommandComplete(_) => {
                if let Some(cols) = columns.take() {
                    emit_table(out, &cols, &rows)?;
                    rows.clear();
                }
            }
            _ => writeln!(out, "unexpected result status: {message:?}")?,
        }
    }
    Ok(())
}

fn emit_table(
    out: &mut impl Write,
    columns: &[String],
    rows: &[Vec<Option<String>>],
) -> anyhow::Result<()> {
    for name in columns {
        write!(out, "{:COLUMN_WIDTH$}", name)?;
    }
    writeln!(out)?;
    writeln!(out)?;
    for row in rows {
        for value in row {
            write!(out, "{:COLUMN_WIDTH$}", value.as_deref().unwrap_or(""))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// §4.2: "capture severity + primary message (or the full message if
/// structured fields are unavailable)". Two spaces after the colon, per the
/// byte-exact transcript contract (§6).
fn format_db_error(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => format!("{}:  {}", db_error.severity(), db_error.message()),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_formatting_pads_to_column_width_and_blank_line() {
        let mut out = Vec::new();
        emit_table(
            &mut out,
            &["k".to_string(), "v".to_string()],
            &[vec![Some("1".to_string()), Some("2".to_string())]],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), format!("{:15}{:15}", "k", "v"));
        assert_eq!(lines.next().unwrap(), "");
        assert_eq!(lines.next().unwrap(), format!("{:15}{:15}", "1", "2"));
    }

    #[test]
    fn null_values_render_as_empty_field() {
        let mut out = Vec::new();
        emit_table(&mut out, &["v".to_string()], &[vec![None]]).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().nth(2).unwrap(), format!("{:15}", ""));
    }
}
