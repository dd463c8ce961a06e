//! §4.1: given a session's backend pid and the pids of its sibling sessions
//! on the same server, answer whether the session is currently blocked
//! waiting on a lock one of those siblings holds.

use crate::db::Conn;
use tokio_postgres::Statement;

/// The canonical lock-compatibility matrix, joined against itself on every
/// lockable-object identity column with NULL-safe equality (`IS NOT
/// DISTINCT FROM`), exactly as §4.1 specifies. `holder.pid <> $1` excludes
/// the waiter's own other locks; `holder.pid = ANY($2)` restricts holders to
/// this `ConnInfo`'s sibling sessions so the detector ignores background
/// maintenance connections.
const WAIT_QUERY: &str = r#"
SELECT 1
FROM pg_locks AS holder, pg_locks AS waiter
WHERE NOT waiter.granted
  AND waiter.pid = $1
  AND holder.granted
  AND holder.pid <> $1
  AND holder.pid = ANY ($2)
  AND holder.locktype IS NOT DISTINCT FROM waiter.locktype
  AND holder.database IS NOT DISTINCT FROM waiter.database
  AND holder.relation IS NOT DISTINCT FROM waiter.relation
  AND holder.page IS NOT DISTINCT FROM waiter.page
  AND holder.tuple IS NOT DISTINCT FROM waiter.tuple
  AND holder.virtualxid IS NOT DISTINCT FROM waiter.virtualxid
  AND holder.transactionid IS NOT DISTINCT FROM waiter.transactionid
  AND holder.classid IS NOT DISTINCT FROM waiter.classid
  AND holder.objid IS NOT DISTINCT FROM waiter.objid
  AND holder.objsubid IS NOT DISTINCT FROM waiter.objsubid
  AND holder.mode = ANY (
    CASE waiter.mode
      WHEN 'AccessShareLock' THEN ARRAY['AccessExclusiveLock']
      WHEN 'RowShareLock' THEN ARRAY['ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'RowExclusiveLock' THEN ARRAY['ShareLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'ShareUpdateExclusiveLock' THEN ARRAY['ShareUpdateExclusiveLock', 'ShareLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'ShareLock' THEN ARRAY['RowExclusiveLock', 'ShareUpdateExclusiveLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'ShareRowExclusiveLock' THEN ARRAY['RowExclusiveLock', 'ShareUpdateExclusiveLock', 'ShareLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'ExclusiveLock' THEN ARRAY['RowShareLock', 'RowExclusiveLock', 'ShareUpdateExclusiveLock', 'ShareLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      WHEN 'AccessExclusiveLock' THEN ARRAY['AccessShareLock', 'RowShareLock', 'RowExclusiveLock', 'ShareUpdateExclusiveLock', 'ShareLock', 'ShareRowExclusiveLock', 'ExclusiveLock', 'AccessExclusiveLock']
      ELSE ARRAY[]::text[]
    END
  )
"#;

/// Bound to a single `ConnInfo`'s global connection; one of these is
/// prepared per server before any permutation runs (§4.5 step 3).
pub struct WaitDetector {
    statement: Statement,
}

impl WaitDetector {
    pub async fn prepare(global: &Conn) -> anyhow::Result<Self> {
        let statement = global.prepare(WAIT_QUERY).await?;
        Ok(Self { statement })
    }

    /// True exactly when `waiter_pid` is blocked on a lock granted to one of
    /// `holder_pids`. Any non-success status from the underlying query is
    /// fatal (§4.1 Failure).
    pub async fn is_blocked(
        &self,
        global: &Conn,
        waiter_pid: i32,
        holder_pids: &[i32],
    ) -> anyhow::Result<bool> {
        let rows = global
            .query_prepared(&self.statement, &[&waiter_pid, &holder_pids])
            .await?;
        Ok(!rows.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::WAIT_QUERY;

    #[test]
    fn query_covers_every_identity_column() {
        for column in [
            "locktype",
            "database",
            "relation",
            "page",
            "tuple",
            "virtualxid",
            "transactionid",
            "classid",
            "objid",
            "objsubid",
        ] {
            assert!(
                WAIT_QUERY.contains(column),
                "wait query missing identity column {column}"
            );
        }
    }

    #[test]
    fn query_scopes_holders_to_the_candidate_list() {
        assert!(WAIT_QUERY.contains("holder.pid = ANY ($2)"));
        assert!(WAIT_QUERY.contains("waiter.pid = $1"));
    }
}
