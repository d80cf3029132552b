//! Advisory lock ids shared by the router and the replicator
//!
//! | lock | holder | mode |
//! |------|--------|------|
//! | [`SWITCHOVER_LOCK_ID`] | every routed connection while checked out | shared, session |
//! | [`SWITCHOVER_LOCK_ID`] | final sync, taken before its snapshot | exclusive, session |
//! | [`SYNC_SESSION_LOCK_ID`] | the node running a replication session | exclusive, session, non-blocking |

/// Shared by application connections, taken exclusively by the final sync.
pub const SWITCHOVER_LOCK_ID: i64 = 0x5357_4f01;

/// Held by the single node driving a replication session.
pub const SYNC_SESSION_LOCK_ID: i64 = 0x5357_4f02;

/// Take the shared switchover lock for the session (blocks while the final
/// sync holds it exclusively).
pub const LOCK_SHARED_SQL: &str = "SELECT pg_advisory_lock_shared($1)";

/// Release the shared switchover lock held by the session.
pub const UNLOCK_SHARED_SQL: &str = "SELECT pg_advisory_unlock_shared($1)";

/// Take an exclusive session lock (waits up to the session's `lock_timeout`).
pub const LOCK_SQL: &str = "SELECT pg_advisory_lock($1)";

/// Try to take an exclusive session lock without waiting.
pub const TRY_LOCK_SQL: &str = "SELECT pg_try_advisory_lock($1)";

/// Release an exclusive session lock.
pub const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock($1)";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ids_are_distinct() {
        assert_ne!(SWITCHOVER_LOCK_ID, SYNC_SESSION_LOCK_ID);
    }

    #[test]
    fn test_exclusive_switchover_lock_is_session_level() {
        // a transaction-level lock would be granted after the snapshot is taken
        assert!(!LOCK_SQL.contains("xact"));
        assert!(LOCK_SQL.contains("pg_advisory_lock("));
        assert!(UNLOCK_SQL.contains("pg_advisory_unlock("));
    }
}
