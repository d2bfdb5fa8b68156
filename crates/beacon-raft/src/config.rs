//! Consensus configuration (timeouts, limits, snapshot policy).

use std::time::Duration;

/// Consensus configuration.
///
/// Controls election timeouts, heartbeat intervals, propose behavior, and
/// the snapshot policy.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// Must be well under `election_timeout_min` to prevent spurious
    /// elections.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// Randomized between [min, max] per node to avoid split votes.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 600ms
    pub election_timeout_max: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 500 entries
    pub max_entries_per_append: usize,

    /// How long `propose` waits for the entry to be applied before
    /// reporting an unknown outcome.
    ///
    /// Default: 5000ms
    pub propose_timeout: Duration,

    /// Initial snapshot policy (runtime-reconfigurable).
    pub snapshot: SnapshotPolicy,
}

/// Snapshot triggering and retention policy.
///
/// A snapshot is taken when either the interval elapses or the number of
/// entries applied since the last snapshot crosses the threshold,
/// whichever comes first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Elapsed-time trigger.
    ///
    /// Default: 300s
    pub interval: Duration,

    /// Applied-entry-count trigger.
    ///
    /// Default: 10,000 entries
    pub entry_threshold: u64,

    /// How many snapshot files to keep beyond the newest.
    ///
    /// Only the newest is required for recovery; older ones are kept for
    /// diagnostics and rollback.
    ///
    /// Default: 2
    pub retention_count: usize,

    /// LZ4-compress snapshot payloads on disk.
    ///
    /// Default: false
    pub compress: bool,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            entry_threshold: 10_000,
            retention_count: 2,
            compress: false,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            max_entries_per_append: 500,
            propose_timeout: Duration::from_millis(5000),
            snapshot: SnapshotPolicy::default(),
        }
    }
}

impl RaftConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        if self.snapshot.entry_threshold == 0 {
            return Err("snapshot.entry_threshold must be > 0".to_string());
        }

        Ok(())
    }

    /// Randomized election timeout in [min, max].
    ///
    /// Each node draws its own timeout so simultaneous candidacies are
    /// unlikely to repeat.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
