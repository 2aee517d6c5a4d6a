use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::storage::TransferOutcome;

/// Install the process-wide tracing subscriber.
///
/// Call once at startup; later calls leave the first subscriber in place. `RUST_LOG`
/// takes precedence over `default_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "workflow_orchestrator={default_level},wo={default_level}"
        ))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Statistics aggregated from transfer outcomes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub files_transferred: usize,
    pub files_skipped: usize,
    pub bytes_transferred: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a single transfer outcome
    pub fn update(&mut self, outcome: &TransferOutcome) {
        match outcome {
            TransferOutcome::Transferred { bytes } => {
                self.files_transferred += 1;
                self.bytes_transferred += bytes;
            }
            TransferOutcome::Skipped => {
                self.files_skipped += 1;
            }
        }
    }

    /// Fold another set of stats into this one
    pub fn merge(&mut self, other: &TransferStats) {
        self.files_transferred += other.files_transferred;
        self.files_skipped += other.files_skipped;
        self.bytes_transferred += other.bytes_transferred;
    }

    pub fn total_files(&self) -> usize {
        self.files_transferred + self.files_skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counts_outcomes() {
        let mut stats = TransferStats::new();
        stats.update(&TransferOutcome::Transferred { bytes: 10 });
        stats.update(&TransferOutcome::Skipped);
        stats.update(&TransferOutcome::Transferred { bytes: 5 });

        assert_eq!(stats.files_transferred, 2);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(stats.bytes_transferred, 15);
        assert_eq!(stats.total_files(), 3);
    }

    #[test]
    fn test_merge() {
        let mut left = TransferStats {
            files_transferred: 1,
            files_skipped: 2,
            bytes_transferred: 100,
        };
        let right = TransferStats {
            files_transferred: 3,
            files_skipped: 0,
            bytes_transferred: 50,
        };
        left.merge(&right);

        assert_eq!(left.files_transferred, 4);
        assert_eq!(left.files_skipped, 2);
        assert_eq!(left.bytes_transferred, 150);
    }
}
