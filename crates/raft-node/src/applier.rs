//! # applier
//!
//! why: apply committed entries without blocking the consensus actor
//! relations: fed by replica.rs, reports back so gateway.rs can resolve proposals
//! what: Applied notice, spawn_applier task

use raft_core::LogEntry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::state_machine::StateMachine;

/// Output of the state machine for one log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: u64,
    pub output: Vec<u8>,
}

/// Apply entries from `entries` in the order received, skipping any index
/// at or below `last_applied`. Ends when either channel closes.
pub fn spawn_applier<M: StateMachine>(
    mut state_machine: M,
    last_applied: u64,
    mut entries: mpsc::UnboundedReceiver<LogEntry>,
    applied: mpsc::UnboundedSender<Applied>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_applied = last_applied;
        while let Some(entry) = entries.recv().await {
            if entry.index <= last_applied {
                warn!(index = entry.index, last_applied, "skipping already applied entry");
                continue;
            }
            if entry.index != last_applied + 1 {
                warn!(index = entry.index, last_applied, "gap in applied entries");
            }
            let output = state_machine.apply(&entry.command, entry.index);
            last_applied = entry.index;
            trace!(index = entry.index, "applied entry");
            if applied
                .send(Applied {
                    index: entry.index,
                    output,
                })
                .is_err()
            {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn applies_in_order_exactly_once() {
        let (entries_tx, entries_rx) = mpsc::unbounded_channel();
        let (applied_tx, mut applied_rx) = mpsc::unbounded_channel();
        let record = |command: &[u8], index: u64| {
            let mut out = index.to_string().into_bytes();
            out.extend_from_slice(command);
            out
        };
        let task = spawn_applier(record, 0, entries_rx, applied_tx);

        entries_tx.send(LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        entries_tx.send(LogEntry::new(1, 2, b"b".to_vec())).unwrap();
        entries_tx.send(LogEntry::new(1, 2, b"b".to_vec())).unwrap();
        entries_tx.send(LogEntry::new(1, 3, b"c".to_vec())).unwrap();
        drop(entries_tx);

        let mut seen = Vec::new();
        while let Some(applied) = applied_rx.recv().await {
            seen.push(applied);
        }
        task.await.unwrap();

        assert_eq!(
            seen,
            vec![
                Applied { index: 1, output: b"1a".to_vec() },
                Applied { index: 2, output: b"2b".to_vec() },
                Applied { index: 3, output: b"3c".to_vec() },
            ]
        );
    }
}
