//! Snapshot ordering and the subscriber channel.

use tokio::sync::mpsc;
use tracing::debug;

use super::state::ToolState;

/// One emitted snapshot: every known tool, stably sorted.
pub type Snapshot = Vec<ToolState>;

/// Sort rows by `output_index` ascending, rows without an index last, ties
/// broken by insertion sequence. Input pairs are `(insertion_seq, row)`.
pub fn sorted(rows: Vec<(u64, ToolState)>) -> Snapshot {
    let mut rows = rows;
    rows.sort_by_key(|(seq, row)| (row.output_index.unwrap_or(u64::MAX), *seq));
    rows.into_iter().map(|(_, row)| row).collect()
}

/// Single-subscriber snapshot channel.
///
/// The reducer is synchronous, so the channel is unbounded and `emit` never
/// blocks; ordering is the channel's FIFO order. A dropped receiver simply
/// disables emission.
#[derive(Debug, Default)]
pub struct SnapshotEmitter {
    tx: Option<mpsc::UnboundedSender<Snapshot>>,
}

impl SnapshotEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the subscriber end. A later call replaces the previous
    /// subscriber; there is one consumer per session.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Snapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx);
        rx
    }

    /// Hand a fresh snapshot to the subscriber, if one is listening.
    pub fn emit(&mut self, snapshot: Snapshot) {
        if let Some(tx) = &self.tx {
            if tx.send(snapshot).is_err() {
                debug!("snapshot receiver dropped, disabling emission");
                self.tx = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::ToolStatus;

    fn row(id: &str, output_index: Option<u64>) -> ToolState {
        let mut state = ToolState::new(id);
        state.output_index = output_index;
        state
    }

    #[test]
    fn test_indexed_rows_sort_ascending_unindexed_last() {
        let snapshot = sorted(vec![
            (0, row("c", None)),
            (1, row("b", Some(2))),
            (2, row("a", Some(0))),
        ]);
        let ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let snapshot = sorted(vec![
            (3, row("late", None)),
            (1, row("early", None)),
            (2, row("middle", None)),
        ]);
        let ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_emitter_delivers_in_order_and_survives_dropped_receiver() {
        let mut emitter = SnapshotEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit(vec![row("a", Some(0))]);
        emitter.emit(vec![row("a", Some(0)), row("b", Some(1))]);

        assert_eq!(rx.recv().await.unwrap().len(), 1);
        assert_eq!(rx.recv().await.unwrap().len(), 2);

        drop(rx);
        // No subscriber anymore: emission becomes a no-op, not a failure.
        emitter.emit(vec![row("c", None)]);

        let mut state = row("x", None);
        state.status = ToolStatus::InputAvailable;
        emitter.emit(vec![state]);
    }
}
