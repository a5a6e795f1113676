use std::collections::HashMap;
use std::sync::Mutex;

use crate::committable_batch::CommittableBatch;
use crate::topic_partition::TopicPartition;

/// Tracks, per partition, the offset already sync-committed ahead of
/// delivery under `AckMode::AtMostOnce` (`spec.md` §4.3). Consulted at
/// shutdown so the at-most-once commit-before-delivery work is never
/// redundantly re-committed.
#[derive(Default)]
pub struct AtMostOnceOffsets {
    committed_ahead: Mutex<HashMap<TopicPartition, i64>>,
}

impl AtMostOnceOffsets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_commit(&self, offsets: &HashMap<TopicPartition, crate::topic_partition::OffsetAndMetadata>) {
        let mut committed_ahead = self.committed_ahead.lock().unwrap();
        for (tp, oam) in offsets {
            let entry = committed_ahead.entry(tp.clone()).or_insert(oam.offset);
            if oam.offset > *entry {
                *entry = oam.offset;
            }
        }
    }

    /// If the committed-ahead offset for a partition exceeds what the batch
    /// has accumulated, the batch's pending offset for that partition is
    /// superseded (no re-commit needed). Returns whether any entry was
    /// corrected.
    pub fn undo_commit_ahead(&self, batch: &CommittableBatch) -> bool {
        let committed_ahead = self.committed_ahead.lock().unwrap();
        if committed_ahead.is_empty() {
            return false;
        }
        batch.supersede_if_committed_ahead(&committed_ahead)
    }
}
