//! Replay support for token parsing over partial data.
//!
//! A token parser built on the `try_*` primitives consumes bytes as it goes
//! and returns `None` when it runs dry. Rather than making each parser undo
//! its own progress, the session records the cursor at the start of the
//! token and every network fill received while the token is incomplete.
//! Replaying restores the cursor and queues the fills, so the parser simply
//! starts the token again with more data behind it.

use std::collections::VecDeque;

use crate::buffer::{InBuffer, PartialHeader};

/// Cursor state captured when a snapshot starts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cursor {
    pub(crate) used: usize,
    pub(crate) read: usize,
    pub(crate) packet: usize,
    pub(crate) partial: PartialHeader,
    pub(crate) last_eom: bool,
}

/// Saved parse position plus the fills received after it.
#[derive(Debug)]
pub(crate) struct Snapshot {
    cursor: Cursor,
    /// Buffer contents at the start; captured on the first refill.
    first: Option<Vec<u8>>,
    /// Fills consumed or queued after `first`, in order.
    fills: Vec<Vec<u8>>,
}

impl Snapshot {
    /// Start a snapshot at `cursor`.
    ///
    /// When replayed fills are still queued the current buffer is captured
    /// immediately, since it will be overwritten by the queue rather than
    /// by a network read.
    pub(crate) fn new(cursor: Cursor, input: &InBuffer, queued: &VecDeque<Vec<u8>>) -> Self {
        let (first, fills) = if queued.is_empty() {
            (None, Vec::new())
        } else {
            (
                Some(input.filled().to_vec()),
                queued.iter().cloned().collect(),
            )
        };
        Self {
            cursor,
            first,
            fills,
        }
    }

    /// Keep the starting buffer before a network read overwrites it.
    pub(crate) fn prepare_fill(&mut self, input: &InBuffer) {
        if self.first.is_none() {
            self.first = Some(input.filled().to_vec());
        }
    }

    /// Record a fill received from the network.
    pub(crate) fn push_fill(&mut self, fill: &[u8]) {
        self.fills.push(fill.to_vec());
    }

    /// Restore `input` to the start position and queue the later fills.
    pub(crate) fn replay(&self, input: &mut InBuffer, queue: &mut VecDeque<Vec<u8>>) -> Cursor {
        if let Some(first) = &self.first {
            input.load(first);
        }
        input.used = self.cursor.used;
        input.read = self.cursor.read;
        input.packet = self.cursor.packet;

        queue.clear();
        queue.extend(self.fills.iter().cloned());
        self.cursor
    }

    /// Total bytes held by the snapshot.
    pub(crate) fn retained_bytes(&self) -> usize {
        self.first.as_ref().map_or(0, Vec::len) + self.fills.iter().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cursor_of(input: &InBuffer) -> Cursor {
        Cursor {
            used: input.used,
            read: input.read,
            packet: input.packet,
            partial: PartialHeader::default(),
            last_eom: false,
        }
    }

    #[test]
    fn test_replay_restores_first_fill_and_queues_rest() {
        let mut input = InBuffer::new(8);
        input.load(&[1, 2, 3, 4]);
        input.packet = 10;
        input.advance_body(2);

        let queue = VecDeque::new();
        let mut snapshot = Snapshot::new(cursor_of(&input), &input, &queue);
        input.advance_body(2);

        snapshot.prepare_fill(&input);
        input.load(&[5, 6, 7]);
        snapshot.push_fill(input.filled());
        input.advance_body(3);
        assert_eq!(snapshot.fills.len(), 1);

        let mut queue = VecDeque::new();
        let cursor = snapshot.replay(&mut input, &mut queue);
        assert_eq!(cursor.used, 2);
        assert_eq!(input.unread(), &[3, 4]);
        assert_eq!(input.packet, 8);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0], vec![5, 6, 7]);
        assert_eq!(snapshot.retained_bytes(), 7);
    }

    #[test]
    fn test_snapshot_over_queued_fills_captures_eagerly() {
        let mut input = InBuffer::new(8);
        input.load(&[1, 2]);
        input.packet = 4;
        let queue: VecDeque<Vec<u8>> = VecDeque::from(vec![vec![3, 4]]);

        let snapshot = Snapshot::new(cursor_of(&input), &input, &queue);
        input.load(&[3, 4]);

        let mut replay_queue = VecDeque::new();
        snapshot.replay(&mut input, &mut replay_queue);
        assert_eq!(input.unread(), &[1, 2]);
        assert_eq!(replay_queue.front().unwrap(), &vec![3, 4]);
    }
}
