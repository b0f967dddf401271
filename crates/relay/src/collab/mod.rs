// Collaborative rooms: shared document, sequenced operation log and edit
// locks, one mutex per room.

pub mod document;
pub mod locks;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use huddle_common::types::{Operation, OperationRequest};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::CollabError;
use locks::EditLockTable;

#[derive(Debug)]
pub struct RoomState {
    room_id: String,
    document: Value,
    log: VecDeque<Operation>,
    last_seq: u64,
    log_capacity: usize,
    max_document_bytes: usize,
    locks: EditLockTable,
}

impl RoomState {
    pub fn new(room_id: impl Into<String>, log_capacity: usize, max_document_bytes: usize) -> Self {
        Self {
            room_id: room_id.into(),
            document: Value::Object(Map::new()),
            log: VecDeque::new(),
            last_seq: 0,
            log_capacity: log_capacity.max(1),
            max_document_bytes,
            locks: EditLockTable::default(),
        }
    }

    /// Sequence and apply an operation.
    ///
    /// The operation runs against a copy of the document; the copy replaces
    /// the document and a sequence number is consumed only if the operation
    /// is valid and the result fits within the size limit.
    pub fn apply(&mut self, request: OperationRequest) -> Result<Operation, CollabError> {
        let timestamp = Utc::now();
        let mut scratch = self.document.clone();
        document::apply_operation(
            &mut scratch,
            &request.kind,
            request.identity_id.as_deref(),
            timestamp,
        )?;

        let size = document::serialized_len(&scratch);
        if size > self.max_document_bytes {
            return Err(CollabError::DocumentTooLarge { size, limit: self.max_document_bytes });
        }

        self.document = scratch;
        self.last_seq += 1;
        let operation = Operation {
            seq: self.last_seq,
            kind: request.kind,
            author_id: request.identity_id,
            timestamp,
        };

        while self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(operation.clone());
        debug!(room_id = %self.room_id, seq = operation.seq, kind = operation.kind.name(), "operation applied");
        Ok(operation)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// The most recent `limit` operations, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Operation> {
        let skip = self.log.len().saturating_sub(limit);
        self.log.iter().skip(skip).cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn locks(&self) -> &EditLockTable {
        &self.locks
    }

    pub fn locks_mut(&mut self) -> &mut EditLockTable {
        &mut self.locks
    }
}

pub type SharedRoom = Arc<Mutex<RoomState>>;

/// All rooms opened so far. Rooms are created by the first join and kept
/// for the life of the process.
#[derive(Debug)]
pub struct RoomEngine {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    log_capacity: usize,
    max_document_bytes: usize,
}

impl RoomEngine {
    pub fn new(log_capacity: usize, max_document_bytes: usize) -> Self {
        Self { rooms: RwLock::default(), log_capacity, max_document_bytes }
    }

    pub async fn open_room(&self, room_id: &str) -> SharedRoom {
        if let Some(existing) = self.rooms.read().await.get(room_id) {
            return Arc::clone(existing);
        }
        let mut guard = self.rooms.write().await;
        let room = guard.entry(room_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(RoomState::new(
                room_id,
                self.log_capacity,
                self.max_document_bytes,
            )))
        });
        Arc::clone(room)
    }

    pub async fn room(&self, room_id: &str) -> Result<SharedRoom, CollabError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| CollabError::RoomNotFound(room_id.to_string()))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::types::OperationKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn set_value(path: &str, value: Value) -> OperationRequest {
        OperationRequest {
            kind: OperationKind::SetValue { path: path.to_string(), value },
            identity_id: Some("alice".to_string()),
        }
    }

    #[test]
    fn applied_operations_are_stamped_and_logged() {
        let mut room = RoomState::new("planning", 100, 1024);
        let first = room.apply(set_value("title", json!("Q3"))).expect("first op applies");
        let second = room.apply(set_value("owner", json!("alice"))).expect("second op applies");

        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(second.author_id.as_deref(), Some("alice"));
        assert_eq!(room.document(), &json!({ "title": "Q3", "owner": "alice" }));
        assert_eq!(room.history(1), vec![second]);
    }

    #[test]
    fn rejected_operations_do_not_consume_sequence_numbers() {
        let mut room = RoomState::new("planning", 100, 64);
        room.apply(set_value("title", json!("ok"))).expect("small op applies");

        let too_big = room.apply(set_value("body", json!("x".repeat(100))));
        assert!(matches!(too_big, Err(CollabError::DocumentTooLarge { limit: 64, .. })));
        let invalid = room.apply(set_value("a..b", json!(1)));
        assert!(matches!(invalid, Err(CollabError::InvalidOperation(_))));

        assert_eq!(room.document(), &json!({ "title": "ok" }));
        let next = room.apply(set_value("done", json!(true))).expect("next op applies");
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn log_keeps_most_recent_operations() {
        let mut room = RoomState::new("planning", 3, 1 << 20);
        for i in 0..5 {
            room.apply(set_value("counter", json!(i))).expect("op applies");
        }
        let seqs: Vec<u64> = room.history(10).iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(room.last_seq(), 5);
    }

    #[tokio::test]
    async fn unknown_room_is_not_found_until_opened() {
        let engine = RoomEngine::new(100, 1 << 20);
        assert_eq!(
            engine.room("planning").await.expect_err("room was never opened"),
            CollabError::RoomNotFound("planning".to_string())
        );
        let opened = engine.open_room("planning").await;
        let found = engine.room("planning").await.expect("room is open");
        assert!(Arc::ptr_eq(&opened, &found));
        assert_eq!(engine.room_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_writers_get_gap_free_sequence() {
        let engine = Arc::new(RoomEngine::new(1000, 1 << 20));
        let room = engine.open_room("planning").await;

        let mut tasks = Vec::new();
        for writer in 0..8 {
            let room = Arc::clone(&room);
            tasks.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for i in 0..25 {
                    let op = room
                        .lock()
                        .await
                        .apply(set_value(&format!("w{writer}.n{i}"), json!(i)))
                        .expect("op applies");
                    seqs.push(op.seq);
                }
                seqs
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let seqs = task.await.expect("writer task should finish");
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<u64>>());
    }

    proptest! {
        #[test]
        fn sequence_is_gap_free_across_mixed_outcomes(
            paths in proptest::collection::vec("[a-c]{0,2}(\\.[a-c]{0,2}){0,2}", 1..60),
            capacity in 1usize..10,
        ) {
            let mut room = RoomState::new("planning", capacity, 1 << 20);
            let mut expected = 0u64;
            for path in paths {
                match room.apply(set_value(&path, json!(1))) {
                    Ok(op) => {
                        expected += 1;
                        prop_assert_eq!(op.seq, expected);
                    }
                    Err(_) => prop_assert_eq!(room.last_seq(), expected),
                }
                prop_assert!(room.log_len() <= capacity);
            }
            let history = room.history(capacity);
            prop_assert!(history.windows(2).all(|pair| pair[1].seq == pair[0].seq + 1));
        }
    }
}
