//! Shared document store: one collaborative text buffer and three
//! collaborative key-value maps, backed by a Yrs `Doc`.
//!
//! ```text
//! ┌─────────────────────── SharedDoc ───────────────────────┐
//! │  Text "code"              Map "lobbyState"               │
//! │  (position-preserving)    Map "executionState"           │
//! │                           Map "executionResults"         │
//! │                           (last-writer-wins per field)   │
//! └──────────────┬──────────────────────────────┬────────────┘
//!       local edit → encoded v1 update     remote update → apply
//!                  └────────── DocChange list ──┘
//! ```
//!
//! Every mutation, local or remote, is followed by a comparison against the
//! last observed state, so callers learn exactly which fields changed.
//! Map values are plain JSON-shaped data converted to and from `yrs::Any`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared code buffer.
pub const CODE_TEXT: &str = "code";

/// Largest integer a JS number represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Field name → value for one shared map.
pub type Fields = BTreeMap<String, Value>;

/// The three durable key-value maps of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SharedMap {
    Lobby,
    ExecutionState,
    ExecutionResults,
}

impl SharedMap {
    pub const ALL: [SharedMap; 3] = [
        SharedMap::Lobby,
        SharedMap::ExecutionState,
        SharedMap::ExecutionResults,
    ];

    /// Root name inside the Yrs document.
    pub fn name(&self) -> &'static str {
        match self {
            SharedMap::Lobby => "lobbyState",
            SharedMap::ExecutionState => "executionState",
            SharedMap::ExecutionResults => "executionResults",
        }
    }
}

/// What a mutation changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocChange {
    Text,
    Map { map: SharedMap, keys: BTreeSet<String> },
}

/// Result of a local mutation: the update to broadcast and what changed.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub update: Vec<u8>,
    pub changes: Vec<DocChange>,
}

/// Document store errors.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("Failed to decode update: {0}")]
    Decode(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),

    #[error("Edit out of bounds: offset {offset} with length {len} exceeds text length {text_len}")]
    OutOfBounds { offset: u32, len: u32, text_len: u32 },

    #[error("Offset {0} is not on a character boundary")]
    CharBoundary(u32),

    #[error("Value conversion failed: {0}")]
    Value(#[from] serde_json::Error),
}

/// Last observed state, used to derive `DocChange`s.
#[derive(Debug, Clone, Default, PartialEq)]
struct Observed {
    text: String,
    maps: BTreeMap<SharedMap, Fields>,
}

/// One replica of a room's shared document.
pub struct SharedDoc {
    doc: Doc,
    code: TextRef,
    lobby: MapRef,
    execution_state: MapRef,
    execution_results: MapRef,
    observed: Observed,
}

impl SharedDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let code = doc.get_or_insert_text(CODE_TEXT);
        let lobby = doc.get_or_insert_map(SharedMap::Lobby.name());
        let execution_state = doc.get_or_insert_map(SharedMap::ExecutionState.name());
        let execution_results = doc.get_or_insert_map(SharedMap::ExecutionResults.name());

        Self {
            doc,
            code,
            lobby,
            execution_state,
            execution_results,
            observed: Observed::default(),
        }
    }

    fn map_ref(&self, map: SharedMap) -> &MapRef {
        match map {
            SharedMap::Lobby => &self.lobby,
            SharedMap::ExecutionState => &self.execution_state,
            SharedMap::ExecutionResults => &self.execution_results,
        }
    }

    // ── Text ─────────────────────────────────────────────────────

    /// Current contents of the code buffer.
    pub fn text(&self) -> &str {
        &self.observed.text
    }

    /// Length of the code buffer in bytes.
    pub fn text_len(&self) -> u32 {
        self.observed.text.len() as u32
    }

    /// Insert `chunk` at byte `offset`.
    pub fn insert_text(&mut self, offset: u32, chunk: &str) -> Result<LocalUpdate, DocError> {
        self.check_range(offset, 0)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            self.code.insert(&mut txn, offset, chunk);
            txn.encode_update_v1()
        };
        Ok(LocalUpdate {
            update,
            changes: self.observe(),
        })
    }

    /// Delete `len` bytes starting at byte `offset`.
    pub fn delete_text(&mut self, offset: u32, len: u32) -> Result<LocalUpdate, DocError> {
        self.check_range(offset, len)?;
        let update = {
            let mut txn = self.doc.transact_mut();
            self.code.remove_range(&mut txn, offset, len);
            txn.encode_update_v1()
        };
        Ok(LocalUpdate {
            update,
            changes: self.observe(),
        })
    }

    fn check_range(&self, offset: u32, len: u32) -> Result<(), DocError> {
        let text = &self.observed.text;
        let end = offset as usize + len as usize;
        if end > text.len() {
            return Err(DocError::OutOfBounds {
                offset,
                len,
                text_len: text.len() as u32,
            });
        }
        if !text.is_char_boundary(offset as usize) {
            return Err(DocError::CharBoundary(offset));
        }
        if !text.is_char_boundary(end) {
            return Err(DocError::CharBoundary(end as u32));
        }
        Ok(())
    }

    // ── Maps ─────────────────────────────────────────────────────

    /// All fields currently set on `map`.
    pub fn fields(&self, map: SharedMap) -> &Fields {
        static EMPTY: Fields = BTreeMap::new();
        self.observed.maps.get(&map).unwrap_or(&EMPTY)
    }

    /// Read one field, deserialized. Absent and `null` both read as `None`.
    pub fn field<T: DeserializeOwned>(&self, map: SharedMap, key: &str) -> Result<Option<T>, DocError> {
        match self.fields(map).get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    /// Write one field.
    pub fn set_field(&mut self, map: SharedMap, key: &str, value: Value) -> LocalUpdate {
        self.set_fields(map, [(key.to_string(), value)])
    }

    /// Write several fields of one map in a single transaction.
    /// Each field is an independent last-writer-wins register.
    pub fn set_fields<I>(&mut self, map: SharedMap, fields: I) -> LocalUpdate
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let update = {
            let map_ref = self.map_ref(map);
            let mut txn = self.doc.transact_mut();
            for (key, value) in fields {
                map_ref.insert(&mut txn, key, json_to_any(&value));
            }
            txn.encode_update_v1()
        };
        LocalUpdate {
            update,
            changes: self.observe(),
        }
    }

    // ── Replication ──────────────────────────────────────────────

    /// Integrate a remote v1 update. Re-applying a known update is a no-op.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<Vec<DocChange>, DocError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocError::Decode(e.to_string()))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocError::Apply(e.to_string()))?;
        }
        Ok(self.observe())
    }

    /// Encoded state vector of this replica.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let remote_sv = StateVector::decode_v1(state_vector).map_err(|e| DocError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    // ── Change detection ─────────────────────────────────────────

    fn read_observed(&self) -> Observed {
        let txn = self.doc.transact();
        let text = self.code.get_string(&txn);
        let maps = SharedMap::ALL
            .iter()
            .map(|map| (*map, read_fields(self.map_ref(*map), &txn)))
            .collect();
        Observed { text, maps }
    }

    fn observe(&mut self) -> Vec<DocChange> {
        let current = self.read_observed();
        let mut changes = Vec::new();

        if current.text != self.observed.text {
            changes.push(DocChange::Text);
        }
        for map in SharedMap::ALL {
            let before = self.observed.maps.get(&map);
            let after = current.maps.get(&map);
            let keys = changed_keys(before, after);
            if !keys.is_empty() {
                changes.push(DocChange::Map { map, keys });
            }
        }

        self.observed = current;
        changes
    }
}

impl Default for SharedDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn read_fields<T: ReadTxn>(map: &MapRef, txn: &T) -> Fields {
    map.iter(txn)
        .map(|(key, out)| (key.to_string(), out_to_json(&out)))
        .collect()
}

fn changed_keys(before: Option<&Fields>, after: Option<&Fields>) -> BTreeSet<String> {
    let empty = Fields::new();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    before
        .keys()
        .chain(after.keys())
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect()
}

fn out_to_json(out: &Out) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        // Nested shared types are never written by this crate.
        _ => Value::Null,
    }
}

/// Convert a Yrs value into JSON. Whole numbers come back as integers.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => number_to_json(*n),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), any_to_json(value)))
                .collect(),
        ),
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Convert JSON into a Yrs value. Numbers are stored like JS numbers.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) if (i as f64).abs() <= MAX_SAFE_INTEGER => Any::Number(i as f64),
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(entries) => Any::Map(Arc::new(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sync_both(a: &mut SharedDoc, b: &mut SharedDoc) {
        let to_b = a.diff_since(&b.state_vector()).unwrap();
        let to_a = b.diff_since(&a.state_vector()).unwrap();
        b.apply_update(&to_b).unwrap();
        a.apply_update(&to_a).unwrap();
    }

    #[test]
    fn test_new_doc_is_empty() {
        let doc = SharedDoc::new();
        assert_eq!(doc.text(), "");
        for map in SharedMap::ALL {
            assert!(doc.fields(map).is_empty());
        }
    }

    #[test]
    fn test_insert_reports_text_change() {
        let mut doc = SharedDoc::new();
        let local = doc.insert_text(0, "def solve(): pass").unwrap();

        assert!(!local.update.is_empty());
        assert_eq!(local.changes, vec![DocChange::Text]);
        assert_eq!(doc.text(), "def solve(): pass");
    }

    #[test]
    fn test_remote_update_converges_in_any_order() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();
        let mut c = SharedDoc::new();
        let mut d = SharedDoc::new();

        let u1 = a.insert_text(0, "hello").unwrap().update;
        let u2 = b.insert_text(0, "world").unwrap().update;
        let u3 = a.insert_text(5, "!").unwrap().update;

        c.apply_update(&u1).unwrap();
        c.apply_update(&u2).unwrap();
        c.apply_update(&u3).unwrap();

        // Reverse order: u3 depends on u1 and waits until it arrives.
        d.apply_update(&u3).unwrap();
        d.apply_update(&u2).unwrap();
        d.apply_update(&u1).unwrap();

        assert_eq!(c.text(), d.text());
        assert_eq!(c.text().len(), "hello!world".len());
    }

    #[test]
    fn test_duplicate_update_is_idempotent() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();
        let update = a.insert_text(0, "abc").unwrap().update;

        let first = b.apply_update(&update).unwrap();
        let second = b.apply_update(&update).unwrap();

        assert_eq!(first, vec![DocChange::Text]);
        assert!(second.is_empty());
        assert_eq!(b.text(), "abc");
    }

    #[test]
    fn test_concurrent_insert_and_delete_at_different_offsets() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();
        let seed = a.insert_text(0, "0123456789").unwrap().update;
        b.apply_update(&seed).unwrap();

        a.insert_text(2, "ab").unwrap();
        b.delete_text(6, 3).unwrap();
        sync_both(&mut a, &mut b);

        assert_eq!(a.text(), "01ab23459");
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn test_concurrent_writes_to_different_fields_both_survive() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();

        a.set_field(SharedMap::Lobby, "isGameStarted", json!(true));
        b.set_field(SharedMap::Lobby, "selectedProblem", json!({"id": "2"}));
        sync_both(&mut a, &mut b);

        for doc in [&a, &b] {
            assert_eq!(doc.fields(SharedMap::Lobby).get("isGameStarted"), Some(&json!(true)));
            assert_eq!(
                doc.fields(SharedMap::Lobby).get("selectedProblem"),
                Some(&json!({"id": "2"}))
            );
        }
    }

    #[test]
    fn test_concurrent_writes_to_same_field_pick_one_winner() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();

        a.set_field(SharedMap::Lobby, "hostId", json!(1));
        b.set_field(SharedMap::Lobby, "hostId", json!(2));
        sync_both(&mut a, &mut b);

        let winner_a = a.fields(SharedMap::Lobby).get("hostId").cloned();
        let winner_b = b.fields(SharedMap::Lobby).get("hostId").cloned();
        assert_eq!(winner_a, winner_b);
        assert!(winner_a == Some(json!(1)) || winner_a == Some(json!(2)));
    }

    #[test]
    fn test_map_change_names_only_changed_keys() {
        let mut doc = SharedDoc::new();
        doc.set_fields(
            SharedMap::ExecutionState,
            [
                ("isRunning".to_string(), json!(true)),
                ("showResults".to_string(), json!(true)),
            ],
        );

        let local = doc.set_fields(
            SharedMap::ExecutionState,
            [
                ("isRunning".to_string(), json!(false)),
                ("showResults".to_string(), json!(true)),
            ],
        );

        let expected: BTreeSet<String> = ["isRunning".to_string()].into_iter().collect();
        assert_eq!(
            local.changes,
            vec![DocChange::Map {
                map: SharedMap::ExecutionState,
                keys: expected,
            }]
        );
    }

    #[test]
    fn test_structured_values_keep_integers() {
        let mut a = SharedDoc::new();
        let mut b = SharedDoc::new();
        let result = json!({
            "status": "success",
            "executionTimeMs": 12,
            "ratio": 0.5,
            "tags": ["array", "hash-table"],
            "errorMessage": null,
        });
        let update = a.set_field(SharedMap::ExecutionResults, "runResult", result.clone()).update;
        b.apply_update(&update).unwrap();

        assert_eq!(b.fields(SharedMap::ExecutionResults).get("runResult"), Some(&result));
        let ms: Option<u64> = b.field(SharedMap::ExecutionResults, "runResult")
            .unwrap()
            .and_then(|v: Value| v.get("executionTimeMs").and_then(Value::as_u64));
        assert_eq!(ms, Some(12));
    }

    #[test]
    fn test_null_field_reads_as_none() {
        let mut doc = SharedDoc::new();
        doc.set_field(SharedMap::ExecutionResults, "submitResult", Value::Null);
        let read: Option<Value> = doc.field(SharedMap::ExecutionResults, "submitResult").unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn test_out_of_bounds_edit_is_an_error() {
        let mut doc = SharedDoc::new();
        doc.insert_text(0, "abc").unwrap();

        assert!(matches!(doc.insert_text(4, "x"), Err(DocError::OutOfBounds { .. })));
        assert!(matches!(doc.delete_text(2, 2), Err(DocError::OutOfBounds { .. })));
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_edit_inside_multibyte_char_is_an_error() {
        let mut doc = SharedDoc::new();
        doc.insert_text(0, "é").unwrap();
        assert!(matches!(doc.insert_text(1, "x"), Err(DocError::CharBoundary(1))));
    }

    #[test]
    fn test_garbage_update_is_rejected() {
        let mut doc = SharedDoc::new();
        assert!(doc.apply_update(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_encode_state_restores_full_replica() {
        let mut a = SharedDoc::new();
        a.insert_text(0, "print(1)").unwrap();
        a.set_field(SharedMap::Lobby, "hostId", json!(4));

        let mut b = SharedDoc::new();
        b.apply_update(&a.encode_state()).unwrap();

        assert_eq!(b.text(), "print(1)");
        assert_eq!(b.fields(SharedMap::Lobby), a.fields(SharedMap::Lobby));
    }
}
