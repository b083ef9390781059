//! Field-level partial updates of a ServiceRecord document.
//!
//! # Document モデル
//! ServiceRecord は camelCase キーの JSON document として保存される。
//! 値が無いフィールドは document にキー自体が存在しない。
//!
//! `FieldUpdates` は (フィールド, 操作) の順序付きリストで、
//! store はこれを 1 レコードに対してアトミックに適用する。

use crate::domain::errors::{ServiceError, ServiceResult};
use serde_json::{Map, Value};
use std::fmt;

/// RecordField は document のトップレベルキー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordField {
    Id,
    Name,
    Version,
    Description,
    Owner,
    State,
    ProcessingLocation,
    Priority,
    QueueId,
    ParentServiceId,
    RootServiceId,
    DependenciesIds,
    Args,
    DictionaryArgs,
    Resources,
    Tags,
    Events,
    ProcessingStageNotifications,
    LockKey,
    LockTimestamp,
    SerializableResult,
    CreationDate,
    ModificationDate,
}

impl RecordField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Id => "id",
            RecordField::Name => "name",
            RecordField::Version => "version",
            RecordField::Description => "description",
            RecordField::Owner => "owner",
            RecordField::State => "state",
            RecordField::ProcessingLocation => "processingLocation",
            RecordField::Priority => "priority",
            RecordField::QueueId => "queueId",
            RecordField::ParentServiceId => "parentServiceId",
            RecordField::RootServiceId => "rootServiceId",
            RecordField::DependenciesIds => "dependenciesIds",
            RecordField::Args => "args",
            RecordField::DictionaryArgs => "dictionaryArgs",
            RecordField::Resources => "resources",
            RecordField::Tags => "tags",
            RecordField::Events => "events",
            RecordField::ProcessingStageNotifications => "processingStageNotifications",
            RecordField::LockKey => "lockKey",
            RecordField::LockTimestamp => "lockTimestamp",
            RecordField::SerializableResult => "serializableResult",
            RecordField::CreationDate => "creationDate",
            RecordField::ModificationDate => "modificationDate",
        }
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FieldOp は 1 フィールドへの操作
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// キーを削除する
    Unset,
    /// 値を置き換える（Null は Unset と同じ扱い）
    Set(Value),
    /// 配列の末尾に追加する（配列が無ければ作る）
    Append(Value),
    /// 配列に含まれていなければ追加する
    AddToSet(Value),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldUpdates {
    ops: Vec<(RecordField, FieldOp)>,
}

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unset(mut self, field: RecordField) -> Self {
        self.ops.push((field, FieldOp::Unset));
        self
    }

    pub fn set(mut self, field: RecordField, value: impl Into<Value>) -> Self {
        self.ops.push((field, FieldOp::Set(value.into())));
        self
    }

    pub fn append(mut self, field: RecordField, value: impl Into<Value>) -> Self {
        self.ops.push((field, FieldOp::Append(value.into())));
        self
    }

    pub fn add_to_set(mut self, field: RecordField, value: impl Into<Value>) -> Self {
        self.ops.push((field, FieldOp::AddToSet(value.into())));
        self
    }

    pub fn push(&mut self, field: RecordField, op: FieldOp) {
        self.ops.push((field, op));
    }

    /// Appends `other` after the current operations.
    pub fn merge(mut self, other: FieldUpdates) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn contains(&self, field: RecordField) -> bool {
        self.ops.iter().any(|(f, _)| *f == field)
    }

    /// Last operation recorded for `field`.
    pub fn get(&self, field: RecordField) -> Option<&FieldOp> {
        self.ops.iter().rev().find(|(f, _)| *f == field).map(|(_, op)| op)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(RecordField, FieldOp)> {
        self.ops.iter()
    }

    /// Applies every operation, in order, to a record document.
    ///
    /// Fails without touching `doc` if an array operation targets a non-array value.
    pub fn apply(&self, doc: &mut Map<String, Value>) -> ServiceResult<()> {
        let mut staged = doc.clone();
        for (field, op) in &self.ops {
            let key = field.as_str();
            match op {
                FieldOp::Unset | FieldOp::Set(Value::Null) => {
                    staged.remove(key);
                }
                FieldOp::Set(value) => {
                    staged.insert(key.to_string(), value.clone());
                }
                FieldOp::Append(value) => {
                    array_entry(&mut staged, *field)?.push(value.clone());
                }
                FieldOp::AddToSet(value) => {
                    let arr = array_entry(&mut staged, *field)?;
                    if !arr.contains(value) {
                        arr.push(value.clone());
                    }
                }
            }
        }
        *doc = staged;
        Ok(())
    }
}

fn array_entry(doc: &mut Map<String, Value>, field: RecordField) -> ServiceResult<&mut Vec<Value>> {
    let entry = doc
        .entry(field.as_str().to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    match entry {
        Value::Array(arr) => Ok(arr),
        other => Err(ServiceError::validation(format!(
            "{field} is not an array (found {other})"
        ))),
    }
}

/// UpdateCondition は compare_and_update の前提条件
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateCondition {
    /// フィールドが未設定、または `value` と等しい
    UnsetOrEquals { field: RecordField, value: Value },
}

impl UpdateCondition {
    pub fn unset_or_equals(field: RecordField, value: impl Into<Value>) -> Self {
        UpdateCondition::UnsetOrEquals {
            field,
            value: value.into(),
        }
    }

    pub fn holds(&self, doc: &Map<String, Value>) -> bool {
        match self {
            UpdateCondition::UnsetOrEquals { field, value } => match doc.get(field.as_str()) {
                None | Some(Value::Null) => true,
                Some(current) => current == value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn set_and_unset_touch_only_named_keys() {
        let mut d = doc(json!({"name": "a", "owner": "bob", "queueId": "q1"}));
        FieldUpdates::new()
            .set(RecordField::Name, "b")
            .unset(RecordField::QueueId)
            .apply(&mut d)
            .unwrap();

        assert_eq!(d, doc(json!({"name": "b", "owner": "bob"})));
    }

    #[test]
    fn set_null_removes_key() {
        let mut d = doc(json!({"lockKey": "k"}));
        FieldUpdates::new()
            .set(RecordField::LockKey, Value::Null)
            .apply(&mut d)
            .unwrap();
        assert!(!d.contains_key("lockKey"));
    }

    #[test]
    fn append_creates_array_and_keeps_order() {
        let mut d = doc(json!({}));
        FieldUpdates::new()
            .append(RecordField::Args, "x")
            .append(RecordField::Args, "y")
            .append(RecordField::Args, "x")
            .apply(&mut d)
            .unwrap();
        assert_eq!(d["args"], json!(["x", "y", "x"]));
    }

    #[test]
    fn add_to_set_skips_duplicates() {
        let mut d = doc(json!({"tags": ["a"]}));
        FieldUpdates::new()
            .add_to_set(RecordField::Tags, "a")
            .add_to_set(RecordField::Tags, "b")
            .apply(&mut d)
            .unwrap();
        assert_eq!(d["tags"], json!(["a", "b"]));
    }

    #[test]
    fn array_op_on_scalar_fails_atomically() {
        let mut d = doc(json!({"name": "a", "tags": "oops"}));
        let err = FieldUpdates::new()
            .set(RecordField::Name, "changed")
            .append(RecordField::Tags, "t")
            .apply(&mut d)
            .unwrap_err();

        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(d["name"], "a");
    }

    #[test]
    fn last_op_wins_for_lookup() {
        let updates = FieldUpdates::new()
            .set(RecordField::QueueId, "q1")
            .set(RecordField::QueueId, "q2");
        assert_eq!(updates.get(RecordField::QueueId), Some(&FieldOp::Set(json!("q2"))));
        assert!(updates.contains(RecordField::QueueId));
        assert!(!updates.contains(RecordField::Owner));
    }

    #[test]
    fn unset_or_equals_condition() {
        let cond = UpdateCondition::unset_or_equals(RecordField::QueueId, "mine");
        assert!(cond.holds(&doc(json!({}))));
        assert!(cond.holds(&doc(json!({"queueId": "mine"}))));
        assert!(!cond.holds(&doc(json!({"queueId": "theirs"}))));
    }
}
