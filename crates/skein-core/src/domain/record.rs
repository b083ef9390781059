//! ServiceRecord - スケジュール可能な作業単位
//!
//! # 不変条件
//! - `id` は最初の永続化で一度だけ割り当てられる
//! - `parentServiceId` があれば `rootServiceId` は最上位の祖先を指す
//! - `dependenciesIds` に自分自身は入らない
//! - `events` は追記のみ（縮まない）
//!
//! 状態や親子関係を変えるメソッドは、in-memory の値を更新したうえで
//! 同じ変更を表す `FieldUpdates` を返す。呼び出し側はそれを store に渡す。

use crate::domain::errors::{ServiceError, ServiceResult};
use crate::domain::events::{EventType, ServiceEvent};
use crate::domain::ids::ServiceId;
use crate::domain::notification::NotificationRegistration;
use crate::domain::state::ServiceState;
use crate::domain::update::{FieldUpdates, RecordField};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Where a processor runs the work. Opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingLocation {
    Local,
    SgeDrmaa,
    LsfDrmaa,
    LsfJava,
    LsfPac,
}

impl ProcessingLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingLocation::Local => "LOCAL",
            ProcessingLocation::SgeDrmaa => "SGE_DRMAA",
            ProcessingLocation::LsfDrmaa => "LSF_DRMAA",
            ProcessingLocation::LsfJava => "LSF_JAVA",
            ProcessingLocation::LsfPac => "LSF_PAC",
        }
    }
}

impl fmt::Display for ProcessingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ServiceId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default = "default_state")]
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_location: Option<ProcessingLocation>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_service_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_service_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies_ids: Vec<ServiceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub dictionary_args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ServiceEvent>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processing_stage_notifications: BTreeMap<String, NotificationRegistration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serializable_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<DateTime<Utc>>,
}

fn default_state() -> ServiceState {
    ServiceState::Created
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> ServiceResult<Value> {
    serde_json::to_value(value).map_err(|e| ServiceError::validation(e.to_string()))
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: None,
            description: None,
            owner: None,
            state: ServiceState::Created,
            processing_location: None,
            priority: 0,
            queue_id: None,
            parent_service_id: None,
            root_service_id: None,
            dependencies_ids: Vec::new(),
            args: Vec::new(),
            dictionary_args: Map::new(),
            resources: BTreeMap::new(),
            tags: Vec::new(),
            events: Vec::new(),
            processing_stage_notifications: BTreeMap::new(),
            lock_key: None,
            lock_timestamp: None,
            serializable_result: None,
            creation_date: None,
            modification_date: None,
        }
    }

    // ========================================
    // Builder-style setters (used before the first save)
    // ========================================

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_processing_location(mut self, location: ProcessingLocation) -> Self {
        self.processing_location = Some(location);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_dictionary_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.dictionary_args.insert(key.into(), value.into());
        self
    }

    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_notification(
        mut self,
        stage_name: impl Into<String>,
        registration: NotificationRegistration,
    ) -> Self {
        self.processing_stage_notifications
            .insert(stage_name.into(), registration);
        self
    }

    // ========================================
    // Queries
    // ========================================

    pub fn is_root(&self) -> bool {
        self.parent_service_id.is_none()
    }

    /// Id of the hierarchy this record belongs to.
    pub fn hierarchy_root_id(&self) -> Option<ServiceId> {
        self.root_service_id.or(self.id)
    }

    pub fn resource(&self, key: &str) -> Option<&str> {
        self.resources.get(key).map(String::as_str)
    }

    pub fn has_dependency(&self, id: ServiceId) -> bool {
        self.dependencies_ids.contains(&id)
    }

    /// `name@version`, the registry key used to pick a processor.
    pub fn processor_key(&self) -> String {
        format!("{}@{}", self.name, self.version.as_deref().unwrap_or(""))
    }

    pub fn require_id(&self) -> ServiceResult<ServiceId> {
        self.id.ok_or_else(|| {
            ServiceError::validation(format!("service '{}' has not been persisted", self.name))
        })
    }

    // ========================================
    // Mutations that produce store updates
    // ========================================

    /// Moves the record to `next` and records an `UPDATE_STATE` event.
    pub fn update_state(
        &mut self,
        next: ServiceState,
        now: DateTime<Utc>,
    ) -> ServiceResult<FieldUpdates> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.force_state(next, now)
    }

    /// RUNNING → QUEUED. Only an explicit restart goes through here.
    pub fn restart_state(&mut self, now: DateTime<Utc>) -> ServiceResult<FieldUpdates> {
        if !self.state.can_restart() {
            return Err(ServiceError::InvalidTransition {
                from: self.state,
                to: ServiceState::Queued,
            });
        }
        self.force_state(ServiceState::Queued, now)
    }

    fn force_state(
        &mut self,
        next: ServiceState,
        now: DateTime<Utc>,
    ) -> ServiceResult<FieldUpdates> {
        let description = format!("Update state from {} -> {}", self.state, next);
        self.state = next;
        let state_update = FieldUpdates::new().set(RecordField::State, next.as_str());
        let event_update = self.add_event(EventType::UpdateState, description, now)?;
        Ok(state_update.merge(event_update))
    }

    pub fn add_event(
        &mut self,
        kind: EventType,
        value: impl Into<String>,
        now: DateTime<Utc>,
    ) -> ServiceResult<FieldUpdates> {
        let event = ServiceEvent::new(kind, value, now);
        let json = to_json(&event)?;
        self.events.push(event);
        Ok(FieldUpdates::new().append(RecordField::Events, json))
    }

    /// Links this record under `parent` and inherits its priority.
    pub fn update_parent_service(&mut self, parent: &ServiceRecord) -> ServiceResult<FieldUpdates> {
        let parent_id = parent.require_id()?;
        if self.id == Some(parent_id) {
            return Err(ServiceError::validation(format!(
                "{parent_id} cannot be its own parent"
            )));
        }
        let root_id = parent.root_service_id.unwrap_or(parent_id);

        self.parent_service_id = Some(parent_id);
        self.root_service_id = Some(root_id);
        let mut updates = FieldUpdates::new()
            .set(RecordField::ParentServiceId, to_json(&parent_id)?)
            .set(RecordField::RootServiceId, to_json(&root_id)?);

        if self.priority <= parent.priority {
            self.priority = parent.priority.saturating_add(1);
            updates = updates.set(RecordField::Priority, self.priority);
        }
        Ok(updates)
    }

    /// Adds `dependency` to `dependenciesIds`, keeping it duplicate-free.
    pub fn add_service_dependency(&mut self, dependency: ServiceId) -> ServiceResult<FieldUpdates> {
        if self.id == Some(dependency) {
            return Err(ServiceError::validation(format!(
                "{dependency} cannot depend on itself"
            )));
        }
        if self.dependencies_ids.contains(&dependency) {
            return Ok(FieldUpdates::new());
        }
        self.dependencies_ids.push(dependency);
        Ok(FieldUpdates::new().add_to_set(RecordField::DependenciesIds, to_json(&dependency)?))
    }

    pub fn set_result(&mut self, result: Value) -> FieldUpdates {
        self.serializable_result = Some(result.clone());
        FieldUpdates::new().set(RecordField::SerializableResult, result)
    }

    // ========================================
    // Document conversion
    // ========================================

    pub fn to_document(&self) -> ServiceResult<Map<String, Value>> {
        match to_json(self)? {
            Value::Object(map) => Ok(map),
            other => Err(ServiceError::validation(format!(
                "record did not serialize to an object: {other}"
            ))),
        }
    }

    pub fn from_document(doc: Map<String, Value>) -> ServiceResult<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| ServiceError::storage(format!("malformed service document: {e}")))
    }
}
