//! Domain model (IDs, records, state machine, hierarchy, ...).
//!
//! I/O を持たない純粋なモジュールだけを置く。

pub mod dependency;
pub mod errors;
pub mod events;
pub mod hierarchy;
pub mod ids;
pub mod notification;
pub mod page;
pub mod record;
pub mod state;
pub mod update;

pub use self::dependency::DependencyGraph;
pub use self::errors::{ErrorKind, ServiceError, ServiceResult};
pub use self::events::{EventType, ServiceEvent};
pub use self::hierarchy::{NodeIndex, ServiceHierarchy};
pub use self::ids::{Service, ServiceId};
pub use self::notification::{
    LifecycleStage, Notification, NotificationRegistration, StageSelector,
};
pub use self::page::{DateInterval, PageRequest, PageResult, SortCriteria, SortDirection};
pub use self::record::{ProcessingLocation, ServiceRecord};
pub use self::state::ServiceState;
pub use self::update::{FieldOp, FieldUpdates, RecordField, UpdateCondition};
