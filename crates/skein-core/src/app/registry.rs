//! ProcessorRegistry - (name, version) → ServiceProcessor
//!
//! # 設計
//! - 初期化時に登録（mutable）
//! - 実行時は読み取り専用（`Arc<ProcessorRegistry>` で共有、ロック不要）
//! - 二重登録は `DuplicateProcessor` エラー

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::app::processor::ServiceProcessor;
use crate::domain::{ServiceError, ServiceRecord, ServiceResult};

/// Registry key: processor name and version (blank when unversioned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorKey {
    pub name: String,
    pub version: String,
}

impl ProcessorKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn of(record: &ServiceRecord) -> Self {
        Self::new(record.name.clone(), record.version.clone().unwrap_or_default())
    }
}

impl std::fmt::Display for ProcessorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<ProcessorKey, Arc<dyn ServiceProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, processor: Arc<dyn ServiceProcessor>) -> ServiceResult<()> {
        let key = ProcessorKey::new(processor.name(), processor.version());
        if self.processors.contains_key(&key) {
            return Err(ServiceError::DuplicateProcessor {
                name: key.name,
                version: key.version,
            });
        }
        self.processors.insert(key, processor);
        Ok(())
    }

    /// Exact `(name, version)` match. An unversioned lookup falls back to the
    /// highest registered version of `name`.
    pub fn get(&self, name: &str, version: &str) -> ServiceResult<Arc<dyn ServiceProcessor>> {
        let exact = ProcessorKey::new(name, version);
        if let Some(p) = self.processors.get(&exact) {
            return Ok(p.clone());
        }
        if version.is_empty()
            && let Some((_, p)) = self
                .processors
                .range(ProcessorKey::new(name, "")..)
                .take_while(|(k, _)| k.name == name)
                .last()
        {
            return Ok(p.clone());
        }
        Err(ServiceError::ProcessorNotFound {
            name: name.to_string(),
            version: version.to_string(),
        })
    }

    pub fn for_record(&self, record: &ServiceRecord) -> ServiceResult<Arc<dyn ServiceProcessor>> {
        self.get(&record.name, record.version.as_deref().unwrap_or(""))
    }

    pub fn contains(&self, key: &ProcessorKey) -> bool {
        self.processors.contains_key(key)
    }

    pub fn registered_keys(&self) -> Vec<ProcessorKey> {
        self.processors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::computation::Computation;
    use crate::app::processor::ResolvedDependencies;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl ServiceProcessor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> &str {
            self.1
        }

        fn process(&self, _record: &ServiceRecord, _deps: ResolvedDependencies) -> Computation<Value> {
            Computation::completed(Value::String(self.1.to_string()))
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Named("sleep", "1"))).unwrap();

        assert!(registry.get("sleep", "1").is_ok());
        assert_eq!(
            registry.get("sleep", "2").err(),
            Some(ServiceError::ProcessorNotFound {
                name: "sleep".into(),
                version: "2".into()
            })
        );
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Named("sleep", "1"))).unwrap();
        let result = registry.register(Arc::new(Named("sleep", "1")));
        assert!(matches!(result, Err(ServiceError::DuplicateProcessor { .. })));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn versions_are_distinct_keys() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Named("sleep", "1"))).unwrap();
        registry.register(Arc::new(Named("sleep", "2"))).unwrap();
        registry.register(Arc::new(Named("sleepy", "9"))).unwrap();

        assert_eq!(registry.get("sleep", "2").unwrap().version(), "2");
        // unversioned lookup picks the highest version of that exact name
        assert_eq!(registry.get("sleep", "").unwrap().version(), "2");
        assert_eq!(
            registry.registered_keys(),
            vec![
                ProcessorKey::new("sleep", "1"),
                ProcessorKey::new("sleep", "2"),
                ProcessorKey::new("sleepy", "9"),
            ]
        );
    }

    #[test]
    fn lookup_by_record() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(Named("align", ""))).unwrap();
        let record = ServiceRecord::new("align");
        assert_eq!(registry.for_record(&record).unwrap().name(), "align");
    }
}
