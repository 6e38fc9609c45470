//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use vigil_core::{CachedObject, ObjectCache, ObjectKey, ObjectWriter, WriteError};

pub(crate) fn obj(ns: &str, name: &str, rv: &str, annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> CachedObject {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if !ns.is_empty() {
        meta["namespace"] = serde_json::Value::String(ns.to_string());
    }
    let to_map = |pairs: &[(&str, &str)]| -> serde_json::Map<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), serde_json::Value::String((*v).to_string()))).collect()
    };
    meta["annotations"] = serde_json::Value::Object(to_map(annotations));
    meta["labels"] = serde_json::Value::Object(to_map(labels));
    CachedObject::from_raw(serde_json::json!({ "metadata": meta })).unwrap()
}

#[derive(Default)]
pub(crate) struct FakeCache {
    objects: Mutex<HashMap<ObjectKey, Arc<CachedObject>>>,
}

impl FakeCache {
    pub(crate) fn put(&self, o: CachedObject) { self.objects.lock().unwrap().insert(o.key(), Arc::new(o)); }
}

impl ObjectCache for FakeCache {
    fn get(&self, key: &ObjectKey) -> Option<Arc<CachedObject>> { self.objects.lock().unwrap().get(key).cloned() }
    fn is_synced(&self) -> bool { true }
}

/// Accepts every write unless a failure was scripted with `fail_next`.
#[derive(Default)]
pub(crate) struct FakeWriter {
    written: Mutex<Vec<CachedObject>>,
    failures: Mutex<VecDeque<WriteError>>,
}

impl FakeWriter {
    pub(crate) fn fail_next(&self, e: WriteError) { self.failures.lock().unwrap().push_back(e); }
    pub(crate) fn writes(&self) -> usize { self.written.lock().unwrap().len() }
    pub(crate) fn last(&self) -> Option<CachedObject> { self.written.lock().unwrap().last().cloned() }
}

#[async_trait::async_trait]
impl ObjectWriter for FakeWriter {
    async fn update(&self, obj: &CachedObject) -> Result<CachedObject, WriteError> {
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.written.lock().unwrap().push(obj.clone());
        Ok(obj.clone())
    }
}
