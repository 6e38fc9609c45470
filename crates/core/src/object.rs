use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

use crate::{ObjectError, ObjectKey};

/// Read-only snapshot of a remote object.
///
/// Only identity, version, labels and annotations are typed; everything else stays in `raw`
/// and is passed through untouched on writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedObject {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Kubernetes annotations as key/value pairs.
    pub annotations: SmallVec<[(String, String); 4]>,
    pub raw: Json,
}

fn string_map<A>(meta: &Json, field: &'static str) -> Result<SmallVec<A>, ObjectError>
where
    A: smallvec::Array<Item = (String, String)>,
{
    let mut out = SmallVec::new();
    match meta.get(field) {
        None | Some(Json::Null) => {}
        Some(Json::Object(map)) => {
            for (k, v) in map {
                let v = v.as_str().ok_or(ObjectError::BadMap(field))?;
                out.push((k.clone(), v.to_string()));
            }
        }
        Some(_) => return Err(ObjectError::BadMap(field)),
    }
    Ok(out)
}

fn meta_str(meta: &Json, field: &str) -> Option<String> {
    meta.get(field).and_then(|v| v.as_str()).map(str::to_string)
}

impl CachedObject {
    pub fn from_raw(raw: Json) -> Result<Self, ObjectError> {
        let meta = raw.get("metadata").ok_or(ObjectError::MissingMetadata)?;
        let name = meta_str(meta, "name").filter(|n| !n.is_empty()).ok_or(ObjectError::MissingName)?;
        let namespace = meta_str(meta, "namespace").filter(|n| !n.is_empty());
        let uid = meta_str(meta, "uid");
        let resource_version = meta_str(meta, "resourceVersion");
        let labels = string_map(meta, "labels")?;
        let annotations = string_map(meta, "annotations")?;
        Ok(Self { namespace, name, uid, resource_version, labels, annotations, raw })
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace.as_deref(), &self.name) }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Copy of this object with `key=value` set in `metadata.labels`; the typed view and `raw` stay in step.
    pub fn with_label(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        match next.labels.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => next.labels.push((key.to_string(), value.to_string())),
        }
        if !next.raw.is_object() {
            next.raw = Json::Object(Default::default());
        }
        let meta = &mut next.raw["metadata"];
        if !meta.get("labels").map(Json::is_object).unwrap_or(false) {
            meta["labels"] = Json::Object(Default::default());
        }
        meta["labels"][key] = Json::String(value.to_string());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_metadata_fields() {
        let o = CachedObject::from_raw(json!({
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "uid": "u-1",
                "resourceVersion": "42",
                "labels": {"app": "web"},
                "annotations": {"add-deployment-name-label": "True"}
            },
            "spec": {"replicas": 3}
        }))
        .unwrap();
        assert_eq!(o.key(), ObjectKey::namespaced("prod", "web"));
        assert_eq!(o.resource_version.as_deref(), Some("42"));
        assert_eq!(o.label("app"), Some("web"));
        assert_eq!(o.annotation("add-deployment-name-label"), Some("True"));
        assert_eq!(o.label("missing"), None);
    }

    #[test]
    fn rejects_objects_without_identity() {
        assert_eq!(CachedObject::from_raw(json!({})), Err(ObjectError::MissingMetadata));
        assert_eq!(CachedObject::from_raw(json!({"metadata": {"namespace": "x"}})), Err(ObjectError::MissingName));
        assert_eq!(
            CachedObject::from_raw(json!({"metadata": {"name": "a", "labels": {"n": 1}}})),
            Err(ObjectError::BadMap("labels"))
        );
    }

    #[test]
    fn with_label_copies_and_keeps_raw_in_step() {
        let o = CachedObject::from_raw(json!({"metadata": {"name": "web", "namespace": "prod"}, "spec": {"x": 1}})).unwrap();
        let o2 = o.with_label("deployment-name", "web");
        assert_eq!(o.label("deployment-name"), None);
        assert_eq!(o2.label("deployment-name"), Some("web"));
        assert_eq!(o2.raw["metadata"]["labels"]["deployment-name"], json!("web"));
        assert_eq!(o2.raw["spec"]["x"], json!(1));

        let o3 = o2.with_label("deployment-name", "other");
        assert_eq!(o3.labels.len(), 1);
        assert_eq!(o3.raw["metadata"]["labels"]["deployment-name"], json!("other"));
    }
}
