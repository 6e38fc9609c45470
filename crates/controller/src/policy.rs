//! Reconciliation policy: what the desired state of an object is.

use std::fmt;

use vigil_core::CachedObject;

/// Minimal change that brings an object in line with policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    SetLabel { key: String, value: String },
}

impl Correction {
    /// The corrected copy to write back. `current` itself is never modified.
    pub fn apply(&self, current: &CachedObject) -> CachedObject {
        match self {
            Correction::SetLabel { key, value } => current.with_label(key, value),
        }
    }
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Correction::SetLabel { key, value } => write!(f, "set label {key}={value}"),
        }
    }
}

/// Decides from current state alone whether an object needs correcting.
pub trait Policy: Send + Sync {
    /// `None` when the object already satisfies the policy.
    fn plan(&self, obj: &CachedObject) -> Option<Correction>;
}

/// Objects annotated `trigger_annotation: trigger_value` must carry `label_key: <object name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationLabelPolicy {
    pub trigger_annotation: String,
    pub trigger_value: String,
    pub label_key: String,
}

impl Default for AnnotationLabelPolicy {
    fn default() -> Self {
        Self {
            trigger_annotation: "add-deployment-name-label".to_string(),
            trigger_value: "True".to_string(),
            label_key: "deployment-name".to_string(),
        }
    }
}

impl Policy for AnnotationLabelPolicy {
    fn plan(&self, obj: &CachedObject) -> Option<Correction> {
        if obj.annotation(&self.trigger_annotation) != Some(self.trigger_value.as_str()) {
            return None;
        }
        if obj.label(&self.label_key) == Some(obj.name.as_str()) {
            return None;
        }
        Some(Correction::SetLabel { key: self.label_key.clone(), value: obj.name.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(meta: serde_json::Value) -> CachedObject { CachedObject::from_raw(json!({ "metadata": meta })).unwrap() }

    #[test]
    fn untriggered_objects_are_left_alone() {
        let p = AnnotationLabelPolicy::default();
        assert_eq!(p.plan(&obj(json!({"name": "o", "namespace": "ns"}))), None);
        // Trigger value must match exactly.
        assert_eq!(p.plan(&obj(json!({"name": "o", "annotations": {"add-deployment-name-label": "true"}}))), None);
    }

    #[test]
    fn triggered_object_gets_name_label() {
        let p = AnnotationLabelPolicy::default();
        let o = obj(json!({"name": "p", "namespace": "ns", "annotations": {"add-deployment-name-label": "True"}}));
        let c = p.plan(&o).unwrap();
        assert_eq!(c, Correction::SetLabel { key: "deployment-name".into(), value: "p".into() });
        assert_eq!(c.to_string(), "set label deployment-name=p");

        let fixed = c.apply(&o);
        assert_eq!(p.plan(&fixed), None, "applying the correction converges");
        assert_eq!(o.label("deployment-name"), None);
    }

    #[test]
    fn wrong_label_value_is_corrected() {
        let p = AnnotationLabelPolicy::default();
        let o = obj(json!({
            "name": "p",
            "annotations": {"add-deployment-name-label": "True"},
            "labels": {"deployment-name": "stale"}
        }));
        assert_eq!(p.plan(&o), Some(Correction::SetLabel { key: "deployment-name".into(), value: "p".into() }));
    }
}
