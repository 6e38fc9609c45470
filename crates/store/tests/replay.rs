#![forbid(unsafe_code)]

use vigil_core::{CachedObject, Delta, Notification, ObjectKey};
use vigil_store::CacheBuilder;

fn obj(name: &str, ns: Option<&str>, rv: &str) -> CachedObject {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if let Some(ns) = ns { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    CachedObject::from_raw(serde_json::json!({ "metadata": meta })).unwrap()
}

fn verbs(notes: &[Notification]) -> Vec<(String, String)> {
    notes.iter().map(|n| (n.verb().to_string(), n.object().key().to_string())).collect()
}

fn pair(verb: &str, key: &str) -> (String, String) { (verb.to_string(), key.to_string()) }

#[test]
fn replay_basic_sequence() {
    let mut cb = CacheBuilder::new();

    let notes = cb.apply(vec![
        Delta::Applied(obj("a", Some("ns"), "1")),
        // duplicate delivery becomes an update to itself
        Delta::Applied(obj("a", Some("ns"), "1")),
        Delta::Applied(obj("b", None, "2")),
    ]);
    assert_eq!(verbs(&notes), vec![pair("add", "ns/a"), pair("update", "ns/a"), pair("add", "b")]);
    assert_eq!(cb.epoch(), 1);
    assert_eq!(cb.len(), 2);
    assert!(!cb.synced(), "watch events alone do not make the cache synced");

    let notes = cb.apply(vec![Delta::Applied(obj("a", Some("ns"), "3")), Delta::Deleted(obj("b", None, "2"))]);
    assert_eq!(verbs(&notes), vec![pair("update", "ns/a"), pair("delete", "b")]);
    match &notes[0] {
        Notification::Updated { old, new } => {
            assert_eq!(old.resource_version.as_deref(), Some("1"));
            assert_eq!(new.resource_version.as_deref(), Some("3"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let snap = cb.freeze();
    assert_eq!(snap.epoch, 2);
    assert_eq!(snap.objects.len(), 1);
    assert_eq!(snap.objects[&ObjectKey::namespaced("ns", "a")].resource_version.as_deref(), Some("3"));
}

#[test]
fn relist_replaces_contents_and_reports_missing_objects_as_deleted() {
    let mut cb = CacheBuilder::new();
    cb.apply(vec![Delta::Applied(obj("a", Some("ns"), "1")), Delta::Applied(obj("z", Some("ns"), "1"))]);

    let notes = cb.apply(vec![Delta::Replaced(vec![obj("a", Some("ns"), "5"), obj("c", Some("ns"), "6")])]);
    assert_eq!(verbs(&notes), vec![pair("update", "ns/a"), pair("add", "ns/c"), pair("delete", "ns/z")]);
    assert!(cb.synced());
    assert_eq!(cb.len(), 2);
}

#[test]
fn delete_of_unknown_object_is_still_reported() {
    let mut cb = CacheBuilder::new();
    let notes = cb.apply(vec![Delta::Deleted(obj("ghost", Some("ns"), "1"))]);
    assert_eq!(verbs(&notes), vec![pair("delete", "ns/ghost")]);
    assert!(cb.is_empty());
}

#[test]
fn resync_redelivers_everything_as_updates() {
    let mut cb = CacheBuilder::new();
    cb.apply(vec![Delta::Replaced(vec![obj("b", Some("ns"), "1"), obj("a", Some("ns"), "1")])]);
    let notes = cb.resync();
    assert_eq!(verbs(&notes), vec![pair("update", "ns/a"), pair("update", "ns/b")]);
}
