//! Vigil kubehub: resolves the watched kind, streams list+watch events into the mirrored cache,
//! and performs optimistic-concurrency writes back to the API server.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{self, Scope},
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::{CachedObject, Delta, ObjectWriter, WriteError};

pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig/in-cluster env")
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// The watched kind, resolved against the cluster.
#[derive(Clone)]
pub struct Target {
    pub client: Client,
    pub resource: ApiResource,
    pub namespaced: bool,
    /// Namespace filter for list+watch; `None` watches all namespaces.
    pub namespace: Option<String>,
}

impl Target {
    pub async fn resolve(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, caps) = discovery::pinned_kind(&client, &gvk)
            .await
            .with_context(|| format!("resolving {gvk_key} via discovery"))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        if !namespaced && namespace.is_some() {
            warn!(gvk = %gvk_key, "namespace filter ignored for cluster-scoped kind");
        }
        let namespace = if namespaced { namespace.map(str::to_string) } else { None };
        Ok(Self { client, resource, namespaced, namespace })
    }

    /// Api used for list+watch.
    pub fn watch_api(&self) -> Api<DynamicObject> {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    pub fn writer(&self) -> KubeWriter {
        KubeWriter { client: self.client.clone(), resource: self.resource.clone(), namespaced: self.namespaced }
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn cached_from(obj: &DynamicObject) -> Result<CachedObject> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    CachedObject::from_raw(raw).context("decoding object metadata")
}

fn cached_list(list: &[DynamicObject]) -> Vec<CachedObject> {
    list.iter()
        .filter_map(|o| match cached_from(o) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(error = %e, name = ?o.metadata.name, "skipping undecodable object");
                None
            }
        })
        .collect()
}

/// Run list+watch for `target` and forward deltas to the cache until the cache stops listening.
///
/// Watch errors are retried with the watcher's default backoff; every (re)list arrives as
/// [`Delta::Replaced`].
pub async fn start_watcher(target: &Target, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let stream = watcher::watcher(target.watch_api(), watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %target.resource.kind, ns = ?target.namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        let delta = match ev {
            Ok(Event::Applied(o)) => match cached_from(&o) {
                Ok(c) => Delta::Applied(c),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable object");
                    continue;
                }
            },
            Ok(Event::Deleted(o)) => match cached_from(&o) {
                Ok(c) => Delta::Deleted(c),
                Err(e) => {
                    warn!(error = %e, "skipping undecodable delete");
                    continue;
                }
            },
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch (re)listed");
                Delta::Replaced(cached_list(&list))
            }
            Err(e) => {
                counter!("vigil_watch_errors_total", 1u64);
                warn!(error = %e, "watch error; backing off");
                continue;
            }
        };
        if delta_tx.send(delta).await.is_err() {
            debug!("cache closed; stopping watcher");
            return Ok(());
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

/// Maps API failures onto the writer contract.
pub fn classify(err: kube::Error) -> WriteError {
    match err {
        kube::Error::Api(ae) => match ae.code {
            409 => WriteError::Conflict(ae.message),
            404 => WriteError::NotFound(ae.message),
            400 | 422 => WriteError::Invalid(ae.message),
            _ => WriteError::Transient(format!("{} ({})", ae.message, ae.code)),
        },
        other => WriteError::Transient(other.to_string()),
    }
}

/// Writes objects back with `replace` (PUT). The request carries `metadata.resourceVersion`,
/// so the server rejects it with 409 if the object moved on since it was cached.
#[derive(Clone)]
pub struct KubeWriter {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeWriter {
    fn api_for(&self, namespace: Option<&str>) -> Result<Api<DynamicObject>, WriteError> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Ok(Api::namespaced_with(self.client.clone(), ns, &self.resource)),
            (true, None) => Err(WriteError::Invalid("namespace required for namespaced kind".into())),
            (false, _) => Ok(Api::all_with(self.client.clone(), &self.resource)),
        }
    }
}

#[async_trait::async_trait]
impl ObjectWriter for KubeWriter {
    async fn update(&self, obj: &CachedObject) -> Result<CachedObject, WriteError> {
        if obj.resource_version.is_none() {
            // Without a version the PUT would be unconditional.
            return Err(WriteError::Invalid(format!("{} has no resourceVersion", obj.key())));
        }
        let api = self.api_for(obj.namespace.as_deref())?;
        let mut dynobj: DynamicObject =
            serde_json::from_value(obj.raw.clone()).map_err(|e| WriteError::Invalid(format!("decoding object: {e}")))?;
        dynobj.types = Some(TypeMeta { api_version: self.resource.api_version.clone(), kind: self.resource.kind.clone() });
        let stored = api.replace(&obj.name, &PostParams::default(), &dynobj).await.map_err(classify)?;
        cached_from(&stored).map_err(|e| WriteError::Transient(format!("decoding server response: {e}")))
    }
}
