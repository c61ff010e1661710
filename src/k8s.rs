//! Watch machinery: reflector stores plus a debounced change feed.
//!
//! Each watched kind keeps a warm [Store] the reconciler reads declared state
//! from, and broadcasts batches of changed object refs that the enqueue loop
//! turns into routing keys. Changes are debounced so a flurry of watch events
//! against one object collapses into a single sync.

use futures::TryStreamExt;
use k8s_openapi::{
    api::{
        core::v1::{Secret, Service},
        networking::v1::Ingress,
    },
    serde::Deserialize,
};
use kube::{
    runtime::{
        self,
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Resource, ResourceExt as _,
};
use std::time::Duration;
use std::{collections::HashSet, fmt::Debug, future::Future, sync::Arc, time::Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub(crate) trait WatchedResource:
    Clone + Debug + for<'de> Deserialize<'de> + Resource<DynamicType = ()> + Send + Sync + 'static
{
    fn static_kind() -> &'static str;

    /// Strip fields that churn without meaning anything to us.
    fn strip(&mut self);

    /// Whether a new version of an object warrants a resync.
    fn has_changed(&self, other: &Self) -> bool;
}

macro_rules! check_changed {
    ($old:expr, $new:expr) => {
        if $old != $new {
            return true;
        }
    };
}

const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";

impl WatchedResource for Ingress {
    fn static_kind() -> &'static str {
        <Ingress as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
        // status only carries the address we write back ourselves
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.metadata.labels, other.metadata.labels);
        check_changed!(self.metadata.annotations, other.metadata.annotations);
        check_changed!(self.spec, other.spec);

        false
    }
}

impl WatchedResource for Service {
    fn static_kind() -> &'static str {
        <Service as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
        self.status = None;
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.metadata.labels, other.metadata.labels);
        check_changed!(self.spec, other.spec);

        false
    }
}

impl WatchedResource for Secret {
    fn static_kind() -> &'static str {
        <Secret as k8s_openapi::Resource>::KIND
    }

    fn strip(&mut self) {
        self.annotations_mut().remove(LAST_APPLIED_CONFIG);
        self.managed_fields_mut().clear();
    }

    fn has_changed(&self, other: &Self) -> bool {
        check_changed!(self.data, other.data);

        false
    }
}

pub(crate) type ChangedObjects<K> = Arc<HashSet<ObjectRef<K>>>;

pub(crate) struct Watch<T: WatchedResource> {
    pub store: Store<T>,
    pub changes: broadcast::Sender<ChangedObjects<T>>,
}

pub(crate) fn watch<T: WatchedResource>(
    api: kube::Api<T>,
    debounce_duration: Duration,
) -> (
    Watch<T>,
    impl Future<Output = Result<(), watcher::Error>> + Send + 'static,
) {
    let (store, writer) = reflector::store();
    let (change_tx, _change_rx) = broadcast::channel(10);

    (
        Watch {
            store: store.clone(),
            changes: change_tx.clone(),
        },
        run_watch(api, store, writer, change_tx, debounce_duration),
    )
}

async fn run_watch<T: WatchedResource>(
    api: kube::Api<T>,
    store: Store<T>,
    mut writer: Writer<T>,
    changes: broadcast::Sender<ChangedObjects<T>>,
    debounce_duration: Duration,
) -> Result<(), watcher::Error> {
    let stream = runtime::watcher(api, runtime::watcher::Config::default().any_semantic())
        .default_backoff()
        .modify(T::strip);
    let mut stream = std::pin::pin!(stream);

    debug!(kind = T::static_kind(), "watch starting");
    let mut debounce = None;
    let mut changed: HashSet<_> = HashSet::new();
    loop {
        tokio::select! {
            biased;

            _ = sleep_until(&debounce) => {
                if !changed.is_empty() {
                    let to_send: ChangedObjects<_> = Arc::new(std::mem::take(&mut changed));
                    if changes.send(to_send).is_err() {
                        debug!(kind = T::static_kind(), "watch ended: all receivers dropped");
                        break;
                    };
                }
                debounce.take();
            }
            event = stream.try_next() => {
                // return the error if the stream dies, continue if there's no next item.
                let Some(event) = event? else {
                    continue
                };
                handle_watch_event(&event, &mut changed, &mut debounce, &store, debounce_duration);
                writer.apply_watcher_event(&event);
            },
        }
    }

    debug!(kind = T::static_kind(), "watch exiting");
    Ok(())
}

fn handle_watch_event<T: WatchedResource>(
    event: &watcher::Event<T>,
    changed: &mut HashSet<ObjectRef<T>>,
    debounce: &mut Option<Instant>,
    store: &Store<T>,
    debounce_duration: Duration,
) {
    match &event {
        // on apply, compare with the currently cached version of the object
        // and only mark it if there's a meaningful change.
        watcher::Event::Apply(new_obj) => {
            let new_ref = ObjectRef::from_obj(new_obj);
            let old_obj = store.get(&new_ref);
            let has_changed = old_obj.map_or(true, |obj| obj.has_changed(new_obj));

            if has_changed {
                changed.insert(new_ref);
                debounce.get_or_insert_with(|| Instant::now() + debounce_duration);
            }
        }
        watcher::Event::Delete(obj) => {
            changed.insert(ObjectRef::from_obj(obj));
            debounce.get_or_insert_with(|| Instant::now() + debounce_duration);
        }
        watcher::Event::Init => {
            trace!(kind = T::static_kind(), "watch restarted");
        }
        watcher::Event::InitApply(obj) => {
            changed.insert(ObjectRef::from_obj(obj));
            debounce.get_or_insert_with(|| Instant::now() + debounce_duration);
        }
        // the store still holds the pre-restart state until InitDone is
        // applied. marking its contents too catches objects deleted while
        // the watch was disconnected.
        watcher::Event::InitDone => {
            for obj in store.state() {
                changed.insert(ObjectRef::from_obj(&obj));
            }
            debounce.get_or_insert_with(|| Instant::now() + debounce_duration);
        }
    }
}

async fn sleep_until(deadline: &Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until((*d).into()).await,
        None => futures::future::pending().await,
    }
}
