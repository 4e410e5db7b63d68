//! Watch-event filtering for maintenance resources.
//!
//! The reconciler writes status on every pass, and each write comes back as a
//! watch event. Only events that change what the reconciler acts on are let
//! through: `metadata.generation`, the finalizer list and the deletion marker.
//! Owned Job events reach the controller separately.

use std::collections::HashMap;

use futures::{future, Stream, TryStreamExt};
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};

/// Parts of an object whose change warrants a reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
struct Revision {
    generation: Option<i64>,
    finalizers: Vec<String>,
    deleting: bool,
}

impl Revision {
    fn of<K: Resource>(object: &K) -> Self {
        let meta = object.meta();
        Self {
            generation: meta.generation,
            finalizers: meta.finalizers.clone().unwrap_or_default(),
            deleting: meta.deletion_timestamp.is_some(),
        }
    }
}

/// Last revision seen per object
#[derive(Debug, Default)]
pub struct RevisionFilter {
    seen: HashMap<String, Revision>,
}

fn object_key<K: Resource>(object: &K) -> String {
    object.meta().uid.clone().unwrap_or_else(|| {
        format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any())
    })
}

impl RevisionFilter {
    /// Record `object` and report whether it differs from the last one seen
    pub fn changed<K: Resource>(&mut self, object: &K) -> bool {
        let revision = Revision::of(object);
        match self.seen.insert(object_key(object), revision.clone()) {
            Some(previous) => previous != revision,
            None => true,
        }
    }

    pub fn forget<K: Resource>(&mut self, object: &K) {
        self.seen.remove(&object_key(object));
    }

    /// Object to reconcile for a watch event, if any
    pub fn admit<K: Resource>(&mut self, event: Event<K>) -> Option<K> {
        match event {
            Event::Apply(object) | Event::InitApply(object) => {
                self.changed(&object).then_some(object)
            }
            Event::Delete(object) => {
                self.forget(&object);
                None
            }
            Event::Init | Event::InitDone => None,
        }
    }
}

/// Reduce a watch event stream to objects whose revision changed
pub fn revision_changes<K, S>(events: S) -> impl Stream<Item = Result<K, watcher::Error>>
where
    K: Resource,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    let mut filter = RevisionFilter::default();
    events.try_filter_map(move |event| future::ready(Ok(filter.admit(event))))
}
