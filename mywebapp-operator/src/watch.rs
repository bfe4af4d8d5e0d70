use crate::{configuration::is_watched, utils::NamespacedName};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use kube::{Api, ResourceExt};
use kube_runtime::{
    watcher::{self, watcher},
    WatchStreamExt,
};
use mywebapp_operator_apis::{MyWebApp, MyWebAppSpec};
use std::{collections::HashSet, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum EventKind {
    Add,
    Update,
    Delete,
    /// Synthetic re-delivery of a known object by the resync scheduler.
    Sync,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Add => "ADD",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Sync => "SYNC",
        };
        f.write_str(s)
    }
}

/// A single change notification for one `MyWebApp` identity.
#[derive(Clone, Debug)]
pub(crate) struct WatchEvent {
    pub kind: EventKind,
    pub key: NamespacedName,
    pub object: Arc<MyWebApp>,
    /// The object's `resourceVersion` at the time of the event.
    pub revision: String,
}

impl WatchEvent {
    pub fn new(kind: EventKind, object: Arc<MyWebApp>) -> Self {
        Self {
            kind,
            key: NamespacedName::from(object.as_ref()),
            revision: object.resource_version().unwrap_or_default(),
            object,
        }
    }

    /// Deletion event for an identity whose last snapshot is unknown.
    pub fn tombstone(key: &NamespacedName) -> Self {
        let mut object = MyWebApp::new(&key.name, MyWebAppSpec::default());
        object.metadata.namespace = Some(key.namespace.clone());
        Self::new(EventKind::Delete, Arc::new(object))
    }

    /// The declared state to converge to, `None` once the parent is being deleted.
    pub fn desired(&self) -> Option<&MyWebApp> {
        if self.kind == EventKind::Delete || self.object.is_deleted() {
            None
        } else {
            Some(self.object.as_ref())
        }
    }
}

/// Latest snapshot of every `MyWebApp` the watch has reported and not yet deleted.
///
/// Shared between the watch stream (writer) and the resync scheduler (reader).
#[derive(Clone, Default)]
pub(crate) struct ObjectIndex {
    objects: Arc<DashMap<NamespacedName, Arc<MyWebApp>>>,
}

impl ObjectIndex {
    pub fn get(&self, key: &NamespacedName) -> Option<Arc<MyWebApp>> {
        self.objects.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &NamespacedName) -> bool {
        self.objects.contains_key(key)
    }

    /// Point-in-time copy of all known objects.
    pub fn snapshot(&self) -> Vec<Arc<MyWebApp>> {
        self.objects.iter().map(|v| v.value().clone()).collect()
    }

    fn insert(&self, key: NamespacedName, object: Arc<MyWebApp>) -> Option<Arc<MyWebApp>> {
        self.objects.insert(key, object)
    }

    fn remove(&self, key: &NamespacedName) -> Option<Arc<MyWebApp>> {
        self.objects.remove(key).map(|(_, v)| v)
    }

    fn keys(&self) -> Vec<NamespacedName> {
        self.objects.iter().map(|v| v.key().clone()).collect()
    }
}

/// Turns raw watcher events into [`WatchEvent`]s, suppressing duplicates and
/// inferring deletions missed while the watch was down.
pub(crate) struct EventTranslator {
    index: ObjectIndex,
    /// Identities seen since the current re-list started.
    relist: Option<HashSet<NamespacedName>>,
    /// Objects outside these namespaces are ignored, `None` watches all.
    namespaces: Option<HashSet<String>>,
}

impl EventTranslator {
    pub fn new(index: ObjectIndex) -> Self {
        Self {
            index,
            relist: None,
            namespaces: None,
        }
    }

    pub fn with_namespaces(mut self, namespaces: Option<HashSet<String>>) -> Self {
        self.namespaces = namespaces;
        self
    }

    fn is_watched(&self, object: &MyWebApp) -> bool {
        object
            .namespace()
            .map_or(false, |ns| is_watched(self.namespaces.as_ref(), &ns))
    }

    pub fn translate(&mut self, event: watcher::Event<MyWebApp>) -> Vec<WatchEvent> {
        match event {
            watcher::Event::Apply(object)
            | watcher::Event::Delete(object)
            | watcher::Event::InitApply(object)
                if !self.is_watched(&object) =>
            {
                vec![]
            }
            watcher::Event::Apply(object) => self.applied(object).into_iter().collect(),
            watcher::Event::Delete(object) => {
                let object = Arc::new(object);
                let event = WatchEvent::new(EventKind::Delete, object);
                self.index.remove(&event.key);
                vec![event]
            }
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                vec![]
            }
            watcher::Event::InitApply(object) => {
                let object = Arc::new(object);
                let event = WatchEvent::new(EventKind::Add, object.clone());
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(event.key.clone());
                }
                self.index.insert(event.key.clone(), object);
                vec![event]
            }
            watcher::Event::InitDone => {
                let seen = self.relist.take().unwrap_or_default();
                let mut gone: Vec<NamespacedName> = self
                    .index
                    .keys()
                    .into_iter()
                    .filter(|key| !seen.contains(key))
                    .collect();
                gone.sort();
                gone.into_iter()
                    .filter_map(|key| self.index.remove(&key))
                    .map(|last| WatchEvent::new(EventKind::Delete, last))
                    .collect()
            }
        }
    }

    fn applied(&mut self, object: MyWebApp) -> Option<WatchEvent> {
        let object = Arc::new(object);
        let key = NamespacedName::from(object.as_ref());
        let kind = match self.index.get(&key) {
            Some(known)
                if known.resource_version().is_some()
                    && known.resource_version() == object.resource_version() =>
            {
                // Same revision delivered twice.
                return None;
            }
            Some(_) => EventKind::Update,
            None => EventKind::Add,
        };
        self.index.insert(key, object.clone());
        Some(WatchEvent::new(kind, object))
    }
}

/// Subscribe to `MyWebApp` changes. The returned stream is infinite: the
/// underlying watcher resumes from the last seen resourceVersion and re-lists
/// when that revision has expired. Transport failures are yielded as errors
/// (the stream restarts after a backoff) and never end the stream.
pub(crate) fn subscribe(
    api: Api<MyWebApp>,
    index: ObjectIndex,
    namespaces: Option<HashSet<String>>,
) -> impl Stream<Item = Result<WatchEvent, watcher::Error>> + Send {
    let mut translator = EventTranslator::new(index).with_namespaces(namespaces);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .map(move |res| match res {
            Ok(event) => translator
                .translate(event)
                .into_iter()
                .map(Ok)
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
        .flat_map(futures::stream::iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webapp(name: &str, resource_version: &str, replicas: i32) -> MyWebApp {
        let mut app = MyWebApp::new(
            name,
            MyWebAppSpec {
                replicas: Some(replicas),
                image: None,
            },
        );
        app.metadata.namespace = Some("web".to_string());
        app.metadata.resource_version = Some(resource_version.to_string());
        app
    }

    fn kinds(events: &[WatchEvent]) -> Vec<(EventKind, String)> {
        events
            .iter()
            .map(|e| (e.kind, e.key.name.clone()))
            .collect()
    }

    #[test]
    fn add_update_and_delete() {
        let index = ObjectIndex::default();
        let mut translator = EventTranslator::new(index.clone());

        let events = translator.translate(watcher::Event::Apply(webapp("a", "1", 1)));
        assert_eq!(vec![(EventKind::Add, "a".to_string())], kinds(&events));
        assert_eq!("1", events[0].revision);
        assert_eq!(Some(1), events[0].object.spec.replicas);

        let events = translator.translate(watcher::Event::Apply(webapp("a", "2", 3)));
        assert_eq!(vec![(EventKind::Update, "a".to_string())], kinds(&events));
        assert_eq!(Some(3), index.get(&NamespacedName::new("web", "a")).unwrap().spec.replicas);

        let events = translator.translate(watcher::Event::Delete(webapp("a", "3", 3)));
        assert_eq!(vec![(EventKind::Delete, "a".to_string())], kinds(&events));
        assert!(events[0].desired().is_none());
        assert_eq!(0, index.snapshot().len());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let mut translator = EventTranslator::new(ObjectIndex::default());
        assert_eq!(1, translator.translate(watcher::Event::Apply(webapp("a", "1", 1))).len());
        assert!(translator.translate(watcher::Event::Apply(webapp("a", "1", 1))).is_empty());
    }

    #[test]
    fn relist_emits_adds_and_infers_deletes() {
        let index = ObjectIndex::default();
        let mut translator = EventTranslator::new(index.clone());
        translator.translate(watcher::Event::Apply(webapp("a", "1", 1)));
        translator.translate(watcher::Event::Apply(webapp("b", "2", 1)));
        translator.translate(watcher::Event::Apply(webapp("c", "3", 1)));

        // The watch was down; "b" and "c" were deleted and "d" created meanwhile.
        assert!(translator.translate(watcher::Event::Init).is_empty());
        let events = translator.translate(watcher::Event::InitApply(webapp("a", "9", 2)));
        assert_eq!(vec![(EventKind::Add, "a".to_string())], kinds(&events));
        let events = translator.translate(watcher::Event::InitApply(webapp("d", "10", 1)));
        assert_eq!(vec![(EventKind::Add, "d".to_string())], kinds(&events));
        let events = translator.translate(watcher::Event::InitDone);
        assert_eq!(
            vec![
                (EventKind::Delete, "b".to_string()),
                (EventKind::Delete, "c".to_string())
            ],
            kinds(&events)
        );
        // Deletes carry the last known snapshot.
        assert_eq!("2", events[0].revision);
        assert_eq!(2, index.snapshot().len());
        assert!(index.contains(&NamespacedName::new("web", "a")));
        assert!(index.contains(&NamespacedName::new("web", "d")));
    }

    #[test]
    fn deleting_objects_have_no_desired_state() {
        let mut app = webapp("a", "1", 1);
        let event = WatchEvent::new(EventKind::Update, Arc::new(app.clone()));
        assert!(event.desired().is_some());
        app.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
        let event = WatchEvent::new(EventKind::Update, Arc::new(app));
        assert!(event.desired().is_none());
    }

    #[test]
    fn foreign_namespaces_are_ignored() {
        let index = ObjectIndex::default();
        let mut translator = EventTranslator::new(index.clone())
            .with_namespaces(Some(HashSet::from(["web".to_string()])));
        let mut other = webapp("b", "2", 1);
        other.metadata.namespace = Some("other".to_string());
        assert!(translator.translate(watcher::Event::Apply(other.clone())).is_empty());
        assert!(translator.translate(watcher::Event::Delete(other)).is_empty());
        assert_eq!(1, translator.translate(watcher::Event::Apply(webapp("a", "1", 1))).len());
        assert_eq!(1, index.snapshot().len());
    }

    #[test]
    fn tombstone() {
        let event = WatchEvent::tombstone(&NamespacedName::new("web", "gone"));
        assert_eq!(EventKind::Delete, event.kind);
        assert_eq!(NamespacedName::new("web", "gone"), event.key);
        assert!(event.desired().is_none());
    }
}
