use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use shadow_kubehub::WatchEvent;

/// Informer-style notification with before/after snapshots.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    Added(Json),
    Updated { old: Json, new: Json },
    Deleted(Json),
}

fn cache_key(obj: &Json) -> String {
    let meta = obj.get("metadata");
    let field = |f: &str| meta.and_then(|m| m.get(f)).and_then(|v| v.as_str()).unwrap_or("");
    format!("{}/{}", field("namespace"), field("name"))
}

/// Last seen state per object of one watched type, used to turn raw watch
/// events into add/update/delete with the previous snapshot attached.
#[derive(Debug, Default)]
pub struct InformerCache {
    objects: FxHashMap<String, Json>,
}

impl InformerCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn observe(&mut self, ev: WatchEvent) -> Vec<ObjectEvent> {
        match ev {
            WatchEvent::Applied(obj) => {
                match self.objects.insert(cache_key(&obj), obj.clone()) {
                    Some(old) => vec![ObjectEvent::Updated { old, new: obj }],
                    None => vec![ObjectEvent::Added(obj)],
                }
            }
            WatchEvent::Deleted(obj) => {
                self.objects.remove(&cache_key(&obj));
                vec![ObjectEvent::Deleted(obj)]
            }
            WatchEvent::Restarted(list) => {
                let mut out = Vec::new();
                let mut fresh = FxHashMap::default();
                for obj in list {
                    let key = cache_key(&obj);
                    match self.objects.remove(&key) {
                        Some(old) if old == obj => {}
                        Some(old) => out.push(ObjectEvent::Updated { old, new: obj.clone() }),
                        None => out.push(ObjectEvent::Added(obj.clone())),
                    }
                    fresh.insert(key, obj);
                }
                // anything not relisted was deleted while the stream was down
                out.extend(self.objects.drain().map(|(_, gone)| ObjectEvent::Deleted(gone)));
                self.objects = fresh;
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, phase: &str) -> Json {
        serde_json::json!({"kind": "Pod", "metadata": {"name": name, "namespace": "ns"}, "status": {"phase": phase}})
    }

    #[test]
    fn applied_twice_yields_add_then_update() {
        let mut cache = InformerCache::new();
        assert_eq!(cache.observe(WatchEvent::Applied(pod("a", "Pending"))), vec![ObjectEvent::Added(pod("a", "Pending"))]);
        assert_eq!(
            cache.observe(WatchEvent::Applied(pod("a", "Running"))),
            vec![ObjectEvent::Updated { old: pod("a", "Pending"), new: pod("a", "Running") }]
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn relist_diffs_against_cache() {
        let mut cache = InformerCache::new();
        cache.observe(WatchEvent::Applied(pod("a", "Pending")));
        cache.observe(WatchEvent::Applied(pod("b", "Running")));
        cache.observe(WatchEvent::Applied(pod("c", "Running")));
        let out = cache.observe(WatchEvent::Restarted(vec![pod("a", "Running"), pod("b", "Running"), pod("d", "Pending")]));
        assert_eq!(out.len(), 3);
        assert!(out.contains(&ObjectEvent::Updated { old: pod("a", "Pending"), new: pod("a", "Running") }));
        assert!(out.contains(&ObjectEvent::Added(pod("d", "Pending"))));
        assert!(out.contains(&ObjectEvent::Deleted(pod("c", "Running"))));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn delete_evicts() {
        let mut cache = InformerCache::new();
        cache.observe(WatchEvent::Applied(pod("a", "Running")));
        let out = cache.observe(WatchEvent::Deleted(pod("a", "Running")));
        assert_eq!(out, vec![ObjectEvent::Deleted(pod("a", "Running"))]);
        assert!(cache.is_empty());
    }
}
