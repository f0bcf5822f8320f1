//! Owns the playable resources behind slides.
//!
//! At most two resources exist at any time: the one on screen (`current`) and the
//! one preloaded for the upcoming slide (`next`). A resource that falls out of both
//! slots is torn down before the call that displaced it returns.

use super::errors::MediaError;
use super::model::{DisplayItem, ItemKind};
use log::{debug, error, info, trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Playback state of a video resource. `Ended` loops back to `Ready` on restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoPhase {
    Buffering,
    Ready,
    Playing,
    Ended,
}

#[derive(Debug)]
pub struct Resource {
    pub id: ResourceId,
    pub index: usize,
    pub item: DisplayItem,
    /// `None` for images.
    pub video: Option<VideoPhase>,
}

/// The media subsystem that actually materializes items (a renderer, a player, a prefetcher).
///
/// Calls are made from the scheduler's serialized context; readiness and playback
/// events are reported back asynchronously as [`MediaEvent`]s.
pub trait MediaBackend {
    /// Starts materializing `item` under `id`.
    fn create(&mut self, id: ResourceId, item: &DisplayItem) -> Result<(), MediaError>;
    fn play(&mut self, id: ResourceId) -> Result<(), MediaError>;
    fn seek_to_start(&mut self, id: ResourceId) -> Result<(), MediaError>;
    /// Stops playback and releases everything held for `id` before returning.
    fn destroy(&mut self, id: ResourceId);
}

/// Native notifications from the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaEventKind {
    Ready,
    Started,
    Ended,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MediaEvent {
    pub resource: ResourceId,
    pub kind: MediaEventKind,
}

#[derive(Debug, Default)]
pub struct WorkingSet {
    current: Option<Resource>,
    next: Option<Resource>,
}

impl WorkingSet {
    pub fn current(&self) -> Option<&Resource> {
        self.current.as_ref()
    }

    pub fn next(&self) -> Option<&Resource> {
        self.next.as_ref()
    }

    pub fn len(&self) -> usize {
        usize::from(self.current.is_some()) + usize::from(self.next.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.current.iter().chain(self.next.iter()).find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.current.iter_mut().chain(self.next.iter_mut()).find(|r| r.id == id)
    }
}

#[derive(Debug)]
pub struct MediaResourceManager<B> {
    backend: B,
    set: WorkingSet,
    next_id: u64,
}

impl<B: MediaBackend> MediaResourceManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, set: WorkingSet::default(), next_id: 0 }
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.set
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.set.get_mut(id)
    }

    /// Materializes `item` into the `next` slot. Nothing is created when the item is
    /// already current (single-item playlists) or already preloaded.
    pub fn preload(&mut self, index: usize, item: &DisplayItem) -> Option<ResourceId> {
        if let Some(current) = self.set.current.as_mut().filter(|r| r.item == *item) {
            trace!("Preload of '{}' skipped: it is the current resource", item.id);
            current.index = index;
            return Some(current.id);
        }
        if let Some(next) = self.set.next.as_mut().filter(|r| r.item == *item) {
            next.index = index;
            return Some(next.id);
        }
        self.evict_next();
        match self.create(index, item) {
            Ok(resource) => {
                let id = resource.id;
                debug!("Preloaded '{}' (index {}) as {:?}", item.id, index, id);
                self.set.next = Some(resource);
                Some(id)
            }
            Err(e) => {
                error!("Failed to preload '{}': {}", item.id, e);
                None
            }
        }
    }

    /// Makes `item` the current resource, reusing the preloaded or current one when it
    /// holds the same item. Whatever is displaced is torn down.
    ///
    /// Returns the resource id and whether an existing resource was reused.
    pub fn promote(
        &mut self,
        index: usize,
        item: &DisplayItem,
    ) -> Result<(ResourceId, bool), MediaError> {
        if let Some(current) = self.set.current.as_mut().filter(|r| r.item == *item) {
            current.index = index;
            let id = current.id;
            self.evict_next();
            return Ok((id, true));
        }
        if self.set.next.as_ref().is_some_and(|r| r.item == *item) {
            self.evict_current();
            if let Some(mut promoted) = self.set.next.take() {
                promoted.index = index;
                let id = promoted.id;
                info!("Promoted preloaded '{}' ({:?}) to current", item.id, id);
                self.set.current = Some(promoted);
                return Ok((id, true));
            }
        }
        self.evict_current();
        self.evict_next();
        let resource = self.create(index, item)?;
        let id = resource.id;
        self.set.current = Some(resource);
        Ok((id, false))
    }

    pub fn evict_next(&mut self) {
        if let Some(resource) = self.set.next.take() {
            self.teardown(resource);
        }
    }

    pub fn evict_current(&mut self) {
        if let Some(resource) = self.set.current.take() {
            self.teardown(resource);
        }
    }

    pub fn evict_all(&mut self) {
        self.evict_current();
        self.evict_next();
    }

    fn create(&mut self, index: usize, item: &DisplayItem) -> Result<Resource, MediaError> {
        self.next_id += 1;
        let id = ResourceId(self.next_id);
        self.backend.create(id, item)?;
        let video = match item.kind {
            ItemKind::Video => Some(VideoPhase::Buffering),
            ItemKind::Image => None,
        };
        Ok(Resource { id, index, item: item.clone(), video })
    }

    fn teardown(&mut self, resource: Resource) {
        debug!("Tearing down {:?} ('{}')", resource.id, resource.item.id);
        self.backend.destroy(resource.id);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingBackend;
    use super::*;

    #[test]
    fn promote_reuses_preloaded_and_tears_down_old_current() {
        let a = DisplayItem::image("a", "a.jpg");
        let b = DisplayItem::video("b", "b.mp4");
        let mut m = MediaResourceManager::new(RecordingBackend::default());

        let (a_id, reused) = m.promote(0, &a).unwrap();
        assert!(!reused);
        let b_id = m.preload(1, &b).unwrap();
        assert_eq!(m.working_set().len(), 2);
        assert_eq!(m.working_set().next().unwrap().video, Some(VideoPhase::Buffering));

        let (promoted, reused) = m.promote(1, &b).unwrap();
        assert_eq!(promoted, b_id);
        assert!(reused);
        assert_eq!(m.working_set().len(), 1);
        assert_eq!(m.backend().destroyed, vec![a_id]);
        assert_eq!(m.backend().live.len(), 1);
    }

    #[test]
    fn preload_of_current_item_creates_nothing() {
        let a = DisplayItem::video("a", "a.mp4");
        let mut m = MediaResourceManager::new(RecordingBackend::default());
        let (id, _) = m.promote(0, &a).unwrap();
        assert_eq!(m.preload(0, &a), Some(id));
        assert_eq!(m.working_set().len(), 1);
        assert_eq!(m.backend().created.len(), 1);
    }

    #[test]
    fn replacing_next_destroys_stale_preload() {
        let items: Vec<_> = ["a", "b", "c"].iter().map(|id| DisplayItem::image(*id, "x")).collect();
        let mut m = MediaResourceManager::new(RecordingBackend::default());
        m.promote(0, &items[0]).unwrap();
        let stale = m.preload(1, &items[1]).unwrap();
        m.preload(2, &items[2]).unwrap();
        assert_eq!(m.backend().destroyed, vec![stale]);
        assert!(m.working_set().len() <= 2);
    }

    #[test]
    fn promote_of_unpreloaded_item_clears_both_slots() {
        let items: Vec<_> = ["a", "b", "c"].iter().map(|id| DisplayItem::image(*id, "x")).collect();
        let mut m = MediaResourceManager::new(RecordingBackend::default());
        m.promote(0, &items[0]).unwrap();
        m.preload(1, &items[1]).unwrap();
        m.promote(2, &items[2]).unwrap();
        assert_eq!(m.working_set().len(), 1);
        assert_eq!(m.backend().destroyed.len(), 2);
    }

    #[test]
    fn failed_create_leaves_no_current() {
        let a = DisplayItem::image("a", "a.jpg");
        let b = DisplayItem::video("broken", "b.mp4");
        let mut backend = RecordingBackend::default();
        backend.fail_create_for.insert("broken".into());
        let mut m = MediaResourceManager::new(backend);
        m.promote(0, &a).unwrap();
        assert!(m.promote(1, &b).is_err());
        assert!(m.working_set().is_empty());
    }
}
