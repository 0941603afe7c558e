//! Bookkeeping for GPU-backed resources.
//!
//! Geometries, materials and textures each own a [`GpuSlot`]. A slot is
//! "live" from creation until it is released by the disposal routine, and
//! becomes live again if a released resource is drawn (and re-uploaded).
//! Every transition is mirrored in a shared [`ResourceTracker`], which is
//! what tests and the status overlay read to see whether anything leaks.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Geometry,
    Material,
    Texture,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Geometry => write!(f, "geometry"),
            ResourceKind::Material => write!(f, "material"),
            ResourceKind::Texture => write!(f, "texture"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    geometries: AtomicUsize,
    materials: AtomicUsize,
    textures: AtomicUsize,
}

impl Counters {
    fn counter(&self, kind: ResourceKind) -> &AtomicUsize {
        match kind {
            ResourceKind::Geometry => &self.geometries,
            ResourceKind::Material => &self.materials,
            ResourceKind::Texture => &self.textures,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub geometries: usize,
    pub materials: usize,
    pub textures: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.geometries + self.materials + self.textures
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    counters: Arc<Counters>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, kind: ResourceKind) {
        self.counters.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, kind: ResourceKind) {
        // Saturating: a tracker shared between tests must never wrap
        let _ = self
            .counters
            .counter(kind)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.counters.counter(kind).load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> ResourceCounts {
        ResourceCounts {
            geometries: self.live(ResourceKind::Geometry),
            materials: self.live(ResourceKind::Material),
            textures: self.live(ResourceKind::Texture),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("{kind} '{label}' state lock is poisoned")]
    Poisoned { kind: ResourceKind, label: String },
}

enum SlotState<T> {
    Live(Option<T>),
    Released,
}

/// Holds the GPU realization of one resource, if any has been uploaded.
pub struct GpuSlot<T> {
    kind: ResourceKind,
    label: String,
    tracker: ResourceTracker,
    state: Mutex<SlotState<T>>,
    uploads: AtomicU64,
}

impl<T: Clone> GpuSlot<T> {
    pub fn new(kind: ResourceKind, label: impl Into<String>, tracker: &ResourceTracker) -> Self {
        tracker.acquire(kind);
        Self {
            kind,
            label: label.into(),
            tracker: tracker.clone(),
            state: Mutex::new(SlotState::Live(None)),
            uploads: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    /// Returns the uploaded handle, uploading first if needed. A released
    /// slot is revived. Returns `None` only if the state lock is poisoned.
    pub fn get_or_upload(&self, upload: impl FnOnce() -> T) -> Option<T> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                log::warn!("{} '{}' is unusable: state lock poisoned", self.kind, self.label);
                return None;
            }
        };

        if let SlotState::Released = *state {
            log::debug!("Reviving released {} '{}'", self.kind, self.label);
            self.tracker.acquire(self.kind);
            *state = SlotState::Live(None);
        }

        match &mut *state {
            SlotState::Live(Some(handle)) => Some(handle.clone()),
            SlotState::Live(slot @ None) => {
                let handle = upload();
                self.uploads.fetch_add(1, Ordering::Relaxed);
                *slot = Some(handle.clone());
                Some(handle)
            }
            SlotState::Released => None,
        }
    }

    pub fn resident(&self) -> Option<T> {
        match &*self.state.lock().ok()? {
            SlotState::Live(handle) => handle.clone(),
            SlotState::Released => None,
        }
    }

    pub fn is_released(&self) -> bool {
        matches!(self.state.lock().as_deref(), Ok(SlotState::Released))
    }

    /// How many times a handle has been uploaded. Anything built from an
    /// earlier handle is stale once this moves.
    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Frees the uploaded handle but keeps the slot live, so the next
    /// `get_or_upload` builds a fresh one. Returns whether a handle was
    /// freed.
    pub fn invalidate(&self, free: impl FnOnce(T)) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match &mut *state {
            SlotState::Live(slot) => match slot.take() {
                Some(handle) => {
                    free(handle);
                    true
                }
                None => false,
            },
            SlotState::Released => false,
        }
    }

    /// Releases the slot. `free` receives the GPU handle when one was
    /// uploaded. Returns `Ok(false)` if the slot was already released.
    pub fn release(&self, free: impl FnOnce(T)) -> Result<bool, ReleaseError> {
        let mut state = self.state.lock().map_err(|_| ReleaseError::Poisoned {
            kind: self.kind,
            label: self.label.clone(),
        })?;

        match std::mem::replace(&mut *state, SlotState::Released) {
            SlotState::Live(handle) => {
                if let Some(handle) = handle {
                    free(handle);
                }
                self.tracker.release(self.kind);
                Ok(true)
            }
            SlotState::Released => Ok(false),
        }
    }
}

impl<T> Drop for GpuSlot<T> {
    fn drop(&mut self) {
        let live = match self.state.get_mut() {
            Ok(state) => matches!(state, SlotState::Live(_)),
            Err(poisoned) => matches!(poisoned.into_inner(), SlotState::Live(_)),
        };
        if live {
            self.tracker.release(self.kind);
        }
    }
}

impl<T> fmt::Debug for GpuSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuSlot")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_counts_while_live() {
        let tracker = ResourceTracker::new();
        let slot: GpuSlot<u32> = GpuSlot::new(ResourceKind::Texture, "albedo", &tracker);
        assert_eq!(tracker.live(ResourceKind::Texture), 1);

        assert!(slot.release(|_| {}).unwrap());
        assert_eq!(tracker.live(ResourceKind::Texture), 0);
        assert!(slot.is_released());

        // Releasing twice is not an error and frees nothing
        assert!(!slot.release(|_| panic!("nothing left to free")).unwrap());
        assert_eq!(tracker.counts(), ResourceCounts::default());
    }

    #[test]
    fn release_hands_back_uploaded_handle() {
        let tracker = ResourceTracker::new();
        let slot = GpuSlot::new(ResourceKind::Geometry, "cube", &tracker);
        assert_eq!(slot.get_or_upload(|| 7u32), Some(7));
        // Second access reuses the upload
        assert_eq!(slot.get_or_upload(|| 99), Some(7));

        let mut freed = None;
        slot.release(|handle| freed = Some(handle)).unwrap();
        assert_eq!(freed, Some(7));
    }

    #[test]
    fn released_slot_revives_on_upload() {
        let tracker = ResourceTracker::new();
        let slot = GpuSlot::new(ResourceKind::Material, "paint", &tracker);
        slot.release(|_: u8| {}).unwrap();
        assert_eq!(tracker.live(ResourceKind::Material), 0);

        assert_eq!(slot.get_or_upload(|| 3u8), Some(3));
        assert_eq!(tracker.live(ResourceKind::Material), 1);
        assert!(!slot.is_released());
    }

    #[test]
    fn dropping_live_slot_updates_tracker() {
        let tracker = ResourceTracker::new();
        {
            let _a: GpuSlot<()> = GpuSlot::new(ResourceKind::Geometry, "a", &tracker);
            let b: GpuSlot<()> = GpuSlot::new(ResourceKind::Geometry, "b", &tracker);
            b.release(|_| {}).unwrap();
            assert_eq!(tracker.live(ResourceKind::Geometry), 1);
        }
        assert_eq!(tracker.live(ResourceKind::Geometry), 0);
    }

    #[test]
    fn uploads_count_every_fresh_handle() {
        let tracker = ResourceTracker::new();
        let slot = GpuSlot::new(ResourceKind::Texture, "albedo", &tracker);
        assert_eq!(slot.uploads(), 0);

        slot.get_or_upload(|| 1u32);
        slot.get_or_upload(|| 2);
        assert_eq!(slot.uploads(), 1);

        slot.release(|_| {}).unwrap();
        assert_eq!(slot.get_or_upload(|| 3), Some(3));
        assert_eq!(slot.uploads(), 2);
    }

    #[test]
    fn invalidate_rebuilds_without_touching_the_count() {
        let tracker = ResourceTracker::new();
        let slot = GpuSlot::new(ResourceKind::Material, "paint", &tracker);
        assert!(!slot.invalidate(|_: u32| panic!("nothing uploaded yet")));

        slot.get_or_upload(|| 1);
        let mut freed = None;
        assert!(slot.invalidate(|handle| freed = Some(handle)));
        assert_eq!(freed, Some(1));
        assert_eq!(tracker.live(ResourceKind::Material), 1);
        assert_eq!(slot.get_or_upload(|| 2), Some(2));

        slot.release(|_| {}).unwrap();
        assert!(!slot.invalidate(|_| panic!("released slots hold nothing")));
        assert!(slot.is_released());
    }

    #[test]
    fn poisoned_slot_still_settles_the_tracker_on_drop() {
        let tracker = ResourceTracker::new();
        let slot: GpuSlot<u32> = GpuSlot::new(ResourceKind::Texture, "albedo", &tracker);
        let poisoner = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = slot.state.lock().unwrap();
            panic!("upload failed mid-way");
        }));
        assert!(poisoner.is_err());

        assert!(slot.release(|_| {}).is_err());
        assert_eq!(tracker.live(ResourceKind::Texture), 1);
        drop(slot);
        assert_eq!(tracker.live(ResourceKind::Texture), 0);
    }
}
