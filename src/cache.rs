//! URL-keyed model cache.
//!
//! The cache keeps one canonical scene-graph root per URL and hands every
//! caller its own structural clone. Loads of the same URL that overlap share
//! a single fetch. The cache lives on the render thread; nothing here is
//! `Send`.

use crate::dispose::{DisposeReport, dispose};
use crate::error::LoadError;
use crate::gltf_import::{ImportOptions, import_model};
use crate::resource::ResourceTracker;
use crate::resources;
use crate::scene::Node;
use futures::future::{self, LocalBoxFuture, Shared};
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

pub type FetchFuture = LocalBoxFuture<'static, anyhow::Result<Vec<u8>>>;

pub trait AssetSource {
    fn fetch(&self, url: &str) -> FetchFuture;
}

/// Fetches through [`resources::load_binary`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceSource;

impl AssetSource for ResourceSource {
    fn fetch(&self, url: &str) -> FetchFuture {
        let url = url.to_string();
        async move { resources::load_binary(&url).await }.boxed_local()
    }
}

type SharedLoad = Shared<LocalBoxFuture<'static, Result<Rc<Node>, LoadError>>>;

pub struct AssetCache {
    source: Rc<dyn AssetSource>,
    tracker: ResourceTracker,
    options: ImportOptions,
    entries: RefCell<HashMap<String, Rc<Node>>>,
    in_flight: RefCell<HashMap<String, SharedLoad>>,
    /// Bumped by `clear`; loads started in an older epoch never populate
    /// the cache.
    epoch: Cell<u64>,
}

impl AssetCache {
    pub fn new(
        source: Rc<dyn AssetSource>,
        tracker: ResourceTracker,
        options: ImportOptions,
    ) -> Rc<Self> {
        Rc::new(Self {
            source,
            tracker,
            options,
            entries: RefCell::new(HashMap::new()),
            in_flight: RefCell::new(HashMap::new()),
            epoch: Cell::new(0),
        })
    }

    /// Cache backed by the bundled `res/` directory or the page origin.
    pub fn with_resources(tracker: ResourceTracker, options: ImportOptions) -> Rc<Self> {
        Self::new(Rc::new(ResourceSource), tracker, options)
    }

    /// Resolves with a clone of the cached root for `url`, fetching and
    /// parsing it first on a miss. Failures leave the cache untouched.
    pub fn load(self: &Rc<Self>, url: &str) -> LocalBoxFuture<'static, Result<Node, LoadError>> {
        if let Some(hit) = self.get(url) {
            log::debug!("Cache hit for '{}'", url);
            return future::ready(Ok(hit)).boxed_local();
        }

        let shared = self.join_or_start(url);
        async move { shared.await.map(|root| (*root).clone()) }.boxed_local()
    }

    pub fn get(&self, url: &str) -> Option<Node> {
        self.entries.borrow().get(url).map(|root| (**root).clone())
    }

    /// Disposes every cached root and forgets all entries and pending loads.
    pub fn clear(&self) -> DisposeReport {
        let entries: Vec<(String, Rc<Node>)> = self.entries.borrow_mut().drain().collect();
        let abandoned = self.in_flight.borrow_mut().drain().count();
        self.epoch.set(self.epoch.get() + 1);

        let mut report = DisposeReport::default();
        for (url, root) in &entries {
            log::debug!("Evicting '{}'", url);
            report.merge(dispose(root));
        }

        log::info!(
            "Cleared model cache: {} entries, {} pending loads abandoned, {} resources released",
            entries.len(),
            abandoned,
            report.released()
        );
        report
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.borrow().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.entries.borrow().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn pending(&self) -> usize {
        self.in_flight.borrow().len()
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    fn join_or_start(self: &Rc<Self>, url: &str) -> SharedLoad {
        if let Some(running) = self.in_flight.borrow().get(url) {
            log::debug!("Joining in-flight load of '{}'", url);
            return running.clone();
        }

        log::info!("Loading '{}'", url);
        let fetch = self.source.fetch(url);
        let tracker = self.tracker.clone();
        let options = self.options.clone();
        let cache: Weak<Self> = Rc::downgrade(self);
        let epoch = self.epoch.get();
        let owned_url = url.to_string();

        let load = async move {
            let result = match fetch.await {
                Ok(bytes) => import_model(&owned_url, &bytes, &tracker, &options).map(Rc::new),
                Err(err) => Err(LoadError::fetch(&owned_url, err)),
            };
            if let Some(cache) = cache.upgrade() {
                cache.settle(&owned_url, epoch, &result);
            }
            result
        }
        .boxed_local()
        .shared();

        self.in_flight
            .borrow_mut()
            .insert(url.to_string(), load.clone());
        load
    }

    fn settle(&self, url: &str, epoch: u64, result: &Result<Rc<Node>, LoadError>) {
        if epoch != self.epoch.get() {
            log::debug!("Not caching '{}': the cache was cleared while it loaded", url);
            return;
        }

        self.in_flight.borrow_mut().remove(url);
        match result {
            Ok(root) => {
                self.entries
                    .borrow_mut()
                    .insert(url.to_string(), root.clone());
            }
            Err(err) => log::warn!("{}", err),
        }
    }
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("urls", &self.urls())
            .field("pending", &self.pending())
            .field("epoch", &self.epoch.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, ScriptedSource};
    use futures::executor::{LocalPool, block_on};
    use cgmath::Vector3;
    use futures::task::LocalSpawnExt;
    use std::sync::Arc;

    const CHAIR: &str = "/models/modern-chair.glb";

    fn cache_with(source: &Rc<ScriptedSource>) -> Rc<AssetCache> {
        AssetCache::new(source.clone(), ResourceTracker::new(), ImportOptions::default())
    }

    #[test]
    fn get_is_empty_until_first_load() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(2).glb());
        let cache = cache_with(&source);

        assert!(cache.get(CHAIR).is_none());
        let loaded = block_on(cache.load(CHAIR)).unwrap();
        assert_eq!(loaded.children.len(), 2);
        assert!(cache.get(CHAIR).is_some());
        assert_eq!(cache.urls(), vec![CHAIR.to_string()]);
    }

    #[test]
    fn hits_do_not_fetch_again() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(1).glb());
        let cache = cache_with(&source);

        block_on(cache.load(CHAIR)).unwrap();
        block_on(cache.load(CHAIR)).unwrap();
        assert_eq!(source.fetch_count(CHAIR), 1);
    }

    #[test]
    fn every_load_returns_an_independent_clone() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(2).glb());
        let cache = cache_with(&source);

        let mut first = block_on(cache.load(CHAIR)).unwrap();
        let second = block_on(cache.load(CHAIR)).unwrap();
        assert_ne!(first.id(), second.id());

        first.children[0].transform.position = Vector3::new(9.0, 9.0, 9.0);
        first.children.pop();

        assert_eq!(second.children.len(), 2);
        assert_eq!(second.children[0].transform.position, Vector3::new(0.0, 0.0, 0.0));
        let canonical = cache.get(CHAIR).unwrap();
        assert_eq!(canonical.children.len(), 2);
        assert_eq!(canonical.children[0].transform.position, Vector3::new(0.0, 0.0, 0.0));
    }

    #[test]
    fn clones_share_gpu_resources() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(1).glb());
        let cache = cache_with(&source);

        let a = block_on(cache.load(CHAIR)).unwrap();
        let b = block_on(cache.load(CHAIR)).unwrap();
        let geometry = |node: &Node| node.children[0].mesh.as_ref().unwrap().geometry.clone();
        assert!(Arc::ptr_eq(&geometry(&a), &geometry(&b)));
        assert_eq!(cache.tracker().counts().geometries, 1);
    }

    #[test]
    fn failed_fetch_is_not_cached() {
        let source = ScriptedSource::new();
        source.fail(CHAIR, "connection reset");
        let cache = cache_with(&source);

        let err = block_on(cache.load(CHAIR)).unwrap_err();
        assert!(matches!(err, LoadError::Fetch { .. }));
        assert!(err.to_string().contains("connection reset"));
        assert!(!cache.contains(CHAIR));
        assert_eq!(cache.pending(), 0);

        source.serve(CHAIR, Fixture::textured_quads(1).glb());
        assert!(block_on(cache.load(CHAIR)).is_ok());
        assert_eq!(source.fetch_count(CHAIR), 2);
    }

    #[test]
    fn unparseable_bytes_are_not_cached() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, b"<html>404</html>".to_vec());
        let cache = cache_with(&source);

        let err = block_on(cache.load(CHAIR)).unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_disposes_and_forces_refetch() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(2).glb());
        let cache = cache_with(&source);

        let held = block_on(cache.load(CHAIR)).unwrap();
        let report = cache.clear();
        assert_eq!(
            (report.geometries, report.materials, report.textures),
            (2, 2, 4)
        );
        assert!(cache.is_empty());
        assert!(cache.get(CHAIR).is_none());
        assert_eq!(cache.tracker().counts().total(), 0);
        drop(held);

        block_on(cache.load(CHAIR)).unwrap();
        assert_eq!(source.fetch_count(CHAIR), 2);
    }

    #[test]
    fn concurrent_loads_share_one_fetch() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(1).glb());
        source.gate(CHAIR);
        let cache = cache_with(&source);

        let mut pool = LocalPool::new();
        let results = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let load = cache.load(CHAIR);
            let results = results.clone();
            pool.spawner()
                .spawn_local(async move {
                    let result = load.await;
                    results.borrow_mut().push(result);
                })
                .unwrap();
        }

        pool.run_until_stalled();
        assert_eq!(source.fetch_count(CHAIR), 1);
        assert_eq!(cache.pending(), 1);
        assert!(results.borrow().is_empty());

        source.release(CHAIR);
        pool.run_until_stalled();
        let results = results.borrow();
        assert_eq!(results.len(), 2);
        let a = results[0].as_ref().unwrap();
        let b = results[1].as_ref().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(cache.pending(), 0);
        assert_eq!(source.fetch_count(CHAIR), 1);
    }

    #[test]
    fn loads_started_before_clear_do_not_repopulate() {
        let source = ScriptedSource::new();
        source.serve(CHAIR, Fixture::textured_quads(1).glb());
        source.gate(CHAIR);
        let cache = cache_with(&source);

        let mut pool = LocalPool::new();
        let result = Rc::new(RefCell::new(None));
        let load = cache.load(CHAIR);
        let slot = result.clone();
        pool.spawner()
            .spawn_local(async move { *slot.borrow_mut() = Some(load.await) })
            .unwrap();
        pool.run_until_stalled();

        cache.clear();
        source.release(CHAIR);
        pool.run_until_stalled();

        // The caller still gets its model; the cache just does not keep it
        assert!(matches!(result.borrow().as_ref(), Some(Ok(_))));
        assert!(!cache.contains(CHAIR));
    }
}
