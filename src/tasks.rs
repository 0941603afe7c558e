//! Single-threaded task spawning for the render thread.
//!
//! On the desktop, spawned futures live in a [`LocalPool`] that the event
//! loop drives once per frame. In the browser they go straight to the
//! JavaScript microtask queue.

use futures::future::LocalBoxFuture;

#[cfg(not(target_arch = "wasm32"))]
use futures::executor::{LocalPool, LocalSpawner};
#[cfg(not(target_arch = "wasm32"))]
use futures::task::LocalSpawnExt;

pub struct TaskSpawner {
    #[cfg(not(target_arch = "wasm32"))]
    pool: std::cell::RefCell<LocalPool>,
    /// Usable while the pool runs, so tasks can spawn tasks.
    #[cfg(not(target_arch = "wasm32"))]
    spawner: LocalSpawner,
}

impl TaskSpawner {
    pub fn new() -> Self {
        #[cfg(not(target_arch = "wasm32"))]
        let pool = LocalPool::new();
        Self {
            #[cfg(not(target_arch = "wasm32"))]
            spawner: pool.spawner(),
            #[cfg(not(target_arch = "wasm32"))]
            pool: std::cell::RefCell::new(pool),
        }
    }

    pub fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Err(err) = self.spawner.spawn_local(task) {
                log::error!("Failed to spawn task: {}", err);
            }
        }
        #[cfg(target_arch = "wasm32")]
        wasm_bindgen_futures::spawn_local(task);
    }

    /// Runs every task that can make progress without blocking. A no-op in
    /// the browser, where the page's event loop drives tasks.
    pub fn run_until_stalled(&self) {
        #[cfg(not(target_arch = "wasm32"))]
        {
            match self.pool.try_borrow_mut() {
                Ok(mut pool) => pool.run_until_stalled(),
                Err(_) => log::warn!("Task pool is already running"),
            }
        }
    }
}

impl Default for TaskSpawner {
    fn default() -> Self {
        Self::new()
    }
}
