//! Background thread following a module across unloads and reloads
//!
//! Some games unload and reload their engine module (e.g. when switching renderers). The
//! watcher polls for the module and, whenever its base address changes, tears down what was
//! applied to the old instance and applies it again to the new one.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::image::ModuleImage;
use super::shutdown::ShutdownSignal;
use super::find_module;
use crate::scan::Image;

/// What the watcher last saw
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchState {
    /// Base address of the module, `None` while it is not loaded
    pub base: Option<usize>,
    /// Whether `on_load` reported success for the current instance
    pub applied: bool,
}

/// Reacts to changes between polls
struct Watch<L, U> {
    /// Shared with [`ModuleWatcher`]
    state: Arc<Mutex<WatchState>>,
    /// Applies fixes; returns whether they took
    on_load: L,
    /// Tears fixes down
    on_unload: U,
}

impl<L, U> Watch<L, U>
where
    L: FnMut(&ModuleImage) -> bool,
    U: FnMut(),
{
    /// Compares `current` against the last poll and runs the callbacks on a change.
    ///
    /// The state lock is held across the callbacks so nobody observes a half-applied module.
    fn step(&mut self, current: Option<ModuleImage>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let base = current.as_ref().map(Image::base);
        if base == state.base {
            return;
        }

        if let Some(old) = state.base {
            info!("module at {old:#x} went away");
            if state.applied {
                (self.on_unload)();
            }
            state.applied = false;
        }

        state.base = base;
        if let Some(module) = current {
            info!("{} loaded at {:#x}", module.name(), module.base());
            state.applied = (self.on_load)(&module);
            if !state.applied {
                warn!("fixes were not applied to {}", module.name());
            }
        }
    }
}

/// Handle to a watcher thread. Dropping it stops the thread.
pub struct ModuleWatcher {
    /// Stops the thread
    shutdown: Arc<ShutdownSignal>,
    /// Last observed state
    state: Arc<Mutex<WatchState>>,
    /// `None` once joined
    handle: Option<JoinHandle<()>>,
}

impl ModuleWatcher {
    /// Watches the module `name`, polling every `interval`.
    ///
    /// `on_load` runs for every new instance of the module and returns whether the fixes were
    /// applied; `on_unload` runs before a previously applied instance is replaced.
    pub fn spawn<L, U>(
        name: impl Into<String>,
        interval: Duration,
        on_load: L,
        on_unload: U,
    ) -> io::Result<Self>
    where
        L: FnMut(&ModuleImage) -> bool + Send + 'static,
        U: FnMut() + Send + 'static,
    {
        let name = name.into();
        Self::spawn_with(
            format!("watch {name}"),
            move || find_module(&name),
            interval,
            on_load,
            on_unload,
        )
    }

    /// Like [`ModuleWatcher::spawn`] with a custom lookup
    pub fn spawn_with<F, L, U>(
        thread_name: String,
        mut lookup: F,
        interval: Duration,
        on_load: L,
        on_unload: U,
    ) -> io::Result<Self>
    where
        F: FnMut() -> Option<ModuleImage> + Send + 'static,
        L: FnMut(&ModuleImage) -> bool + Send + 'static,
        U: FnMut() + Send + 'static,
    {
        let shutdown = Arc::new(ShutdownSignal::new());
        let state = Arc::new(Mutex::new(WatchState::default()));
        let mut watch = Watch {
            state: state.clone(),
            on_load,
            on_unload,
        };

        let signal = shutdown.clone();
        let handle = thread::Builder::new().name(thread_name).spawn(move || {
            debug!("module watcher started");
            loop {
                watch.step(lookup());
                if signal.wait(interval) {
                    break;
                }
            }
            debug!("module watcher stopped");
        })?;

        Ok(Self {
            shutdown,
            state,
            handle: Some(handle),
        })
    }

    /// Snapshot of the current state
    pub fn state(&self) -> WatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the lock the watcher holds while tearing down and applying fixes.
    ///
    /// Changes made inside `f` cannot interleave with a reload.
    pub fn with_state<R>(&self, f: impl FnOnce(&WatchState) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Stops the thread and waits for it to finish
    pub fn stop(mut self) {
        self.join();
    }

    /// Signals and joins the thread
    fn join(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("module watcher panicked");
            }
        }
    }
}

impl Drop for ModuleWatcher {
    fn drop(&mut self) {
        self.join();
    }
}
