//! # Fixer
//!
//! Glue for injected fixers. A [`FixContext`] owns everything one fixer touches: its settings,
//! the target module, its hooks and its memory patches. Individual fixes implement [`Fix`] and
//! are applied in order; a fix that fails is logged and the rest still run.
//!
//! ```no_run
//! use libfix::fixer::{self, Fix, FixContext};
//! use libfix::scan::Signature;
//!
//! struct AspectRatio;
//!
//! impl Fix for AspectRatio {
//!     fn name(&self) -> &str {
//!         "aspect ratio"
//!     }
//!
//!     fn apply(&self, ctx: &mut FixContext) -> libfix::Result<()> {
//!         let site = ctx.resolve(&Signature::new("aspect", "C7 43 ?? 39 8E E3 3F")?.offset(3))?;
//!         let aspect = ctx.config.aspect_ratio();
//!         let patch = unsafe { ctx.module.write_scalar(site, aspect)? };
//!         ctx.keep(patch);
//!         Ok(())
//!     }
//! }
//!
//! fixer::spawn_worker("fixer", || {
//!     let mut ctx = FixContext::attach("game.exe")?;
//!     ctx.apply(&[&AspectRatio]);
//!     ctx.persist();
//!     Ok(())
//! })
//! .unwrap();
//! ```

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fov::AspectScale;
use crate::hook::{Detours, Registers};
use crate::module::{
    self, current_module_path, ModuleImage, ModuleWatcher, ShutdownSignal, WatchState,
};
use crate::patcher::mem::MemoryPatch;
use crate::patcher::PatchGuard;
use crate::scan::{Image, Signature};

/// How long [`FixContext::attach`] waits for the target module
pub const MODULE_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for the target module
pub const MODULE_POLL: Duration = Duration::from_millis(100);

/// One self-contained change to the game
pub trait Fix {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Applies the fix. Return [`Error::PatternNotFound`](crate::Error::PatternNotFound) when
    /// this build of the game does not have the code being fixed.
    fn apply(&self, ctx: &mut FixContext) -> Result<()>;
}

/// A [`Fix`] made from a closure, see [`fix`]
pub struct FnFix<F> {
    /// Name used in logs
    name: String,
    /// The fix itself
    apply: F,
}

/// Wraps a closure as a [`Fix`]
pub fn fix<F>(name: impl Into<String>, apply: F) -> FnFix<F>
where
    F: Fn(&mut FixContext) -> Result<()>,
{
    FnFix {
        name: name.into(),
        apply,
    }
}

impl<F> Fix for FnFix<F>
where
    F: Fn(&mut FixContext) -> Result<()>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, ctx: &mut FixContext) -> Result<()> {
        (self.apply)(ctx)
    }
}

/// Outcome of [`FixContext::apply`], by fix name
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Fixes that succeeded
    pub applied: Vec<String>,
    /// Fixes whose pattern was not found
    pub skipped: Vec<String>,
    /// Fixes that failed for any other reason
    pub failed: Vec<String>,
}

impl ApplyReport {
    /// Whether every fix succeeded
    pub fn all_applied(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

/// State owned by one fixer
pub struct FixContext {
    /// Settings
    pub config: Config,
    /// Module being fixed
    pub module: ModuleImage,
    /// Hooks installed by fixes
    pub detours: Detours,
    /// Memory patches kept alive until the context is dropped or persisted
    patches: Vec<MemoryPatch>,
}

impl FixContext {
    /// Creates a context for `module`
    pub fn new(config: Config, module: ModuleImage) -> Self {
        Self {
            config,
            module,
            detours: Detours::new(),
            patches: Vec::new(),
        }
    }

    /// Loads the config next to this library and waits for `target` to load
    pub fn attach(target: &str) -> Result<Self> {
        let config = Config::load_beside(current_module_path()?)?;
        let shutdown = ShutdownSignal::new();
        let module = module::wait_for_module(target, MODULE_TIMEOUT, MODULE_POLL, &shutdown)?;
        Ok(Self::new(config, module))
    }

    /// Finds `signature` in the target module
    pub fn resolve(&self, signature: &Signature) -> Result<usize> {
        signature.resolve(&self.module)
    }

    /// Aspect scale from `native` to the configured resolution
    pub fn aspect_scale(&self, native: f32) -> AspectScale {
        AspectScale::from_config(native, &self.config)
    }

    /// Keeps a patch alive for as long as the context
    pub fn keep(&mut self, patch: MemoryPatch) {
        self.patches.push(patch);
    }

    /// Hooks `address` through [`FixContext::detours`].
    ///
    /// Fails with [`Error::PatchTargetInvalid`] without touching anything if `address` lies
    /// outside the target module.
    ///
    /// # Safety
    ///
    /// See [`Detours::install`]
    pub unsafe fn hook<F>(&self, address: usize, callback: F) -> Result<()>
    where
        F: Fn(&mut Registers) + Send + Sync + 'static,
    {
        if !self.module.contains(address, 1) {
            return Err(Error::PatchTargetInvalid { address });
        }
        self.detours.install(address, callback)
    }

    /// Applies `fixes` in order, logging each outcome. Nothing runs if the config disables the fixer.
    pub fn apply(&mut self, fixes: &[&dyn Fix]) -> ApplyReport {
        let mut report = ApplyReport::default();
        if !self.config.enabled {
            info!("fixer disabled in config");
            return report;
        }

        for fix in fixes {
            let name = fix.name().to_string();
            match fix.apply(self) {
                Ok(()) => {
                    info!("{name}: applied");
                    report.applied.push(name);
                }
                Err(e) if e.is_not_found() => {
                    warn!("{name}: skipped, {e}");
                    report.skipped.push(name);
                }
                Err(e) => {
                    error!("{name}: failed, {e}");
                    report.failed.push(name);
                }
            }
        }
        report
    }

    /// Undoes every patch and removes every hook
    pub fn revert(&mut self) {
        self.detours.clear();
        // later patches may overlap earlier ones, so undo newest first
        while let Some(patch) = self.patches.pop() {
            patch.restore();
        }
    }

    /// Keeps every patch and hook for the rest of the process
    pub fn persist(self) {
        let FixContext {
            patches, detours, ..
        } = self;
        patches.into_iter().for_each(PatchGuard::persist);
        // hooks restore on drop, so they are never dropped
        std::mem::forget(detours);
    }
}

/// Fixes applied by [`watch`] to every instance of a module
pub type FixList = Vec<Box<dyn Fix + Send>>;

/// The [`FixContext`] of the module instance a [`FixWatcher`] last fixed
type Current = Arc<Mutex<Option<FixContext>>>;

/// Keeps fixes applied to a module that may unload and reload, see [`watch`]
pub struct FixWatcher {
    /// Context for the loaded instance, `None` while the module is gone. Only locked after the
    /// watcher's state lock.
    current: Current,
    /// Polling thread
    watcher: ModuleWatcher,
}

impl FixWatcher {
    /// Snapshot of the watcher state
    pub fn state(&self) -> WatchState {
        self.watcher.state()
    }

    /// Runs `f` on the current context with reloads held off, e.g. to install a hook from another
    /// thread. `f` gets `None` while the module is not loaded.
    pub fn with_context<R>(&self, f: impl FnOnce(Option<&mut FixContext>) -> R) -> R {
        self.watcher.with_state(|_| {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            f(current.as_mut())
        })
    }

    /// Stops watching and reverts the fixes on the current instance
    pub fn stop(self) {
        let FixWatcher { current, watcher } = self;
        watcher.stop();
        let context = current.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut context) = context {
            context.revert();
        }
    }
}

/// Applies `fixes` to `target` whenever a new instance of it loads, reverting them on the old
/// instance first. The module is polled every `interval`.
pub fn watch(
    target: &str,
    config: Config,
    fixes: FixList,
    interval: Duration,
) -> io::Result<FixWatcher> {
    let name = target.to_string();
    watch_with(
        format!("watch {target}"),
        move || module::find_module(&name),
        config,
        fixes,
        interval,
    )
}

/// Like [`watch`] with a custom module lookup
pub fn watch_with<F>(
    thread_name: String,
    lookup: F,
    config: Config,
    fixes: FixList,
    interval: Duration,
) -> io::Result<FixWatcher>
where
    F: FnMut() -> Option<ModuleImage> + Send + 'static,
{
    let current = Current::default();

    let on_load = {
        let current = current.clone();
        move |module: &ModuleImage| {
            let mut context = FixContext::new(config.clone(), module.clone());
            let fixes: Vec<&dyn Fix> = fixes.iter().map(|fix| &**fix as &dyn Fix).collect();
            let report = context.apply(&fixes);
            *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);
            !report.applied.is_empty()
        }
    };
    let on_unload = {
        let current = current.clone();
        move || {
            let context = current.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut context) = context {
                info!("reverting fixes on {}", context.module.name());
                context.revert();
            }
        }
    };

    let watcher = ModuleWatcher::spawn_with(thread_name, lookup, interval, on_load, on_unload)?;
    Ok(FixWatcher { current, watcher })
}

/// Runs `work` on a named thread and logs how it ended, including panics
pub fn spawn_worker<F>(name: &str, work: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new().name(thread_name.clone()).spawn(move || {
        info!("{thread_name} started");
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => info!("{thread_name} finished"),
            Ok(Err(e)) => error!("{thread_name} failed: {e}"),
            Err(_) => error!("{thread_name} panicked"),
        }
    })
}
