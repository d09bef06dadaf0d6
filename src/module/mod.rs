//! # Module
//!
//! Locating loaded modules: lookup by name, a bounded wait for a module that loads late, the
//! path of the fixer's own module, and a watcher that follows a module across reloads.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::scan::Image;

pub mod image;
#[cfg(unix)]
pub mod maps;
pub mod shutdown;
pub mod watcher;

pub use image::ModuleImage;
pub use shutdown::ShutdownSignal;
pub use watcher::{ModuleWatcher, WatchState};

/// Finds a loaded module by file name, e.g. `"game.exe"` or `"libgame.so"`
#[cfg(windows)]
pub fn find_module(name: &str) -> Option<ModuleImage> {
    use std::mem;

    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let wide: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
    let module = unsafe { GetModuleHandleW(wide.as_ptr()) };
    if module.is_null() {
        return None;
    }

    let mut info = MODULEINFO {
        lpBaseOfDll: std::ptr::null_mut(),
        SizeOfImage: 0,
        EntryPoint: std::ptr::null_mut(),
    };
    let ok = unsafe {
        GetModuleInformation(
            GetCurrentProcess(),
            module,
            &mut info,
            mem::size_of::<MODULEINFO>() as u32,
        )
    };
    if ok == 0 {
        debug!("GetModuleInformation failed for {name}");
        return None;
    }

    // Safety: the loader keeps SizeOfImage bytes mapped while the module is loaded
    Some(unsafe {
        ModuleImage::from_raw_parts(name, info.lpBaseOfDll as usize, info.SizeOfImage as usize)
    })
}

/// Finds a loaded module by file name, e.g. `"game.exe"` or `"libgame.so"`
#[cfg(unix)]
pub fn find_module(name: &str) -> Option<ModuleImage> {
    let mappings = maps::current().ok()?;
    let (_, span) = maps::module_span(&mappings, name)?;
    // Safety: the span only covers readable mappings of the module
    Some(unsafe { ModuleImage::from_raw_parts(name, span.start, span.end - span.start) })
}

/// Polls for `name` every `poll` until it is loaded.
///
/// Gives up with [`Error::ModuleNotLoaded`] once `timeout` has passed or `shutdown` is raised.
pub fn wait_for_module(
    name: &str,
    timeout: Duration,
    poll: Duration,
    shutdown: &ShutdownSignal,
) -> Result<ModuleImage> {
    let start = Instant::now();
    loop {
        if let Some(module) = find_module(name) {
            info!("{name} loaded at {:#x}", module.base());
            return Ok(module);
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() || shutdown.wait(poll.min(remaining)) {
            debug!("gave up waiting for {name} after {:?}", start.elapsed());
            return Err(Error::ModuleNotLoaded(name.to_string()));
        }
    }
}

/// Path of the module containing this library: the fixer DLL when injected, otherwise the
/// executable it is linked into
#[cfg(windows)]
pub fn current_module_path() -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use std::ptr;

    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    let mut module: HMODULE = ptr::null_mut();
    let anchor = current_module_path as fn() -> Result<PathBuf> as *const u16;
    let ok = unsafe {
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
            anchor,
            &mut module,
        )
    };
    if ok == 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    let mut buffer = vec![0u16; 1024];
    loop {
        let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as u32) };
        if len == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // a full buffer means the path was truncated
        if (len as usize) < buffer.len() {
            buffer.truncate(len as usize);
            return Ok(PathBuf::from(OsString::from_wide(&buffer)));
        }
        buffer.resize(buffer.len() * 2, 0);
    }
}

/// Path of the module containing this library: the fixer library when injected, otherwise the
/// executable it is linked into
#[cfg(unix)]
pub fn current_module_path() -> Result<PathBuf> {
    let anchor = current_module_path as fn() -> Result<PathBuf> as usize;
    maps::path_of(&maps::current()?, anchor).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no file mapping contains this library",
        )
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// File name of the test binary
    fn own_name() -> String {
        let path = current_module_path().unwrap();
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    /// The module this code lives in is found and contains its own code
    fn test_find_own_module() {
        let name = own_name();
        let module = find_module(&name).unwrap();
        assert_eq!(module.name(), name);
        assert!(module.size() > 0);

        let code = test_find_own_module as fn() as usize;
        assert!(module.base() <= code);
    }

    #[test]
    fn test_missing_module() {
        assert!(find_module("definitely-not-loaded.dll").is_none());
    }

    #[test]
    fn test_wait_timeout() {
        let shutdown = ShutdownSignal::new();
        let start = Instant::now();
        let err = wait_for_module(
            "definitely-not-loaded.dll",
            Duration::from_millis(60),
            Duration::from_millis(20),
            &shutdown,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ModuleNotLoaded(name) if name == "definitely-not-loaded.dll"));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    /// A raised shutdown signal ends the wait without waiting out the timeout
    fn test_wait_shutdown() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let start = Instant::now();
        let result = wait_for_module(
            "definitely-not-loaded.dll",
            Duration::from_secs(30),
            Duration::from_millis(100),
            &shutdown,
        );
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_loaded() {
        let shutdown = ShutdownSignal::new();
        let module = wait_for_module(
            &own_name(),
            Duration::from_secs(1),
            Duration::from_millis(10),
            &shutdown,
        )
        .unwrap();
        assert!(module.size() > 0);
    }
}
