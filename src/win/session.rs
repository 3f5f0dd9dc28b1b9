//! Process-wide session: the engine keeps unsharable global state, so there
//! is exactly one host instance, refcounted across the screen reader's
//! driver reloads. A second init while the first is alive hands back the
//! same session; teardown only happens when the last reference goes.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use lazy_static::lazy_static;
use thiserror::Error;
use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{FreeLibrary, HMODULE, HWND, LPARAM, WPARAM};
use windows::Win32::System::LibraryLoader::LoadLibraryW;
use windows::Win32::System::Threading::{
    GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_ABOVE_NORMAL,
};
use windows::Win32::UI::WindowsAndMessaging::{
    DestroyWindow, PostMessageW, RegisterWindowMessageW,
};

use crate::host::sync::SyncMessageFilter;
use crate::host::{worker, Command, Shared};
use crate::win::engine::{self, DllEngine, EngineSymbols, WM_HOST_KICK};
use crate::win::hooks::{self, CallbackTarget};

/// Sibling libraries the base engine loads per language; the caller
/// attribution and the force-unload have to know about them too.
const COMPANION_MODULES: [PCWSTR; 2] = [w!("tieng32.dll"), w!("tispan32.dll")];

/// How long init waits for the worker to open the engine.
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine module handles, kept as raw values so the hook path can compare
/// them without touching the loader.
pub struct EngineModules {
    base: AtomicIsize,
    companions: [AtomicIsize; 2],
}

impl EngineModules {
    fn new(base: HMODULE, companions: [Option<HMODULE>; 2]) -> Self {
        let raw = |m: Option<HMODULE>| AtomicIsize::new(m.map_or(0, |m| m.0 as isize));
        Self {
            base: AtomicIsize::new(base.0 as isize),
            companions: [raw(companions[0]), raw(companions[1])],
        }
    }

    pub fn contains(&self, module: HMODULE) -> bool {
        let raw = module.0 as isize;
        raw != 0
            && (self.base.load(Ordering::Relaxed) == raw
                || self.companions.iter().any(|c| c.load(Ordering::Relaxed) == raw))
    }

    /// Unload everything, companions first. The engine re-pins itself with
    /// internal LoadLibrary calls, so one FreeLibrary may leave the module
    /// mapped; freeing until the loader refuses guarantees the next init
    /// gets a fresh DLL_PROCESS_ATTACH.
    fn force_unload_all(&self) {
        for slot in self.companions.iter().chain(std::iter::once(&self.base)) {
            let raw = slot.swap(0, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let module = HMODULE(raw as *mut core::ffi::c_void);
            unsafe { while FreeLibrary(module).is_ok() {} }
        }
    }
}

/// One hosted engine instance.
pub struct WinSession {
    pub shared: Arc<Shared>,
    pub symbols: EngineSymbols,
    pub modules: EngineModules,
    /// Worker's message-only window, 0 until created.
    pub msg_hwnd: AtomicIsize,
    pub sync: SyncMessageFilter,
    /// waveOut callback target captured by the open hook.
    pub callback: Mutex<CallbackTarget>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WinSession {
    /// Wake the worker's message wait (used after queueing work or stop).
    pub fn kick(&self) {
        let hwnd = self.msg_hwnd.load(Ordering::Relaxed);
        if hwnd != 0 {
            unsafe {
                let _ = PostMessageW(
                    Some(HWND(hwnd as *mut core::ffi::c_void)),
                    WM_HOST_KICK,
                    WPARAM(0),
                    LPARAM(0),
                );
            }
        }
    }
}

struct GlobalEntry {
    session: Arc<WinSession>,
    refs: u32,
}

lazy_static! {
    /// Singleton slot, guarded across init/free.
    static ref GLOBAL: Mutex<Option<GlobalEntry>> = Mutex::new(None);
    /// Lock-light view for the hook path and the window procedure. Stays
    /// populated through teardown so the hooks keep swallowing the engine's
    /// waveOut calls until it has fully stopped.
    static ref HOOK_SESSION: RwLock<Option<Arc<WinSession>>> = RwLock::new(None);
}

/// Session seen by the hooks and the message window, if any.
pub fn hook_session() -> Option<Arc<WinSession>> {
    HOOK_SESSION.read().unwrap().clone()
}

/// Validate a consumer-supplied handle against the live session.
pub fn resolve(handle: *const WinSession) -> Option<Arc<WinSession>> {
    if handle.is_null() {
        return None;
    }
    let live = hook_session()?;
    (Arc::as_ptr(&live) == handle).then_some(live)
}

fn directory_of(path: &[u16]) -> Option<Vec<u16>> {
    let cut = path
        .iter()
        .rposition(|&c| c == '\\' as u16 || c == '/' as u16)?;
    Some(path[..cut].to_vec())
}

fn join_wide(dir: &[u16], file: PCWSTR) -> Vec<u16> {
    let mut joined = dir.to_vec();
    joined.push('\\' as u16);
    unsafe {
        let mut p = file.0;
        while *p != 0 {
            joined.push(*p);
            p = p.add(1);
        }
    }
    joined.push(0);
    joined
}

#[derive(Debug, Error)]
enum InitError {
    #[error("engine module load failed: {0}")]
    ModuleLoad(windows::core::Error),
    #[error("required engine export missing")]
    MissingExport,
    #[error("worker spawn failed: {0}")]
    WorkerSpawn(std::io::Error),
    #[error("worker failed to open the engine or timed out")]
    WorkerInit,
}

/// Initialize (or re-reference) the singleton. `base_path` is the engine's
/// primary DLL, without a trailing NUL. Returns `None` on any init failure;
/// no partial session ever becomes visible.
pub fn init(base_path: &[u16], initial_voice: i32) -> Option<Arc<WinSession>> {
    let mut slot = GLOBAL.lock().unwrap();

    if let Some(entry) = slot.as_mut() {
        // The host tears down driver instances lazily and may construct the
        // replacement first; handing out the existing session keeps that
        // switchover from failing.
        entry.refs += 1;
        log::debug!("[session] reusing live instance (refs {})", entry.refs);
        return Some(entry.session.clone());
    }

    match boot(base_path, initial_voice.max(1)) {
        Ok(session) => {
            *slot = Some(GlobalEntry {
                session: session.clone(),
                refs: 1,
            });
            Some(session)
        }
        Err(err) => {
            log::warn!("[session] init failed: {err}");
            None
        }
    }
}

/// Everything between "no live session" and "worker confirmed the engine is
/// open". Cleans up after itself on every failure path.
fn boot(base_path: &[u16], voice: i32) -> Result<Arc<WinSession>, InitError> {
    let mut path_z = base_path.to_vec();
    path_z.push(0);
    let base = unsafe { LoadLibraryW(PCWSTR(path_z.as_ptr())) }.map_err(InitError::ModuleLoad)?;

    // Language companions live next to the base module; missing ones are
    // fine, the base engine loads what it needs.
    let mut companions = [None, None];
    if let Some(dir) = directory_of(base_path) {
        for (slot, name) in companions.iter_mut().zip(COMPANION_MODULES) {
            let full = join_wide(&dir, name);
            *slot = unsafe { LoadLibraryW(PCWSTR(full.as_ptr())) }.ok();
        }
    }

    let Some(symbols) = EngineSymbols::resolve(base) else {
        let modules = EngineModules::new(base, companions);
        modules.force_unload_all();
        return Err(InitError::MissingExport);
    };

    let session = Arc::new(WinSession {
        shared: Shared::new(voice),
        symbols,
        modules: EngineModules::new(base, companions),
        msg_hwnd: AtomicIsize::new(0),
        sync: SyncMessageFilter::new(unsafe { RegisterWindowMessageW(w!("SVSyncMessages")) }),
        callback: Mutex::new(CallbackTarget::None),
        worker: Mutex::new(None),
    });

    // The engine may touch waveOut as soon as it opens, so the hooks and the
    // hook-visible session must be in place before the worker starts.
    *HOOK_SESSION.write().unwrap() = Some(session.clone());
    if !hooks::ensure_installed() {
        log::warn!("[session] continuing without interception; audio will go to the device");
    }

    let thread_session = session.clone();
    let spawned = std::thread::Builder::new()
        .name("softvoice-host-worker".into())
        .spawn(move || {
            unsafe {
                let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_ABOVE_NORMAL);
            }

            let Some(hwnd) = engine::create_message_window() else {
                thread_session.shared.init_ok.store(-1, Ordering::Relaxed);
                thread_session.shared.init_event.set();
                return;
            };
            thread_session.msg_hwnd.store(hwnd.0 as isize, Ordering::Relaxed);

            let shared = thread_session.shared.clone();
            let engine = DllEngine::new(thread_session.clone());
            worker::run(shared, engine, voice);

            let hwnd = thread_session.msg_hwnd.swap(0, Ordering::Relaxed);
            if hwnd != 0 {
                unsafe {
                    let _ = DestroyWindow(HWND(hwnd as *mut core::ffi::c_void));
                }
            }
        });

    match spawned {
        Ok(handle) => *session.worker.lock().unwrap() = Some(handle),
        Err(err) => {
            session.modules.force_unload_all();
            *HOOK_SESSION.write().unwrap() = None;
            return Err(InitError::WorkerSpawn(err));
        }
    }

    let signaled = session.shared.init_event.wait_timeout(INIT_TIMEOUT);
    if !signaled || session.shared.init_ok.load(Ordering::Relaxed) != 1 {
        teardown(&session);
        *HOOK_SESSION.write().unwrap() = None;
        return Err(InitError::WorkerInit);
    }

    log::info!("[session] engine host ready (voice {voice})");
    Ok(session)
}

/// Release one reference; the last one tears the session down.
pub fn free(handle: *const WinSession) {
    let mut slot = GLOBAL.lock().unwrap();
    let Some(entry) = slot.as_mut() else { return };
    if Arc::as_ptr(&entry.session) != handle {
        return;
    }
    if entry.refs > 1 {
        entry.refs -= 1;
        log::debug!("[session] released reference (refs {})", entry.refs);
        return;
    }

    let entry = slot.take().unwrap();
    teardown(&entry.session);
    // Only now do the hooks go passive; until here they kept absorbing the
    // engine's waveOut traffic.
    *HOOK_SESSION.write().unwrap() = None;
    log::info!("[session] engine host torn down");
}

fn teardown(session: &Arc<WinSession>) {
    let shared = &session.shared;

    // Cancel everything and queue the Quit in one sweep.
    shared.gens.cancel.fetch_add(1, Ordering::Relaxed);
    shared.gens.active.store(0, Ordering::Relaxed);
    shared.gens.current.store(0, Ordering::Relaxed);
    shared.output.clear();
    {
        let mut queue = shared.commands.lock().unwrap();
        queue.clear();
        queue.push_back(Command::Quit);
    }
    shared.stop_event.set();
    shared.done_event.set();
    shared.start_event.set();
    shared.cmd_event.set();
    session.kick();

    if let Some(handle) = session.worker.lock().unwrap().take() {
        let _ = handle.join();
    }

    shared.output.clear();
    session.modules.force_unload_all();
}
