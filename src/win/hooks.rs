//! In-process interception of the waveOut API.
//!
//! The engine believes it is playing through a real wave device; these
//! detours give it a benign one. Only calls originating inside the engine's
//! own modules are diverted -- anything else (the host's real audio output
//! included) tail-calls the original entry point. All six detours install or
//! none do: a partial set would eat the audio of whichever call slipped
//! through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use retour::static_detour;
use thiserror::Error;
use windows::core::{s, w, PCSTR, PCWSTR};
use windows::Win32::Foundation::{HANDLE, HMODULE, HWND, LPARAM, WPARAM};
use windows::Win32::Media::Audio::{WAVEFORMATEX, WAVEHDR};
use windows::Win32::System::Diagnostics::Debug::RtlCaptureStackBackTrace;
use windows::Win32::System::LibraryLoader::{
    GetModuleHandleExW, GetModuleHandleW, GetProcAddress, LoadLibraryW,
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
};
use windows::Win32::System::Threading::SetEvent;
use windows::Win32::UI::WindowsAndMessaging::{PostMessageW, PostThreadMessageW};

use crate::host::sink;
use crate::host::WaveFormat;
use crate::win::session::{self, WinSession};

// waveform-audio constants; numeric values are fixed ABI.
const MMSYSERR_NOERROR: u32 = 0;
const MMSYSERR_INVALPARAM: u32 = 11;

/// Device notifications (WOM_* and their MM_WOM_* window forms share values).
pub const WOM_OPEN: u32 = 0x3BB;
pub const WOM_CLOSE: u32 = 0x3BC;
pub const WOM_DONE: u32 = 0x3BD;

const WHDR_DONE: u32 = 0x0000_0001;
const WHDR_PREPARED: u32 = 0x0000_0002;

const CALLBACK_TYPEMASK: u32 = 0x0007_0000;
const CALLBACK_WINDOW: u32 = 0x0001_0000;
const CALLBACK_THREAD: u32 = 0x0002_0000;
const CALLBACK_FUNCTION: u32 = 0x0003_0000;
const CALLBACK_EVENT: u32 = 0x0005_0000;

/// Where the engine asked its device notifications to go, captured at open.
#[derive(Clone, Copy, Debug, Default)]
pub enum CallbackTarget {
    #[default]
    None,
    Function {
        proc: usize,
        instance: usize,
    },
    Window {
        hwnd: isize,
    },
    Thread {
        thread_id: u32,
    },
    Event {
        handle: isize,
    },
}

impl CallbackTarget {
    fn from_open(flags: u32, callback: usize, instance: usize) -> Self {
        match flags & CALLBACK_TYPEMASK {
            CALLBACK_FUNCTION if callback != 0 => Self::Function {
                proc: callback,
                instance,
            },
            CALLBACK_WINDOW if callback != 0 => Self::Window {
                hwnd: callback as isize,
            },
            CALLBACK_THREAD if callback != 0 => Self::Thread {
                thread_id: callback as u32,
            },
            CALLBACK_EVENT if callback != 0 => Self::Event {
                handle: callback as isize,
            },
            _ => Self::None,
        }
    }
}

type WaveOutProc = unsafe extern "system" fn(isize, u32, usize, usize, usize);

/// Synthesize the device notification the engine is waiting for, in the
/// flavor it selected at open time.
pub fn notify_engine(session: &Arc<WinSession>, message: u32, header: *mut WAVEHDR) {
    let fake_device = Arc::as_ptr(session) as isize;
    let target = *session.callback.lock().unwrap();
    unsafe {
        match target {
            CallbackTarget::Function { proc, instance } => {
                let proc: WaveOutProc = std::mem::transmute(proc);
                proc(fake_device, message, instance, header as usize, 0);
            }
            CallbackTarget::Window { hwnd } => {
                let _ = PostMessageW(
                    Some(HWND(hwnd as *mut core::ffi::c_void)),
                    message,
                    WPARAM(fake_device as usize),
                    LPARAM(header as isize),
                );
            }
            CallbackTarget::Thread { thread_id } => {
                let _ = PostThreadMessageW(
                    thread_id,
                    message,
                    WPARAM(fake_device as usize),
                    LPARAM(header as isize),
                );
            }
            CallbackTarget::Event { handle } => {
                let _ = SetEvent(HANDLE(handle as *mut core::ffi::c_void));
            }
            CallbackTarget::None => {}
        }
    }
}

/// Walk a few return addresses and attribute the call to the engine if any
/// frame lands inside one of its modules. The detour trampoline sits between
/// us and the true caller, so a single-frame check would be brittle.
fn from_engine(session: &WinSession) -> bool {
    let mut frames = [std::ptr::null_mut(); 8];
    let captured =
        unsafe { RtlCaptureStackBackTrace(1, frames.len() as u32, frames.as_mut_ptr(), None) };
    for &frame in frames.iter().take(captured as usize) {
        if frame.is_null() {
            continue;
        }
        let mut module = HMODULE::default();
        let resolved = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                PCWSTR(frame as *const u16),
                &mut module,
            )
        };
        if resolved.is_ok() && session.modules.contains(module) {
            return true;
        }
    }
    false
}

static_detour! {
    static WaveOutOpenHook: unsafe extern "system" fn(*mut isize, u32, *const WAVEFORMATEX, usize, usize, u32) -> u32;
    static WaveOutPrepareHook: unsafe extern "system" fn(isize, *mut WAVEHDR, u32) -> u32;
    static WaveOutWriteHook: unsafe extern "system" fn(isize, *mut WAVEHDR, u32) -> u32;
    static WaveOutUnprepareHook: unsafe extern "system" fn(isize, *mut WAVEHDR, u32) -> u32;
    static WaveOutResetHook: unsafe extern "system" fn(isize) -> u32;
    static WaveOutCloseHook: unsafe extern "system" fn(isize) -> u32;
}

#[derive(Debug, Error)]
enum HookError {
    #[error("{0} not found in winmm.dll or winmmbase.dll")]
    MissingExport(&'static str),
    #[error(transparent)]
    Detour(#[from] retour::Error),
}

fn engine_caller() -> Option<Arc<WinSession>> {
    let session = session::hook_session()?;
    from_engine(&session).then_some(session)
}

fn hook_open(
    phwo: *mut isize,
    device_id: u32,
    pwfx: *const WAVEFORMATEX,
    callback: usize,
    instance: usize,
    flags: u32,
) -> u32 {
    let Some(session) = engine_caller() else {
        return unsafe { WaveOutOpenHook.call(phwo, device_id, pwfx, callback, instance, flags) };
    };

    unsafe {
        if !phwo.is_null() {
            *phwo = Arc::as_ptr(&session) as isize;
        }
        if !pwfx.is_null() {
            let f = &*pwfx;
            sink::open(
                &session.shared,
                WaveFormat {
                    format_tag: f.wFormatTag,
                    channels: f.nChannels,
                    samples_per_sec: f.nSamplesPerSec,
                    avg_bytes_per_sec: f.nAvgBytesPerSec,
                    block_align: f.nBlockAlign,
                    bits_per_sample: f.wBitsPerSample,
                },
            );
        }
    }

    *session.callback.lock().unwrap() = CallbackTarget::from_open(flags, callback, instance);
    notify_engine(&session, WOM_OPEN, std::ptr::null_mut());
    MMSYSERR_NOERROR
}

fn hook_prepare(hwo: isize, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let Some(_session) = engine_caller() else {
        return unsafe { WaveOutPrepareHook.call(hwo, pwh, cbwh) };
    };
    if let Some(header) = unsafe { pwh.as_mut() } {
        header.dwFlags |= WHDR_PREPARED;
    }
    MMSYSERR_NOERROR
}

fn hook_unprepare(hwo: isize, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let Some(_session) = engine_caller() else {
        return unsafe { WaveOutUnprepareHook.call(hwo, pwh, cbwh) };
    };
    if let Some(header) = unsafe { pwh.as_mut() } {
        header.dwFlags &= !WHDR_PREPARED;
    }
    MMSYSERR_NOERROR
}

fn hook_write(hwo: isize, pwh: *mut WAVEHDR, cbwh: u32) -> u32 {
    let Some(session) = engine_caller() else {
        return unsafe { WaveOutWriteHook.call(hwo, pwh, cbwh) };
    };

    let Some(header) = (unsafe { pwh.as_mut() }) else {
        return MMSYSERR_INVALPARAM;
    };

    if !header.lpData.0.is_null() && header.dwBufferLength > 0 {
        let data = unsafe {
            std::slice::from_raw_parts(header.lpData.0 as *const u8, header.dwBufferLength as usize)
        };
        // Copies the PCM and, once the queue is at its ceiling, blocks the
        // engine for the buffer's real-time duration.
        sink::write(&session.shared, data);
    }

    header.dwFlags |= WHDR_DONE;
    notify_engine(&session, WOM_DONE, pwh);
    MMSYSERR_NOERROR
}

fn hook_reset(hwo: isize) -> u32 {
    let Some(_session) = engine_caller() else {
        return unsafe { WaveOutResetHook.call(hwo) };
    };
    MMSYSERR_NOERROR
}

fn hook_close(hwo: isize) -> u32 {
    let Some(session) = engine_caller() else {
        return unsafe { WaveOutCloseHook.call(hwo) };
    };
    notify_engine(&session, WOM_CLOSE, std::ptr::null_mut());
    MMSYSERR_NOERROR
}

fn wave_out_export(name: PCSTR, display: &'static str) -> Result<usize, HookError> {
    // winmm first; some Windows builds route the real implementations
    // through winmmbase.
    unsafe {
        for module_name in [w!("winmm.dll"), w!("winmmbase.dll")] {
            if let Ok(module) = GetModuleHandleW(module_name) {
                if let Some(proc) = GetProcAddress(module, name) {
                    return Ok(proc as usize);
                }
            }
        }
    }
    Err(HookError::MissingExport(display))
}

macro_rules! init_detour {
    ($detour:ident, $name:literal, $ty:ty, $handler:expr) => {{
        let addr = wave_out_export(s!($name), $name)?;
        unsafe { $detour.initialize(std::mem::transmute::<usize, $ty>(addr), $handler)? };
    }};
}

fn install_all() -> Result<(), HookError> {
    unsafe {
        // Make sure the targets are resident before resolving them.
        let _ = LoadLibraryW(w!("winmm.dll"));
        let _ = LoadLibraryW(w!("winmmbase.dll"));
    }

    type OpenFn = unsafe extern "system" fn(*mut isize, u32, *const WAVEFORMATEX, usize, usize, u32) -> u32;
    type HeaderFn = unsafe extern "system" fn(isize, *mut WAVEHDR, u32) -> u32;
    type PlainFn = unsafe extern "system" fn(isize) -> u32;

    // Initialize everything before enabling anything, so a resolution
    // failure leaves the API untouched.
    init_detour!(WaveOutOpenHook, "waveOutOpen", OpenFn, hook_open);
    init_detour!(WaveOutPrepareHook, "waveOutPrepareHeader", HeaderFn, hook_prepare);
    init_detour!(WaveOutWriteHook, "waveOutWrite", HeaderFn, hook_write);
    init_detour!(
        WaveOutUnprepareHook,
        "waveOutUnprepareHeader",
        HeaderFn,
        hook_unprepare
    );
    init_detour!(WaveOutResetHook, "waveOutReset", PlainFn, hook_reset);
    init_detour!(WaveOutCloseHook, "waveOutClose", PlainFn, hook_close);

    unsafe {
        WaveOutOpenHook.enable()?;
        WaveOutPrepareHook.enable()?;
        WaveOutWriteHook.enable()?;
        WaveOutUnprepareHook.enable()?;
        WaveOutResetHook.enable()?;
        WaveOutCloseHook.enable()?;
    }
    Ok(())
}

static INSTALL: Once = Once::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the six detours once per process. On failure the layer stays
/// fully passive and the engine talks to the real device (audibly, but
/// without breaking the host).
pub fn ensure_installed() -> bool {
    INSTALL.call_once(|| match install_all() {
        Ok(()) => {
            INSTALLED.store(true, Ordering::Relaxed);
            log::info!("[hooks] waveOut interception active");
        }
        Err(err) => {
            log::warn!("[hooks] waveOut interception unavailable: {err}");
        }
    });
    INSTALLED.load(Ordering::Relaxed)
}
