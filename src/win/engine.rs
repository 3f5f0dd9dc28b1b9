//! Binding to the engine DLL and the message-only window it reports
//! completion through.
//!
//! The engine is a 32-bit library with stdcall exports; depending on the
//! toolchain that produced a given build, the names are either plain
//! ("SVTTS") or decorated ("_SVTTS@32"), so every symbol is resolved under
//! both. Four entry points are mandatory; the setters are optional and a
//! missing one just disables its knob. Every call into the engine goes
//! through an exception barrier: a fault inside the engine reads as -1, not
//! as a crash of the host process.

use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};

use windows::core::{s, w, PCSTR};
use windows::Win32::Foundation::{HMODULE, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DispatchMessageW, MsgWaitForMultipleObjectsEx, PeekMessageW,
    RegisterClassExW, TranslateMessage, HWND_MESSAGE, MSG, MWMO_INPUTAVAILABLE, PM_REMOVE,
    QS_ALLINPUT, WINDOW_EX_STYLE, WINDOW_STYLE, WM_APP, WNDCLASSEXW,
};

use crate::host::engine::{Engine, EngineParam};
use crate::host::sync::SyncSignal;
use crate::host::Shared;
use crate::win::session::{self, WinSession};

/// Posted to the worker window to wake its message wait after a command or
/// stop was queued. Carries nothing; arrival is the signal.
pub const WM_HOST_KICK: u32 = WM_APP + 0x40;

// stdcall on x86, which is what the 32-bit engine uses.
pub type SvOpenFn = unsafe extern "system" fn(*mut i32, HWND, i32, i32, i32) -> i32;
pub type SvHandleFn = unsafe extern "system" fn(i32) -> i32;
pub type SvSetFn = unsafe extern "system" fn(i32, i32) -> i32;
pub type SvTtsFn =
    unsafe extern "system" fn(i32, *const u8, i32, i32, HWND, i32, i32, i32) -> i32;

/// Resolved engine entry points.
pub struct EngineSymbols {
    pub open: SvOpenFn,
    pub close: SvHandleFn,
    pub abort: SvHandleFn,
    pub tts: SvTtsFn,

    pub set_language: Option<SvSetFn>,

    pub set_rate: Option<SvSetFn>,
    pub set_pitch: Option<SvSetFn>,
    pub set_f0_range: Option<SvSetFn>,
    pub set_f0_perturb: Option<SvSetFn>,
    pub set_vowel_factor: Option<SvSetFn>,
    pub set_voicing_bias: Option<SvSetFn>,
    pub set_frication_bias: Option<SvSetFn>,
    pub set_aspiration_bias: Option<SvSetFn>,
    pub set_personality: Option<SvSetFn>,
    pub set_f0_style: Option<SvSetFn>,
    pub set_voicing_mode: Option<SvSetFn>,
    pub set_gender: Option<SvSetFn>,
    pub set_glottal_source: Option<SvSetFn>,
    pub set_speaking_mode: Option<SvSetFn>,
}

fn proc_any(module: HMODULE, plain: PCSTR, decorated: PCSTR) -> Option<usize> {
    unsafe {
        GetProcAddress(module, plain)
            .or_else(|| GetProcAddress(module, decorated))
            .map(|p| p as usize)
    }
}

macro_rules! required {
    ($module:expr, $plain:literal, $decorated:literal, $ty:ty) => {
        match proc_any($module, s!($plain), s!($decorated)) {
            Some(addr) => unsafe { mem::transmute::<usize, $ty>(addr) },
            None => {
                log::warn!("[engine] missing required export {}", $plain);
                return None;
            }
        }
    };
}

macro_rules! optional {
    ($module:expr, $plain:literal, $decorated:literal) => {
        proc_any($module, s!($plain), s!($decorated))
            .map(|addr| unsafe { mem::transmute::<usize, SvSetFn>(addr) })
    };
}

impl EngineSymbols {
    /// Resolve from the loaded base module. `None` when any of the four
    /// required entry points is absent.
    pub fn resolve(module: HMODULE) -> Option<Self> {
        Some(Self {
            open: required!(module, "SVOpenSpeech", "_SVOpenSpeech@20", SvOpenFn),
            close: required!(module, "SVCloseSpeech", "_SVCloseSpeech@4", SvHandleFn),
            abort: required!(module, "SVAbort", "_SVAbort@4", SvHandleFn),
            tts: required!(module, "SVTTS", "_SVTTS@32", SvTtsFn),

            set_language: optional!(module, "SVSetLanguage", "_SVSetLanguage@8"),

            set_rate: optional!(module, "SVSetRate", "_SVSetRate@8"),
            set_pitch: optional!(module, "SVSetPitch", "_SVSetPitch@8"),
            set_f0_range: optional!(module, "SVSetF0Range", "_SVSetF0Range@8"),
            set_f0_perturb: optional!(module, "SVSetF0Perturb", "_SVSetF0Perturb@8"),
            set_vowel_factor: optional!(module, "SVSetVowelFactor", "_SVSetVowelFactor@8"),
            set_voicing_bias: optional!(module, "SVSetAVBias", "_SVSetAVBias@8"),
            set_frication_bias: optional!(module, "SVSetAFBias", "_SVSetAFBias@8"),
            set_aspiration_bias: optional!(module, "SVSetAHBias", "_SVSetAHBias@8"),
            set_personality: optional!(module, "SVSetPersonality", "_SVSetPersonality@8"),
            set_f0_style: optional!(module, "SVSetF0Style", "_SVSetF0Style@8"),
            set_voicing_mode: optional!(module, "SVSetVoicingMode", "_SVSetVoicingMode@8"),
            set_gender: optional!(module, "SVSetGender", "_SVSetGender@8"),
            set_glottal_source: optional!(module, "SVSetGlottalSource", "_SVSetGlottalSource@8"),
            set_speaking_mode: optional!(module, "SVSetSpeakingMode", "_SVSetSpeakingMode@8"),
        })
    }

    fn setter(&self, param: EngineParam) -> Option<SvSetFn> {
        match param {
            EngineParam::Rate => self.set_rate,
            EngineParam::Pitch => self.set_pitch,
            EngineParam::F0Range => self.set_f0_range,
            EngineParam::F0Perturb => self.set_f0_perturb,
            EngineParam::VowelFactor => self.set_vowel_factor,
            EngineParam::VoicingBias => self.set_voicing_bias,
            EngineParam::FricationBias => self.set_frication_bias,
            EngineParam::AspirationBias => self.set_aspiration_bias,
            EngineParam::Personality => self.set_personality,
            EngineParam::F0Style => self.set_f0_style,
            EngineParam::VoicingMode => self.set_voicing_mode,
            EngineParam::Gender => self.set_gender,
            EngineParam::GlottalSource => self.set_glottal_source,
            EngineParam::SpeakingMode => self.set_speaking_mode,
        }
    }
}

/// Exception barrier around one engine call. A fault inside the engine
/// surfaces as -1, which the worker treats like any other engine error.
fn guarded(f: impl FnMut() -> i32) -> i32 {
    microseh::try_seh(f).unwrap_or(-1)
}

/// The real engine, driven through the resolved DLL exports. Owned by the
/// worker thread; `handle` is the engine's speech handle.
pub struct DllEngine {
    session: Arc<WinSession>,
    handle: i32,
}

impl DllEngine {
    pub fn new(session: Arc<WinSession>) -> Self {
        Self { session, handle: 0 }
    }

    fn msg_hwnd(&self) -> HWND {
        HWND(self.session.msg_hwnd.load(Ordering::Relaxed) as *mut core::ffi::c_void)
    }

    fn pump_pending(&self) {
        unsafe {
            let mut msg = MSG::default();
            while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
    }
}

impl Engine for DllEngine {
    fn open(&mut self, voice: i32) -> bool {
        if self.handle != 0 {
            let close = self.session.symbols.close;
            let handle = self.handle;
            guarded(|| unsafe { close(handle) });
            self.handle = 0;
        }

        let open = self.session.symbols.open;
        let hwnd = self.msg_hwnd();
        let mut handle = 0i32;
        // The engine's "msg" parameter is underdocumented; 0 works and the
        // engine still posts its status codes to the window.
        let rc = guarded(|| unsafe { open(&mut handle, hwnd, 0, voice, 0) });
        if rc != 0 || handle == 0 {
            log::warn!("[engine] SVOpenSpeech(voice {voice}) failed: rc {rc}");
            return false;
        }
        self.handle = handle;
        true
    }

    fn close(&mut self) {
        if self.handle != 0 {
            let close = self.session.symbols.close;
            let handle = self.handle;
            guarded(|| unsafe { close(handle) });
            self.handle = 0;
        }
    }

    fn abort(&mut self) {
        if self.handle != 0 {
            let abort = self.session.symbols.abort;
            let handle = self.handle;
            guarded(|| unsafe { abort(handle) });
        }
    }

    fn speak(&mut self, text: &[u8]) -> i32 {
        if self.handle == 0 {
            return -1;
        }
        let mut z = Vec::with_capacity(text.len() + 1);
        z.extend_from_slice(text);
        z.push(0);

        let tts = self.session.symbols.tts;
        let handle = self.handle;
        let hwnd = self.msg_hwnd();
        guarded(|| unsafe { tts(handle, z.as_ptr(), 0, 0, hwnd, 0, 0, 0) })
    }

    fn set_param(&mut self, param: EngineParam, value: i32) -> i32 {
        let Some(setter) = self.session.symbols.setter(param) else {
            return -1;
        };
        if self.handle == 0 {
            return -1;
        }
        let handle = self.handle;
        guarded(|| unsafe { setter(handle, value) })
    }

    fn switch_language(&mut self, voice: i32) -> Option<bool> {
        let setter = self.session.symbols.set_language?;
        if self.handle == 0 {
            return Some(false);
        }
        let handle = self.handle;
        Some(guarded(|| unsafe { setter(handle, voice) }) == 0)
    }

    fn pump(&mut self, _shared: &Shared, ms: u32) {
        if ms > 0 {
            unsafe {
                MsgWaitForMultipleObjectsEx(None, ms, QS_ALLINPUT, MWMO_INPUTAVAILABLE);
            }
        }
        self.pump_pending();
    }

    fn idle_wait(&mut self, _shared: &Shared) {
        // Consumers post WM_HOST_KICK after queueing work, so a plain
        // message wait covers both commands and engine notifications.
        unsafe {
            MsgWaitForMultipleObjectsEx(None, u32::MAX, QS_ALLINPUT, MWMO_INPUTAVAILABLE);
        }
        self.pump_pending();
    }
}

impl Drop for DllEngine {
    fn drop(&mut self) {
        self.close();
    }
}

static REGISTER_CLASS: Once = Once::new();

/// Create the message-only window the engine posts completion codes to.
/// Must run on the worker thread, which also pumps it.
pub fn create_message_window() -> Option<HWND> {
    unsafe {
        let instance = GetModuleHandleW(None).ok()?;
        let class_name = w!("SoftVoiceHostMsgWnd");

        REGISTER_CLASS.call_once(|| {
            let mut wc = WNDCLASSEXW::default();
            wc.cbSize = mem::size_of::<WNDCLASSEXW>() as u32;
            wc.hInstance = instance.into();
            wc.lpszClassName = class_name;
            wc.lpfnWndProc = Some(host_wnd_proc);
            // Failure surfaces below when CreateWindowExW refuses the class.
            let _ = RegisterClassExW(&wc);
        });

        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            class_name,
            w!(""),
            WINDOW_STYLE(0),
            0,
            0,
            0,
            0,
            Some(HWND_MESSAGE),
            None,
            Some(instance.into()),
            None,
        )
        .ok()
    }
}

unsafe extern "system" fn host_wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if let Some(sess) = session::hook_session() {
        if sess.msg_hwnd.load(Ordering::Relaxed) == hwnd.0 as isize {
            if let Some(signal) = sess.sync.classify(msg, wparam.0) {
                match signal {
                    SyncSignal::Start => sess.shared.start_event.set(),
                    SyncSignal::Done => sess.shared.done_event.set(),
                }
                return LRESULT(0);
            }
        }
    }
    DefWindowProcW(hwnd, msg, wparam, lparam)
}
