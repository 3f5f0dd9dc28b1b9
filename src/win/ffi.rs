//! The exported C ABI the screen reader's driver binds to.
//!
//! Nothing here panics or unwinds across the boundary: bad arguments answer
//! with a null/zero/no-op, engine trouble surfaces as ERROR stream items,
//! and init failure is a null handle with no partial session left behind.

use std::ffi::c_void;
use std::sync::Arc;

use crate::host::output::ItemKind;
use crate::win::session::{self, WinSession};

unsafe fn wide_cstr(ptr: *const u16) -> Vec<u16> {
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    std::slice::from_raw_parts(ptr, len).to_vec()
}

fn resolve(handle: *mut c_void) -> Option<Arc<WinSession>> {
    session::resolve(handle as *const WinSession)
}

/// Load the engine from `base_dll_path` and start the host. Returns an
/// opaque session handle, or null on failure. Repeat calls return the same
/// refcounted instance.
#[no_mangle]
pub unsafe extern "C" fn sv_initW(base_dll_path: *const u16, initial_voice: i32) -> *mut c_void {
    crate::logging::init();
    if base_dll_path.is_null() {
        return std::ptr::null_mut();
    }
    let path = wide_cstr(base_dll_path);
    match session::init(&path, initial_voice) {
        Some(session) => Arc::as_ptr(&session) as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

/// Drop one reference; the last reference tears everything down. Null and
/// stale handles are ignored.
#[no_mangle]
pub unsafe extern "C" fn sv_free(handle: *mut c_void) {
    session::free(handle as *const WinSession);
}

/// Cancel the current and all queued utterances. Non-blocking.
#[no_mangle]
pub unsafe extern "C" fn sv_stop(handle: *mut c_void) {
    if let Some(session) = resolve(handle) {
        session.shared.stop();
        session.kick();
    }
}

/// Queue a wide-character utterance. Returns 0 on success.
#[no_mangle]
pub unsafe extern "C" fn sv_startSpeakW(handle: *mut c_void, text: *const u16) -> i32 {
    let Some(session) = resolve(handle) else {
        return 1;
    };
    if text.is_null() {
        return 1;
    }
    session.shared.start_speak(wide_cstr(text));
    session.kick();
    0
}

/// Dequeue one stream item. AUDIO copies up to `cap` bytes into `out_audio`
/// and returns the count; DONE/ERROR return 0 with `out_type`/`out_value`
/// set. NONE means nothing is pending.
#[no_mangle]
pub unsafe extern "C" fn sv_read(
    handle: *mut c_void,
    out_type: *mut i32,
    out_value: *mut i32,
    out_audio: *mut u8,
    cap: i32,
) -> i32 {
    if !out_type.is_null() {
        *out_type = ItemKind::None as i32;
    }
    if !out_value.is_null() {
        *out_value = 0;
    }

    let Some(session) = resolve(handle) else {
        return 0;
    };
    if out_audio.is_null() || cap < 0 {
        return 0;
    }

    let buf = std::slice::from_raw_parts_mut(out_audio, cap as usize);
    let item = session.shared.read(buf);

    if !out_type.is_null() {
        *out_type = item.kind as i32;
    }
    if !out_value.is_null() {
        *out_value = item.value;
    }
    item.bytes as i32
}

/// Report the PCM format the engine opened its device with. Returns 1 and
/// fills the out parameters once known, 0 before the first open.
#[no_mangle]
pub unsafe extern "C" fn sv_getFormat(
    handle: *mut c_void,
    sample_rate: *mut i32,
    channels: *mut i32,
    bits_per_sample: *mut i32,
) -> i32 {
    let Some(session) = resolve(handle) else {
        return 0;
    };
    let Some(format) = session.shared.wave_format() else {
        return 0;
    };
    if !sample_rate.is_null() {
        *sample_rate = format.samples_per_sec as i32;
    }
    if !channels.is_null() {
        *channels = format.channels as i32;
    }
    if !bits_per_sample.is_null() {
        *bits_per_sample = format.bits_per_sample as i32;
    }
    1
}

macro_rules! knob_exports {
    ($get:ident, $set:ident, $knob:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $get(handle: *mut c_void) -> i32 {
            resolve(handle).map_or(0, |s| s.shared.settings.$knob.get())
        }

        #[no_mangle]
        pub unsafe extern "C" fn $set(handle: *mut c_void, value: i32) {
            if let Some(session) = resolve(handle) {
                session.shared.settings.$knob.set(value);
            }
        }
    };
}

knob_exports!(sv_getVoice, sv_setVoice, voice);
knob_exports!(sv_getRate, sv_setRate, rate);
knob_exports!(sv_getPitch, sv_setPitch, pitch);
knob_exports!(sv_getF0Range, sv_setF0Range, f0_range);
knob_exports!(sv_getF0Perturb, sv_setF0Perturb, f0_perturb);
knob_exports!(sv_getVowelFactor, sv_setVowelFactor, vowel_factor);
knob_exports!(sv_getAVBias, sv_setAVBias, voicing_bias);
knob_exports!(sv_getAFBias, sv_setAFBias, frication_bias);
knob_exports!(sv_getAHBias, sv_setAHBias, aspiration_bias);
knob_exports!(sv_getPersonality, sv_setPersonality, personality);
knob_exports!(sv_getF0Style, sv_setF0Style, f0_style);
knob_exports!(sv_getVoicingMode, sv_setVoicingMode, voicing_mode);
knob_exports!(sv_getGender, sv_setGender, gender);
knob_exports!(sv_getGlottalSource, sv_setGlottalSource, glottal_source);

#[no_mangle]
pub unsafe extern "C" fn sv_getSpeakingMode(handle: *mut c_void) -> i32 {
    resolve(handle).map_or(0, |s| s.shared.settings.speaking_mode.get())
}

/// Speaking mode also auto-tunes the lead budget (word/spell modes keep the
/// engine on a short leash) unless the consumer pinned it.
#[no_mangle]
pub unsafe extern "C" fn sv_setSpeakingMode(handle: *mut c_void, value: i32) {
    if let Some(session) = resolve(handle) {
        session.shared.settings.set_speaking_mode(value);
    }
}

#[no_mangle]
pub unsafe extern "C" fn sv_getMaxLeadMs(handle: *mut c_void) -> i32 {
    resolve(handle).map_or(0, |s| s.shared.settings.max_lead_ms())
}

#[no_mangle]
pub unsafe extern "C" fn sv_setMaxLeadMs(handle: *mut c_void, max_lead_ms: i32) {
    if let Some(session) = resolve(handle) {
        session.shared.settings.set_max_lead_ms(max_lead_ms);
    }
}

#[no_mangle]
pub unsafe extern "C" fn sv_getTrimSilence(handle: *mut c_void) -> i32 {
    resolve(handle).map_or(0, |s| s.shared.settings.trim_silence() as i32)
}

#[no_mangle]
pub unsafe extern "C" fn sv_setTrimSilence(handle: *mut c_void, enable: i32) {
    if let Some(session) = resolve(handle) {
        session.shared.settings.set_trim_silence(enable != 0);
    }
}

#[no_mangle]
pub unsafe extern "C" fn sv_getPauseFactor(handle: *mut c_void) -> i32 {
    resolve(handle).map_or(0, |s| s.shared.settings.pause_factor())
}

#[no_mangle]
pub unsafe extern "C" fn sv_setPauseFactor(handle: *mut c_void, factor: i32) {
    if let Some(session) = resolve(handle) {
        session.shared.settings.set_pause_factor(factor);
    }
}
