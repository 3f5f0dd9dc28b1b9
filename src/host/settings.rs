//! Settings store and the order in which they reach the engine.
//!
//! Consumers write knobs from any thread; the worker applies them at the
//! start of each utterance. The subtlety is personalities: the engine ships
//! opinionated per-personality presets, and blindly re-sending the consumer's
//! sliders after selecting one stomps the preset's sound. Hence the
//! user-set/dirty split and the careful ordering in [`apply_for_utterance`].

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::host::engine::{Engine, EngineParam};

/// One integer knob: desired value, whether it needs applying, and whether
/// the consumer ever touched it through the public API.
pub struct Knob {
    value: AtomicI32,
    dirty: AtomicBool,
    user_set: AtomicBool,
}

impl Knob {
    fn new(value: i32, user_set: bool, dirty: bool) -> Self {
        Self {
            value: AtomicI32::new(value),
            dirty: AtomicBool::new(dirty),
            user_set: AtomicBool::new(user_set),
        }
    }

    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Relaxed)
    }

    /// Public setter path: remembers the value, marks it dirty, and records
    /// that the consumer chose it explicitly.
    pub fn set(&self, value: i32) {
        self.value.store(value, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Relaxed);
        self.user_set.store(true, Ordering::Relaxed);
    }

    pub fn is_user_set(&self) -> bool {
        self.user_set.load(Ordering::Relaxed)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Relaxed);
    }
}

/// Speaking-mode values that keep the engine from synthesizing far ahead.
const SPEAK_MODE_WORD: i32 = 1;
const SPEAK_MODE_SPELL: i32 = 2;

const LEAD_DEFAULT_MS: i32 = 2000;
const LEAD_LOCKED_MS: i32 = 250;
const LEAD_MAX_MS: i32 = 15000;

pub struct Settings {
    pub voice: Knob,

    // Timbre/numeric knobs: user-set from the start so the defaults reach
    // the engine on the first utterance.
    pub rate: Knob,
    pub pitch: Knob,
    pub f0_range: Knob,
    pub f0_perturb: Knob,
    pub vowel_factor: Knob,
    pub voicing_bias: Knob,
    pub frication_bias: Knob,
    pub aspiration_bias: Knob,

    // Preset + style knobs: never applied unless the consumer asked, so
    // personalities keep their internal defaults.
    pub personality: Knob,
    pub f0_style: Knob,
    pub voicing_mode: Knob,
    pub gender: Knob,
    pub glottal_source: Knob,
    pub speaking_mode: Knob,

    // Wrapper-only knobs, never forwarded to the engine.
    max_lead_ms: AtomicI32,
    auto_lead: AtomicBool,
    trim_silence: AtomicBool,
    pause_factor: AtomicI32,
}

impl Settings {
    pub fn new(initial_voice: i32) -> Self {
        Self {
            voice: Knob::new(initial_voice.max(1), true, false),

            rate: Knob::new(260, true, true),
            pitch: Knob::new(89, true, true),
            f0_range: Knob::new(125, true, true),
            f0_perturb: Knob::new(0, true, true),
            vowel_factor: Knob::new(100, true, true),
            voicing_bias: Knob::new(0, true, true),
            frication_bias: Knob::new(0, true, true),
            aspiration_bias: Knob::new(0, true, true),

            personality: Knob::new(0, false, false),
            f0_style: Knob::new(0, false, false),
            voicing_mode: Knob::new(0, false, false),
            gender: Knob::new(0, false, false),
            glottal_source: Knob::new(0, false, false),
            speaking_mode: Knob::new(0, false, false),

            max_lead_ms: AtomicI32::new(LEAD_DEFAULT_MS),
            auto_lead: AtomicBool::new(true),
            trim_silence: AtomicBool::new(true),
            pause_factor: AtomicI32::new(50),
        }
    }

    /// Word-at-a-time and spelling modes are easier to keep in sync when the
    /// engine cannot sprint far ahead, so selecting one lowers the lead
    /// budget unless the consumer pinned it via [`set_max_lead_ms`].
    pub fn set_speaking_mode(&self, value: i32) {
        self.speaking_mode.set(value);
        if self.auto_lead.load(Ordering::Relaxed) {
            let lead = if value == SPEAK_MODE_WORD || value == SPEAK_MODE_SPELL {
                LEAD_LOCKED_MS
            } else {
                LEAD_DEFAULT_MS
            };
            self.max_lead_ms.store(lead, Ordering::Relaxed);
        }
    }

    pub fn max_lead_ms(&self) -> i32 {
        self.max_lead_ms.load(Ordering::Relaxed)
    }

    pub fn set_max_lead_ms(&self, ms: i32) {
        self.auto_lead.store(false, Ordering::Relaxed);
        self.max_lead_ms.store(ms.clamp(0, LEAD_MAX_MS), Ordering::Relaxed);
    }

    pub fn trim_silence(&self) -> bool {
        self.trim_silence.load(Ordering::Relaxed)
    }

    pub fn set_trim_silence(&self, enabled: bool) {
        self.trim_silence.store(enabled, Ordering::Relaxed);
    }

    pub fn pause_factor(&self) -> i32 {
        self.pause_factor.load(Ordering::Relaxed)
    }

    pub fn set_pause_factor(&self, factor: i32) {
        self.pause_factor.store(factor.clamp(0, 100), Ordering::Relaxed);
    }
}

/// Outcome of the voice check at the start of an utterance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceSwitch {
    Unchanged,
    Switched,
    Failed,
}

/// Make sure the engine speaks the requested voice. The engine-side language
/// switch is cheaper than a reopen, so it is tried first; reopening is the
/// fallback. Requesting the already-open voice does nothing at all.
pub fn ensure_voice<E: Engine>(
    engine: &mut E,
    settings: &Settings,
    current_voice: &mut i32,
) -> VoiceSwitch {
    let want = settings.voice.get().max(1);
    if want == *current_voice {
        return VoiceSwitch::Unchanged;
    }

    if engine.switch_language(want) == Some(true) {
        *current_voice = want;
        return VoiceSwitch::Switched;
    }

    if engine.open(want) {
        *current_voice = want;
        VoiceSwitch::Switched
    } else {
        VoiceSwitch::Failed
    }
}

const TIMBRE: [EngineParam; 8] = [
    EngineParam::Rate,
    EngineParam::Pitch,
    EngineParam::F0Range,
    EngineParam::F0Perturb,
    EngineParam::VowelFactor,
    EngineParam::VoicingBias,
    EngineParam::FricationBias,
    EngineParam::AspirationBias,
];

const STYLE: [EngineParam; 5] = [
    EngineParam::F0Style,
    EngineParam::VoicingMode,
    EngineParam::Gender,
    EngineParam::GlottalSource,
    EngineParam::SpeakingMode,
];

fn knob_for<'a>(settings: &'a Settings, param: EngineParam) -> &'a Knob {
    match param {
        EngineParam::Rate => &settings.rate,
        EngineParam::Pitch => &settings.pitch,
        EngineParam::F0Range => &settings.f0_range,
        EngineParam::F0Perturb => &settings.f0_perturb,
        EngineParam::VowelFactor => &settings.vowel_factor,
        EngineParam::VoicingBias => &settings.voicing_bias,
        EngineParam::FricationBias => &settings.frication_bias,
        EngineParam::AspirationBias => &settings.aspiration_bias,
        EngineParam::Personality => &settings.personality,
        EngineParam::F0Style => &settings.f0_style,
        EngineParam::VoicingMode => &settings.voicing_mode,
        EngineParam::Gender => &settings.gender,
        EngineParam::GlottalSource => &settings.glottal_source,
        EngineParam::SpeakingMode => &settings.speaking_mode,
    }
}

/// Push pending settings at the engine in preset-safe order:
///
/// 1. personality (only if the consumer ever chose one, re-forced after a
///    voice switch),
/// 2. the timbre numerics, where a freshly applied non-zero personality
///    suppresses everything except rate, while "personality 0" or a plain
///    voice switch force-applies the lot,
/// 3. the style knobs, again only when user-set.
pub fn apply_for_utterance<E: Engine>(engine: &mut E, settings: &Settings, voice_changed: bool) {
    // Personality is a preset; applying it rewrites the engine's internal
    // timbre state.
    let personality_applied = if settings.personality.is_user_set() {
        let apply = voice_changed || settings.personality.take_dirty();
        if apply {
            engine.set_param(EngineParam::Personality, settings.personality.get());
        }
        apply
    } else {
        settings.personality.clear_dirty();
        false
    };

    let personality_value = settings.personality.get();
    let personality_active = settings.personality.is_user_set() && personality_value != 0;

    if personality_applied && personality_value != 0 {
        // Keep the preset's sound: drop pending timbre changes, but re-send
        // rate so the speaking speed doesn't drift with the preset.
        for param in TIMBRE {
            if param != EngineParam::Rate {
                knob_for(settings, param).clear_dirty();
            }
        }
        settings.rate.clear_dirty();
        engine.set_param(EngineParam::Rate, settings.rate.get());
    } else {
        let force = (voice_changed && !personality_active)
            || (personality_applied && personality_value == 0);
        for param in TIMBRE {
            let knob = knob_for(settings, param);
            if knob.take_dirty() || force {
                engine.set_param(param, knob.get());
            }
        }
    }

    let force_style = voice_changed || personality_applied;
    for param in STYLE {
        let knob = knob_for(settings, param);
        if !knob.is_user_set() {
            knob.clear_dirty();
            continue;
        }
        if knob.take_dirty() || force_style {
            engine.set_param(param, knob.get());
        }
    }
}
