//! The seam between the worker and the synthesizer.
//!
//! Only the worker thread ever calls these methods; the engine is not
//! re-entrant and completes TTS calls through a message protocol, so all of
//! its entry points stay on one thread. The Win32 implementation binds the
//! real DLL; tests drive the worker with a scripted double.

use crate::host::Shared;

/// Integer parameters the engine accepts. The wrapper-only knobs
/// (max-lead-ms, trim-silence, pause-factor) are deliberately absent: they
/// never leave the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineParam {
    Rate,
    Pitch,
    F0Range,
    F0Perturb,
    VowelFactor,
    VoicingBias,
    FricationBias,
    AspirationBias,
    Personality,
    F0Style,
    VoicingMode,
    Gender,
    GlottalSource,
    SpeakingMode,
}

pub trait Engine: Send {
    /// Open (or reopen) the engine for `voice`, closing any previous handle
    /// first. Returns false when the engine refused.
    fn open(&mut self, voice: i32) -> bool;

    fn close(&mut self);

    /// Ask the engine to drop the utterance in flight. Must be called from
    /// the worker thread only.
    fn abort(&mut self);

    /// Hand one text chunk to the engine's TTS entry. Returns the engine's
    /// status code; 0 means the chunk was accepted and a completion will be
    /// signaled through the session's done event while audio arrives through
    /// the capture path.
    fn speak(&mut self, text: &[u8]) -> i32;

    /// Apply one integer parameter. A missing optional setter reports -1 and
    /// is otherwise harmless.
    fn set_param(&mut self, param: EngineParam, value: i32) -> i32;

    /// Engine-side voice switch without reopening. `None` when the engine
    /// doesn't export the entry point, `Some(false)` when it refused.
    fn switch_language(&mut self, voice: i32) -> Option<bool>;

    /// Deliver pending completion notifications, waiting at most `ms` for
    /// one to arrive. On Win32 this pumps the message-only window.
    fn pump(&mut self, shared: &Shared, ms: u32);

    /// Park until there is work: a queued command or an engine notification.
    fn idle_wait(&mut self, shared: &Shared);
}
