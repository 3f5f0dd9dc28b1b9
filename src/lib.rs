//! SoftVoice engine host.
//!
//! The late-90s SoftVoice synthesizer pushes PCM straight at winmm's waveOut
//! API. This crate hosts the engine in-process for a screen reader: it hooks
//! the six waveOut entry points the engine uses, diverts the audio into a
//! bounded queue, paces the engine against the consumer, and exposes a small
//! pull-style C API (`sv_initW`, `sv_startSpeakW`, `sv_read`, ...) that the
//! host's Python driver binds to.
//!
//! Layout:
//! - `host` is the platform-independent core: output queue, silence trim,
//!   text pipeline, settings store, worker loop, backpressure sink. The
//!   worker is generic over [`host::engine::Engine`], so the test suite can
//!   drive the whole command/read cycle with a synthetic engine.
//! - `win` binds the core to Win32: waveOut detours, the engine DLL, the
//!   message-only completion window, and the exported C ABI.

pub mod host;
pub mod logging;

#[cfg(windows)]
pub mod win;
