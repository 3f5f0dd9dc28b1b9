//! The worker thread: sole owner of the engine.
//!
//! The engine is not re-entrant and reports completion through window
//! messages, so exactly one thread talks to it. The worker consumes the
//! command queue, applies settings in preset-safe order, feeds the engine
//! chunk by chunk, and terminates every generation with exactly one DONE or
//! ERROR marker. Audio never passes through here; it arrives on the capture
//! path while the engine's TTS call is in flight.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::host::engine::Engine;
use crate::host::output::{ItemKind, ERR_TIMEOUT, ERR_TTS_FAILED, ERR_VOICE_OPEN};
use crate::host::settings::{apply_for_utterance, ensure_voice, VoiceSwitch};
use crate::host::text;
use crate::host::{Command, Shared, DEFAULT_BYTES_PER_SEC};

/// Hard ceiling per utterance; past this the engine is presumed wedged.
pub const UTTERANCE_TIMEOUT: Duration = Duration::from_secs(180);

/// Wait slice while a chunk is in flight.
pub const PUMP_SLICE_MS: u32 = 50;

/// Tail grace: declare the utterance audible-complete once no audio arrived
/// for this long...
const TAIL_QUIET_MS: u64 = 30;
/// ...but never wait longer than this in total.
const TAIL_GRACE_MAX_MS: u64 = 250;

/// Run the worker until a Quit command. `engine` is owned here and never
/// leaves this thread.
pub fn run<E: Engine>(shared: Arc<Shared>, mut engine: E, initial_voice: i32) {
    let initial_voice = initial_voice.max(1);

    if !engine.open(initial_voice) {
        log::warn!("[worker] initial engine open failed (voice {initial_voice})");
        shared.init_ok.store(-1, Ordering::Relaxed);
        shared.init_event.set();
        return;
    }
    let mut current_voice = initial_voice;

    shared.init_ok.store(1, Ordering::Relaxed);
    shared.init_event.set();

    // Default pacing until the engine opens its device and reports a format.
    shared
        .bytes_per_sec
        .store(DEFAULT_BYTES_PER_SEC, Ordering::Relaxed);
    shared
        .output
        .set_ceiling(crate::host::output::ceiling_for(DEFAULT_BYTES_PER_SEC));

    loop {
        engine.pump(&shared, 0);

        let command = {
            let mut queue = shared.commands.lock().unwrap();
            match queue.pop_front() {
                Some(cmd) => Some(cmd),
                None => {
                    shared.cmd_event.reset();
                    None
                }
            }
        };

        let Some(command) = command else {
            engine.idle_wait(&shared);
            continue;
        };

        match command {
            Command::Quit => break,
            Command::Speak {
                text,
                cancel_snapshot,
            } => {
                speak_one(&shared, &mut engine, &mut current_voice, &text, cancel_snapshot);
            }
        }
    }

    log::debug!("[worker] quitting");
    engine.abort();
    engine.close();
}

fn speak_one<E: Engine>(
    shared: &Shared,
    engine: &mut E,
    current_voice: &mut i32,
    text: &[u16],
    cancel_snapshot: u32,
) {
    // A stop() between enqueue and now invalidates the command outright.
    if shared.gens.cancel.load(Ordering::Relaxed) != cancel_snapshot {
        return;
    }

    let gen = shared.gens.counter.fetch_add(1, Ordering::Relaxed);

    shared.stop_event.reset();
    shared.done_event.reset();
    shared.start_event.reset();

    shared.gens.current.store(gen, Ordering::Relaxed);
    shared.gens.active.store(gen, Ordering::Relaxed);
    shared.last_audio_tick.store(0, Ordering::Relaxed);
    shared.output.clear();

    // Voice first; everything else hangs off whether it changed.
    let voice_changed = match ensure_voice(engine, &shared.settings, current_voice) {
        VoiceSwitch::Failed => {
            log::warn!("[worker] voice open failed (voice {})", shared.settings.voice.get());
            shared.gens.active.store(0, Ordering::Relaxed);
            shared
                .output
                .push_marker(&shared.gens, gen, ItemKind::Error, ERR_VOICE_OPEN);
            shared
                .output
                .push_marker(&shared.gens, gen, ItemKind::Done, 0);
            return;
        }
        VoiceSwitch::Switched => true,
        VoiceSwitch::Unchanged => false,
    };

    apply_for_utterance(engine, &shared.settings, voice_changed);

    let prepared = text::prepare(text);
    let chunks = text::split_chunks(&prepared);
    if chunks.is_empty() {
        shared.gens.active.store(0, Ordering::Relaxed);
        shared
            .output
            .push_marker(&shared.gens, gen, ItemKind::Done, 0);
        return;
    }

    let deadline = Instant::now() + UTTERANCE_TIMEOUT;
    let mut stopped = false;
    let mut tts_error = false;

    for chunk in &chunks {
        if chunk.is_empty() {
            continue;
        }
        if shared.gens.cancel.load(Ordering::Relaxed) != cancel_snapshot
            || shared.stop_event.is_set()
        {
            stopped = true;
            break;
        }

        shared.done_event.reset();
        shared.start_event.reset();

        let rc = engine.speak(chunk);
        if rc != 0 {
            log::warn!("[worker] engine TTS call returned {rc}");
            tts_error = true;
            break;
        }

        // Wait for the chunk to complete while keeping notifications moving.
        loop {
            engine.pump(shared, PUMP_SLICE_MS);

            if shared.done_event.is_set() {
                break;
            }
            if shared.stop_event.is_set()
                || shared.gens.cancel.load(Ordering::Relaxed) != cancel_snapshot
            {
                stopped = true;
                break;
            }
            if Instant::now() >= deadline {
                log::warn!("[worker] utterance timed out");
                shared
                    .output
                    .push_marker(&shared.gens, gen, ItemKind::Error, ERR_TIMEOUT);
                stopped = true;
                break;
            }
        }

        if stopped {
            break;
        }
    }

    if tts_error {
        shared.gens.active.store(0, Ordering::Relaxed);
        shared
            .output
            .push_marker(&shared.gens, gen, ItemKind::Error, ERR_TTS_FAILED);
        shared
            .output
            .push_marker(&shared.gens, gen, ItemKind::Done, 0);
        return;
    }

    if stopped {
        // The abort must run on this thread; the engine tolerates nothing
        // else. Completion is a plain DONE: cancellation is not an error.
        engine.abort();
        shared.gens.active.store(0, Ordering::Relaxed);
        shared
            .output
            .push_marker(&shared.gens, gen, ItemKind::Done, 0);
        return;
    }

    // The engine keeps trickling buffers briefly after the last completion
    // message. Give the tail a moment to arrive, but not at the cost of
    // latency when more commands are waiting.
    let skip_grace = !shared.commands.lock().unwrap().is_empty();
    if !skip_grace {
        let grace_start = shared.now_ms();
        loop {
            let last = shared.last_audio_tick.load(Ordering::Relaxed);
            let now = shared.now_ms();
            if last != 0 && now.saturating_sub(last) >= TAIL_QUIET_MS {
                break;
            }
            if now.saturating_sub(grace_start) >= TAIL_GRACE_MAX_MS {
                break;
            }
            if shared.stop_event.wait_timeout(Duration::from_millis(5)) {
                break;
            }
        }
    }

    // Close the capture gate before the marker so nothing lands behind DONE.
    shared.gens.active.store(0, Ordering::Relaxed);
    shared
        .output
        .push_marker(&shared.gens, gen, ItemKind::Done, 0);
}
