//! Capture side of the wave-output path.
//!
//! The hook layer forwards the engine's open/write calls here. Write is
//! where the sprint-and-wait buffering lives: the engine may run ahead until
//! the queue holds a ceiling's worth of audio, then every further write
//! blocks the engine inside its own call for the real-time duration of the
//! submitted buffer. Blocking beats dropping: the engine keeps its internal
//! clock, and the consumer loses nothing as long as it keeps reading.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::host::output::ceiling_for;
use crate::host::{Shared, WaveFormat, DEFAULT_BYTES_PER_SEC};

/// Pacing slice; short enough that stop() feels instant.
pub const PACE_SLICE_MS: u64 = 5;

/// What a write did, for the hook's completion handling and for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOutcome {
    /// The write belonged to the live generation.
    pub captured: bool,
    /// The bytes made it into the queue (false: dropped at the ceiling).
    pub stored: bool,
    /// Pacing slices slept before returning to the engine.
    pub paced_slices: u32,
}

/// The engine opened its wave device: remember the format and derive the
/// pacing rate and buffering ceiling from it.
pub fn open(shared: &Shared, format: WaveFormat) {
    let mut bps = format.avg_bytes_per_sec as u64;
    if bps == 0 {
        bps = format.samples_per_sec as u64 * format.block_align as u64;
    }
    if bps == 0 {
        bps = DEFAULT_BYTES_PER_SEC;
    }

    *shared.format.lock().unwrap() = Some(format);
    shared.bytes_per_sec.store(bps, Ordering::Relaxed);
    shared.output.set_ceiling(ceiling_for(bps));

    log::debug!(
        "[sink] device open: {} Hz x{} {}-bit, {} B/s, ceiling {}",
        format.samples_per_sec,
        format.channels,
        format.bits_per_sample,
        bps,
        shared.output.ceiling()
    );
}

/// The engine submitted one buffer of PCM.
pub fn write(shared: &Shared, data: &[u8]) -> WriteOutcome {
    let mut outcome = WriteOutcome::default();

    let gen = shared.gens.active.load(Ordering::Relaxed);
    let current = shared.gens.current.load(Ordering::Relaxed);
    if gen == 0 || gen != current {
        // Canceled or between utterances; the hook completes the header
        // immediately and the audio evaporates.
        return outcome;
    }
    outcome.captured = true;

    if data.is_empty() {
        return outcome;
    }

    shared.last_audio_tick.store(shared.now_ms().max(1), Ordering::Relaxed);

    let obs = shared.output.push_audio(&shared.gens, gen, data);
    outcome.stored = obs.stored;

    // Backpressure: only once the queue was already at the ceiling before
    // this buffer. The sleep budget is the buffer's own real-time duration,
    // so the engine ends up producing at roughly playback speed.
    if !obs.was_empty && obs.was_full {
        let mut bps = shared.bytes_per_sec.load(Ordering::Relaxed);
        if bps == 0 {
            bps = DEFAULT_BYTES_PER_SEC;
        }
        let mut remaining_ms = data.len() as u64 * 1000 / bps;
        while remaining_ms > 0 {
            if shared.gens.active.load(Ordering::Relaxed) != gen {
                break;
            }
            let slice = remaining_ms.min(PACE_SLICE_MS);
            if shared.stop_event.wait_timeout(Duration::from_millis(slice)) {
                break;
            }
            outcome.paced_slices += 1;
            remaining_ms -= slice;
        }
    }

    outcome
}
