//! Platform-independent core of the engine host.
//!
//! Everything here compiles and is tested on any platform; the Win32 layer in
//! `crate::win` is a thin binding on top of these pieces.

pub mod engine;
pub mod output;
pub mod settings;
pub mod sink;
pub mod sync;
pub mod text;
pub mod trim;
pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::host::output::{OutputQueue, ReadItem};
use crate::host::settings::Settings;
use crate::host::sync::ManualEvent;
use crate::host::trim::TrimParams;

/// PCM format the engine opened its (virtual) wave device with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaveFormat {
    pub format_tag: u16,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

pub const WAVE_FORMAT_PCM_TAG: u16 = 1;

/// Fallback pacing rate until the engine reports a real format.
pub const DEFAULT_BYTES_PER_SEC: u64 = 22050;

/// Generation bookkeeping.
///
/// `counter` hands out one generation per utterance. `active` gates what the
/// capture side may enqueue, `current` gates what the read side accepts, and
/// `cancel` invalidates queued commands. `active` drops to zero before DONE
/// is pushed so late engine audio cannot slip in behind the marker; `current`
/// drops to zero on stop so the reader discards in-flight items immediately.
pub struct Generations {
    pub cancel: AtomicU32,
    pub counter: AtomicU32,
    pub active: AtomicU32,
    pub current: AtomicU32,
}

impl Generations {
    pub fn new() -> Self {
        Self {
            cancel: AtomicU32::new(1),
            counter: AtomicU32::new(1),
            active: AtomicU32::new(0),
            current: AtomicU32::new(0),
        }
    }
}

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands consumed by the worker thread.
pub enum Command {
    Speak {
        text: Vec<u16>,
        /// Cancellation counter at enqueue time; the worker drops the command
        /// if the counter moved before it got around to it.
        cancel_snapshot: u32,
    },
    Quit,
}

/// State shared between the consumer threads, the worker, and the capture
/// side. One instance per session.
pub struct Shared {
    pub gens: Generations,

    pub commands: Mutex<VecDeque<Command>>,
    pub cmd_event: ManualEvent,

    pub stop_event: ManualEvent,
    pub done_event: ManualEvent,
    pub start_event: ManualEvent,

    pub init_event: ManualEvent,
    pub init_ok: AtomicI32,

    pub settings: Settings,
    pub output: OutputQueue,

    pub format: Mutex<Option<WaveFormat>>,
    pub bytes_per_sec: AtomicU64,
    /// Millisecond tick of the last captured audio buffer (0 = none this
    /// utterance). Drives the worker's tail grace.
    pub last_audio_tick: AtomicU64,

    epoch: Instant,
}

impl Shared {
    pub fn new(initial_voice: i32) -> Arc<Self> {
        Arc::new(Self {
            gens: Generations::new(),
            commands: Mutex::new(VecDeque::new()),
            cmd_event: ManualEvent::new(),
            stop_event: ManualEvent::new(),
            done_event: ManualEvent::new(),
            start_event: ManualEvent::new(),
            init_event: ManualEvent::new(),
            init_ok: AtomicI32::new(0),
            settings: Settings::new(initial_voice),
            output: OutputQueue::new(),
            format: Mutex::new(None),
            bytes_per_sec: AtomicU64::new(0),
            last_audio_tick: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    /// Milliseconds since session creation; never 0 once any time has passed.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Queue an utterance. Returns 0 on success.
    pub fn start_speak(&self, text: Vec<u16>) -> i32 {
        let snapshot = self.gens.cancel.load(Ordering::Relaxed);
        self.commands.lock().unwrap().push_back(Command::Speak {
            text,
            cancel_snapshot: snapshot,
        });
        self.cmd_event.set();
        0
    }

    /// Cancel the current and all queued utterances. Non-blocking, safe from
    /// any thread; the worker finishes the in-flight utterance as DONE and
    /// the generation gates make its remaining audio disappear.
    pub fn stop(&self) {
        self.gens.cancel.fetch_add(1, Ordering::Relaxed);

        self.gens.active.store(0, Ordering::Relaxed);
        self.gens.current.store(0, Ordering::Relaxed);

        self.output.clear();
        self.commands.lock().unwrap().clear();

        self.stop_event.set();
        self.done_event.set();
        self.start_event.set();
        self.cmd_event.set();
    }

    /// Dequeue one stream item into `buf` (see `OutputQueue::read`).
    pub fn read(&self, buf: &mut [u8]) -> ReadItem {
        let trim = if self.settings.trim_silence() {
            self.wave_format().map(|format| crate::host::output::TrimPass {
                format,
                bytes_per_sec: self.bytes_per_sec.load(Ordering::Relaxed),
                params: TrimParams::from_pause_factor(self.settings.pause_factor()),
            })
        } else {
            None
        };
        self.output.read(&self.gens, trim.as_ref(), buf)
    }

    pub fn wave_format(&self) -> Option<WaveFormat> {
        *self.format.lock().unwrap()
    }
}
