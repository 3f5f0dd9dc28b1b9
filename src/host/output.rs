//! Bounded output queue between the capture side and the consumer.
//!
//! Items are tagged with the generation they belong to; pushes and reads both
//! drop anything that is not from the live generation, which is what makes
//! stop() atomic from the consumer's point of view. Audio bytes are counted
//! so the capture side can apply backpressure against a ceiling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::host::trim::{leading_trim_bytes, trailing_trim_bytes, TrimParams};
use crate::host::{Generations, WaveFormat};

/// Stream item kinds, numeric values are part of the C ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemKind {
    None = 0,
    Audio = 1,
    Done = 2,
    Error = 3,
}

/// ERROR item payloads surfaced to the consumer.
pub const ERR_TTS_FAILED: i32 = 2001;
pub const ERR_TIMEOUT: i32 = 2002;
pub const ERR_VOICE_OPEN: i32 = 2003;

struct StreamItem {
    kind: ItemKind,
    value: i32,
    gen: u32,
    data: Vec<u8>,
    offset: usize,
}

impl StreamItem {
    fn marker(kind: ItemKind, value: i32, gen: u32) -> Self {
        Self {
            kind,
            value,
            gen,
            data: Vec::new(),
            offset: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }
}

/// What a push did, as seen by the capture side. `was_empty`/`was_full`
/// describe the queue *before* the new item went in; the pacing decision in
/// the sink hangs off them.
#[derive(Clone, Copy, Debug, Default)]
pub struct PushObservation {
    pub stored: bool,
    pub was_empty: bool,
    pub was_full: bool,
}

/// One dequeued item. `bytes` is only non-zero for AUDIO.
#[derive(Clone, Copy, Debug)]
pub struct ReadItem {
    pub kind: ItemKind,
    pub value: i32,
    pub bytes: usize,
}

impl ReadItem {
    fn none() -> Self {
        Self {
            kind: ItemKind::None,
            value: 0,
            bytes: 0,
        }
    }
}

/// Format + parameters for the read-time trim pass.
pub struct TrimPass {
    pub format: WaveFormat,
    pub bytes_per_sec: u64,
    pub params: TrimParams,
}

struct Inner {
    items: VecDeque<StreamItem>,
    queued_audio_bytes: usize,
    lead_trim_done_gen: u32,
    tail_trim_done_gen: u32,
}

impl Inner {
    fn clear(&mut self) {
        self.items.clear();
        self.queued_audio_bytes = 0;
    }

    fn drop_one_audio(&mut self) -> bool {
        if let Some(pos) = self.items.iter().position(|it| it.kind == ItemKind::Audio) {
            let removed = self.items.remove(pos).unwrap();
            self.queued_audio_bytes = self.queued_audio_bytes.saturating_sub(removed.remaining());
            true
        } else {
            false
        }
    }
}

pub struct OutputQueue {
    inner: Mutex<Inner>,
    ceiling: AtomicUsize,
    max_items: usize,
}

/// Ceiling fallback before the engine reports a format.
const FALLBACK_CEILING: usize = 512 * 1024;
const MAX_ITEMS: usize = 8192;

/// Buffered-audio ceiling for a byte rate: one minute of audio, clamped.
pub fn ceiling_for(bytes_per_sec: u64) -> usize {
    let bps = if bytes_per_sec == 0 {
        crate::host::DEFAULT_BYTES_PER_SEC
    } else {
        bytes_per_sec
    };
    (bps * 60).clamp(256 * 1024, 8 * 1024 * 1024) as usize
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                queued_audio_bytes: 0,
                lead_trim_done_gen: 0,
                tail_trim_done_gen: 0,
            }),
            ceiling: AtomicUsize::new(0),
            max_items: MAX_ITEMS,
        }
    }

    pub fn set_ceiling(&self, bytes: usize) {
        self.ceiling.store(bytes, Ordering::Relaxed);
    }

    pub fn ceiling(&self) -> usize {
        match self.ceiling.load(Ordering::Relaxed) {
            0 => FALLBACK_CEILING,
            n => n,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().unwrap().queued_audio_bytes
    }

    /// Copy `data` in under generation `gen`. Dropped outright when `gen` is
    /// not the live generation; otherwise the oldest AUDIO items make room
    /// when the ceiling or the item cap would be exceeded (markers are never
    /// dropped). Returns what happened for the pacing decision.
    pub fn push_audio(&self, gens: &Generations, gen: u32, data: &[u8]) -> PushObservation {
        let mut obs = PushObservation::default();
        if data.is_empty() {
            return obs;
        }

        let mut inner = self.inner.lock().unwrap();
        let current = gens.current.load(Ordering::Relaxed);
        if current == 0 || gen != current {
            return obs;
        }

        let limit = self.ceiling();
        obs.was_empty = inner.queued_audio_bytes == 0;
        obs.was_full = inner.queued_audio_bytes >= limit;

        while inner.queued_audio_bytes + data.len() > limit || inner.items.len() >= self.max_items {
            if !inner.drop_one_audio() {
                // Nothing droppable left; the new item loses.
                return obs;
            }
        }

        inner.queued_audio_bytes += data.len();
        inner.items.push_back(StreamItem {
            kind: ItemKind::Audio,
            value: 0,
            gen,
            data: data.to_vec(),
            offset: 0,
        });
        obs.stored = true;
        obs
    }

    /// Append a DONE or ERROR marker for `gen`, unless the generation is
    /// already dead.
    pub fn push_marker(&self, gens: &Generations, gen: u32, kind: ItemKind, value: i32) {
        let mut inner = self.inner.lock().unwrap();
        let current = gens.current.load(Ordering::Relaxed);
        if current == 0 || gen != current {
            return;
        }
        inner.items.push_back(StreamItem::marker(kind, value, gen));
    }

    /// Single-item dequeue. AUDIO copies up to `buf.len()` bytes and pops the
    /// item once exhausted; DONE/ERROR pop immediately with `bytes == 0`.
    pub fn read(&self, gens: &Generations, trim: Option<&TrimPass>, buf: &mut [u8]) -> ReadItem {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let current = gens.current.load(Ordering::Relaxed);
        if current == 0 {
            inner.clear();
            return ReadItem::none();
        }

        // Drop leftovers from earlier generations.
        while let Some(front) = inner.items.front() {
            if front.gen == current {
                break;
            }
            let stale = inner.items.pop_front().unwrap();
            if stale.kind == ItemKind::Audio {
                inner.queued_audio_bytes =
                    inner.queued_audio_bytes.saturating_sub(stale.remaining());
            }
        }

        if inner.items.is_empty() {
            return ReadItem::none();
        }

        if let Some(pass) = trim {
            self.trim_edges(inner, current, pass);
            if inner.items.is_empty() {
                return ReadItem::none();
            }
        }

        let front = inner.items.front_mut().unwrap();
        match front.kind {
            ItemKind::Audio => {
                let n = front.remaining().min(buf.len());
                if n > 0 {
                    buf[..n].copy_from_slice(&front.data[front.offset..front.offset + n]);
                    front.offset += n;
                }
                let exhausted = front.remaining() == 0;
                inner.queued_audio_bytes = inner.queued_audio_bytes.saturating_sub(n);
                if exhausted {
                    inner.items.pop_front();
                }
                ReadItem {
                    kind: ItemKind::Audio,
                    value: 0,
                    bytes: n,
                }
            }
            kind => {
                let value = front.value;
                inner.items.pop_front();
                ReadItem {
                    kind,
                    value,
                    bytes: 0,
                }
            }
        }
    }

    /// Lead trim runs once per generation, before anything was delivered;
    /// tail trim runs once per generation and only after a DONE marker is in
    /// the queue, so the last audio item really is the last.
    fn trim_edges(&self, inner: &mut Inner, current: u32, pass: &TrimPass) {
        if inner.lead_trim_done_gen != current {
            if let Some(item) = inner.items.iter_mut().find(|it| it.kind == ItemKind::Audio) {
                let trim = leading_trim_bytes(
                    &item.data,
                    item.offset,
                    &pass.format,
                    pass.bytes_per_sec,
                    &pass.params,
                )
                .min(item.data.len());
                if trim > 0 {
                    item.offset += trim;
                    inner.queued_audio_bytes = inner.queued_audio_bytes.saturating_sub(trim);
                }
            }
            inner.lead_trim_done_gen = current;

            while inner
                .items
                .front()
                .is_some_and(|it| it.kind == ItemKind::Audio && it.remaining() == 0)
            {
                inner.items.pop_front();
            }
        }

        if inner.tail_trim_done_gen != current {
            let has_done = inner.items.iter().any(|it| it.kind == ItemKind::Done);
            if has_done {
                if let Some(item) = inner
                    .items
                    .iter_mut()
                    .rev()
                    .find(|it| it.kind == ItemKind::Audio)
                {
                    let remaining = item.remaining();
                    let trim = trailing_trim_bytes(
                        &item.data,
                        item.offset,
                        &pass.format,
                        pass.bytes_per_sec,
                        &pass.params,
                    )
                    .min(remaining);
                    if trim > 0 {
                        item.data.truncate(item.data.len() - trim);
                        inner.queued_audio_bytes = inner.queued_audio_bytes.saturating_sub(trim);
                    }
                }
                inner.tail_trim_done_gen = current;
            }
        }
    }

    /// Audio-byte accounting invariant check, used by tests.
    pub fn accounting_consistent(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let sum: usize = inner
            .items
            .iter()
            .filter(|it| it.kind == ItemKind::Audio)
            .map(|it| it.remaining())
            .sum();
        sum == inner.queued_audio_bytes
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Generations;
    use std::sync::atomic::Ordering;

    fn live_gens(gen: u32) -> Generations {
        let gens = Generations::new();
        gens.current.store(gen, Ordering::Relaxed);
        gens.active.store(gen, Ordering::Relaxed);
        gens
    }

    #[test]
    fn audio_round_trips_in_order() {
        let q = OutputQueue::new();
        let gens = live_gens(1);
        q.push_audio(&gens, 1, &[1, 2, 3]);
        q.push_audio(&gens, 1, &[4, 5]);
        q.push_marker(&gens, 1, ItemKind::Done, 0);

        let mut buf = [0u8; 16];
        let item = q.read(&gens, None, &mut buf);
        assert_eq!(item.kind, ItemKind::Audio);
        assert_eq!(&buf[..item.bytes], &[1, 2, 3]);
        let item = q.read(&gens, None, &mut buf);
        assert_eq!(&buf[..item.bytes], &[4, 5]);
        let item = q.read(&gens, None, &mut buf);
        assert_eq!(item.kind, ItemKind::Done);
        assert_eq!(item.bytes, 0);
        assert_eq!(q.read(&gens, None, &mut buf).kind, ItemKind::None);
        assert!(q.accounting_consistent());
    }

    #[test]
    fn partial_reads_advance_offset() {
        let q = OutputQueue::new();
        let gens = live_gens(7);
        q.push_audio(&gens, 7, &[10, 11, 12, 13, 14]);

        let mut buf = [0u8; 2];
        let item = q.read(&gens, None, &mut buf);
        assert_eq!((item.kind, item.bytes), (ItemKind::Audio, 2));
        assert_eq!(buf, [10, 11]);
        assert_eq!(q.queued_bytes(), 3);
        assert!(q.accounting_consistent());

        let item = q.read(&gens, None, &mut buf);
        assert_eq!(buf[..item.bytes], [12, 13]);
        let item = q.read(&gens, None, &mut buf);
        assert_eq!(buf[..item.bytes], [14]);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn stale_generation_pushes_are_dropped() {
        let q = OutputQueue::new();
        let gens = live_gens(3);
        let obs = q.push_audio(&gens, 2, &[1, 2, 3]);
        assert!(!obs.stored);
        q.push_marker(&gens, 2, ItemKind::Done, 0);

        let mut buf = [0u8; 4];
        assert_eq!(q.read(&gens, None, &mut buf).kind, ItemKind::None);
    }

    #[test]
    fn dead_session_read_clears_queue() {
        let q = OutputQueue::new();
        let gens = live_gens(5);
        q.push_audio(&gens, 5, &[1, 2, 3]);
        gens.current.store(0, Ordering::Relaxed);

        let mut buf = [0u8; 4];
        assert_eq!(q.read(&gens, None, &mut buf).kind, ItemKind::None);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn stale_leading_items_are_skipped_on_read() {
        let q = OutputQueue::new();
        let gens = live_gens(1);
        q.push_audio(&gens, 1, &[1, 2, 3, 4]);

        // New utterance supersedes without an intervening clear.
        gens.current.store(2, Ordering::Relaxed);
        q.push_audio(&gens, 2, &[9]);

        let mut buf = [0u8; 4];
        let item = q.read(&gens, None, &mut buf);
        assert_eq!((item.kind, item.bytes), (ItemKind::Audio, 1));
        assert_eq!(buf[0], 9);
        assert!(q.accounting_consistent());
    }

    #[test]
    fn ceiling_drops_oldest_audio_never_markers() {
        let q = OutputQueue::new();
        q.set_ceiling(10);
        let gens = live_gens(1);

        q.push_audio(&gens, 1, &[0u8; 6]);
        q.push_marker(&gens, 1, ItemKind::Error, ERR_TTS_FAILED);
        let obs = q.push_audio(&gens, 1, &[1u8; 6]);
        assert!(obs.stored);
        assert!(!obs.was_empty);
        assert_eq!(q.queued_bytes(), 6);
        assert!(q.accounting_consistent());

        // The marker survived the eviction and still arrives first.
        let mut buf = [0u8; 8];
        let item = q.read(&gens, None, &mut buf);
        assert_eq!((item.kind, item.value), (ItemKind::Error, ERR_TTS_FAILED));
        let item = q.read(&gens, None, &mut buf);
        assert_eq!((item.kind, item.bytes), (ItemKind::Audio, 6));
    }

    #[test]
    fn oversized_item_with_nothing_to_evict_is_dropped() {
        let q = OutputQueue::new();
        q.set_ceiling(4);
        let gens = live_gens(1);
        q.push_marker(&gens, 1, ItemKind::Done, 0);
        let obs = q.push_audio(&gens, 1, &[0u8; 8]);
        assert!(!obs.stored);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn full_observation_reported_before_eviction() {
        let q = OutputQueue::new();
        q.set_ceiling(8);
        let gens = live_gens(1);
        let first = q.push_audio(&gens, 1, &[0u8; 8]);
        assert!(first.was_empty && !first.was_full);
        let second = q.push_audio(&gens, 1, &[0u8; 4]);
        assert!(!second.was_empty && second.was_full);
    }

    #[test]
    fn ceiling_derivation_clamps() {
        assert_eq!(ceiling_for(0), (22050 * 60).clamp(256 * 1024, 8 << 20) as usize);
        assert_eq!(ceiling_for(100), 256 * 1024);
        assert_eq!(ceiling_for(10_000_000), 8 * 1024 * 1024);
        assert_eq!(ceiling_for(22050), 22050 * 60);
    }

    #[test]
    fn trim_pass_tightens_edges_once() {
        use crate::host::{WaveFormat, WAVE_FORMAT_PCM_TAG};

        let q = OutputQueue::new();
        let gens = live_gens(1);
        let pass = TrimPass {
            format: WaveFormat {
                format_tag: WAVE_FORMAT_PCM_TAG,
                channels: 1,
                samples_per_sec: 11025,
                avg_bytes_per_sec: 22050,
                block_align: 2,
                bits_per_sample: 16,
            },
            bytes_per_sec: 22050,
            params: TrimParams::from_pause_factor(50),
        };

        let ms = |n: u64| (22050 * n / 1000 / 2) as usize; // frames per n ms
        let mut pcm: Vec<i16> = vec![0; ms(300)];
        pcm.extend(std::iter::repeat(6000).take(ms(500)));
        pcm.extend(std::iter::repeat(0).take(ms(400)));
        let bytes: Vec<u8> = pcm.iter().flat_map(|v| v.to_le_bytes()).collect();

        q.push_audio(&gens, 1, &bytes);
        q.push_marker(&gens, 1, ItemKind::Done, 0);

        let mut delivered = 0usize;
        let mut buf = vec![0u8; 4096];
        loop {
            let item = q.read(&gens, Some(&pass), &mut buf);
            match item.kind {
                ItemKind::Audio => delivered += item.bytes,
                ItemKind::Done => break,
                other => panic!("unexpected item {:?}", other),
            }
        }

        // keep-lead 8 ms + tone 500 ms + keep-tail 10 ms, within one block.
        let expected = (ms(8) + ms(500) + ms(10)) * 2;
        assert!(
            (delivered as i64 - expected as i64).abs() <= 2,
            "delivered {delivered}, expected ~{expected}"
        );
        assert!(q.accounting_consistent());
    }

    #[test]
    fn trim_disabled_delivers_everything() {
        let q = OutputQueue::new();
        let gens = live_gens(1);
        let silence = vec![0u8; 26460]; // 600 ms of mono16 silence
        q.push_audio(&gens, 1, &silence);
        q.push_marker(&gens, 1, ItemKind::Done, 0);

        let mut total = 0;
        let mut buf = vec![0u8; 8192];
        loop {
            let item = q.read(&gens, None, &mut buf);
            match item.kind {
                ItemKind::Audio => total += item.bytes,
                _ => break,
            }
        }
        assert_eq!(total, silence.len());
    }
}
