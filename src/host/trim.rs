//! Conservative silence trimming.
//!
//! The engine pads chunk boundaries with stretches of near-silence; trimming
//! a bounded amount at the edges tightens the pauses without touching the
//! speech itself. The trim runs at read time, under the queue lock, once per
//! generation per edge. Only plain PCM with 8-bit unsigned or 16-bit signed
//! samples is handled; anything else passes through untouched.

use crate::host::{WaveFormat, WAVE_FORMAT_PCM_TAG};

/// Trim window and threshold, derived from the pause factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimParams {
    pub max_lead_ms: u32,
    pub keep_lead_ms: u32,
    pub max_tail_ms: u32,
    pub keep_tail_ms: u32,
    /// Amplitude at or below which a 16-bit sample counts as silent.
    pub threshold16: u32,
}

impl TrimParams {
    /// `pause_factor` 0 trims very lightly, 100 trims aggressively; both ends
    /// always keep a small safety margin so consonants don't get clipped.
    pub fn from_pause_factor(pause_factor: i32) -> Self {
        let pf = pause_factor.clamp(0, 100) as u32;
        Self {
            max_lead_ms: 200 + pf * 12,
            keep_lead_ms: 8,
            max_tail_ms: 250 + pf * 12,
            keep_tail_ms: 10,
            threshold16: 48 + pf * 2,
        }
    }
}

/// Map a 16-bit amplitude threshold into 8-bit space (0..127). The /64 is
/// empirical; it lands in the 1..3 range for typical engine output.
pub fn threshold_for_8bit(threshold16: u32) -> u32 {
    (threshold16 / 64).clamp(1, 127)
}

fn trimmable(format: &WaveFormat) -> Option<(usize, usize)> {
    if format.format_tag != WAVE_FORMAT_PCM_TAG {
        return None;
    }
    if format.block_align == 0 || format.channels == 0 {
        return None;
    }
    let bytes_per_sample = match format.bits_per_sample {
        8 => 1,
        16 => 2,
        _ => return None,
    };
    let block_align = format.block_align as usize;
    if block_align < format.channels as usize * bytes_per_sample {
        return None;
    }
    Some((block_align, bytes_per_sample))
}

fn frames_for_ms(bytes_per_sec: u64, ms: u32, block_align: usize, fallback: usize) -> usize {
    if bytes_per_sec == 0 || ms == 0 {
        return fallback;
    }
    ((bytes_per_sec * ms as u64 / 1000) / block_align as u64) as usize
}

fn silent_frame(frame: &[u8], format: &WaveFormat, threshold16: u32, threshold8: u32) -> bool {
    let channels = format.channels as usize;
    if format.bits_per_sample == 16 {
        for c in 0..channels {
            let sample = i16::from_le_bytes([frame[c * 2], frame[c * 2 + 1]]);
            if sample.unsigned_abs() as u32 > threshold16 {
                return false;
            }
        }
    } else {
        // 8-bit PCM is unsigned; silence sits around 128.
        for c in 0..channels {
            let dv = (frame[c] as i32 - 128).unsigned_abs();
            if dv > threshold8 {
                return false;
            }
        }
    }
    true
}

/// Bytes to drop from the head of `data`. Zero when `offset` is non-zero:
/// once anything has been delivered, the leading edge is gone.
pub fn leading_trim_bytes(
    data: &[u8],
    offset: usize,
    format: &WaveFormat,
    bytes_per_sec: u64,
    params: &TrimParams,
) -> usize {
    let Some((block_align, _)) = trimmable(format) else {
        return 0;
    };
    if offset != 0 {
        return 0;
    }

    let total_frames = data.len() / block_align;
    if total_frames == 0 {
        return 0;
    }

    let max_frames = frames_for_ms(bytes_per_sec, params.max_lead_ms, block_align, total_frames);
    let keep_frames = frames_for_ms(bytes_per_sec, params.keep_lead_ms, block_align, 0);
    let scan_frames = max_frames.min(total_frames);
    if scan_frames == 0 {
        return 0;
    }

    let threshold8 = threshold_for_8bit(params.threshold16);
    let mut i = 0;
    while i < scan_frames {
        let frame = &data[i * block_align..(i + 1) * block_align];
        if !silent_frame(frame, format, params.threshold16, threshold8) {
            break;
        }
        i += 1;
    }

    if i <= keep_frames {
        return 0;
    }
    (i - keep_frames) * block_align
}

/// Bytes to drop from the tail of `data`, scanning backward over whole frames
/// and never into the `offset` bytes already handed out.
pub fn trailing_trim_bytes(
    data: &[u8],
    offset: usize,
    format: &WaveFormat,
    bytes_per_sec: u64,
    params: &TrimParams,
) -> usize {
    let Some((block_align, _)) = trimmable(format) else {
        return 0;
    };
    if data.len() < block_align || offset >= data.len() {
        return 0;
    }

    // Whole-frame scan window past the delivered bytes.
    let scan_end = (data.len() / block_align) * block_align;
    let scan_start = offset.div_ceil(block_align) * block_align;
    if scan_end == 0 || scan_start >= scan_end {
        return 0;
    }

    let total_frames = scan_end / block_align;
    let start_frame = scan_start / block_align;
    let available_frames = total_frames - start_frame;

    let max_frames = frames_for_ms(
        bytes_per_sec,
        params.max_tail_ms,
        block_align,
        available_frames,
    );
    let keep_frames = frames_for_ms(bytes_per_sec, params.keep_tail_ms, block_align, 0);
    let scan_frames = max_frames.min(available_frames);
    if scan_frames == 0 {
        return 0;
    }

    let threshold8 = threshold_for_8bit(params.threshold16);
    let mut trailing = 0;
    for j in 0..scan_frames {
        let idx = total_frames - 1 - j;
        if idx < start_frame {
            break;
        }
        let frame = &data[idx * block_align..(idx + 1) * block_align];
        if !silent_frame(frame, format, params.threshold16, threshold8) {
            break;
        }
        trailing += 1;
    }

    if trailing <= keep_frames {
        return 0;
    }
    let trim_bytes = (trailing - keep_frames) * block_align;
    trim_bytes.min(scan_end - scan_start).min(data.len() - offset)
}
