//! Text conditioning for the engine.
//!
//! The engine takes single-byte text in a Windows-1252-style superset of
//! Latin-1 and gets confused by control characters and very long inputs. The
//! pipeline is: clean up the wide string, map it to bytes without best-fit
//! substitutions (unmapped characters become spaces), then split into
//! chunks the engine can digest in one TTS call.

/// Chunk boundary in bytes. A chunk runs to the first space at or after this
/// offset, so chunks only exceed it by the tail of a word.
pub const CHUNK_BYTES: usize = 350;

const NBSP: char = '\u{00A0}';

/// Clean a wide (UTF-16) string: control characters and the C1 range become
/// spaces, NBSP becomes a space, whitespace runs collapse, edges are trimmed.
pub fn sanitize_wide(input: &[u16]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_space = true;

    for ch in char::decode_utf16(input.iter().copied()) {
        let mut ch = ch.unwrap_or(' ');
        if ch == NBSP {
            ch = ' ';
        }
        let code = ch as u32;
        if (code < 0x20 && ch != '\r' && ch != '\n' && ch != '\t') || (0x7F..=0x9F).contains(&code)
        {
            ch = ' ';
        }

        let is_space = matches!(ch, ' ' | '\t' | '\r' | '\n');
        if is_space {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(ch);
            prev_space = false;
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Map one scalar to the engine's single-byte superset of Latin-1 (the
/// Windows-1252 layout). No best-fit: anything without a slot becomes a
/// space rather than an approximation the engine would read out loud.
fn encode_char(ch: char) -> u8 {
    let code = ch as u32;
    match code {
        0x20..=0x7E => code as u8,
        0xA0..=0xFF => code as u8,
        _ => match ch {
            '\u{20AC}' => 0x80, // euro
            '\u{201A}' => 0x82,
            '\u{0192}' => 0x83,
            '\u{201E}' => 0x84,
            '\u{2026}' => 0x85, // ellipsis
            '\u{2020}' => 0x86,
            '\u{2021}' => 0x87,
            '\u{02C6}' => 0x88,
            '\u{2030}' => 0x89,
            '\u{0160}' => 0x8A,
            '\u{2039}' => 0x8B,
            '\u{0152}' => 0x8C,
            '\u{017D}' => 0x8E,
            '\u{2018}' => 0x91, // curly quotes
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95, // bullet
            '\u{2013}' => 0x96, // en dash
            '\u{2014}' => 0x97, // em dash
            '\u{02DC}' => 0x98,
            '\u{2122}' => 0x99, // trademark
            '\u{0161}' => 0x9A,
            '\u{203A}' => 0x9B,
            '\u{0153}' => 0x9C,
            '\u{017E}' => 0x9E,
            '\u{0178}' => 0x9F,
            _ => b' ',
        },
    }
}

/// Encode a cleaned string to engine bytes, collapsing the space runs that
/// unmapped characters leave behind.
pub fn to_engine_bytes(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut prev_space = true;
    for ch in text.chars() {
        let b = encode_char(ch);
        if b == b' ' {
            if !prev_space {
                out.push(b' ');
            }
            prev_space = true;
        } else {
            out.push(b);
            prev_space = false;
        }
    }
    while out.last() == Some(&b' ') {
        out.pop();
    }
    out
}

/// Full pipeline: wide input to engine-ready byte string.
pub fn prepare(input: &[u16]) -> Vec<u8> {
    to_engine_bytes(&sanitize_wide(input))
}

/// Split into chunks at space boundaries: each chunk runs to the first space
/// at or after [`CHUNK_BYTES`], hard-splitting when a run has no space at
/// all. Separating spaces are consumed.
pub fn split_chunks(text: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    if text.is_empty() {
        return out;
    }

    let mut start = 0;
    while start < text.len() {
        let remaining = text.len() - start;
        if remaining <= CHUNK_BYTES {
            out.push(text[start..].to_vec());
            break;
        }

        let boundary = start + CHUNK_BYTES;
        let split = text[boundary..]
            .iter()
            .position(|&b| b == b' ')
            .map(|pos| boundary + pos)
            .unwrap_or(boundary);

        if split > start {
            out.push(text[start..split].to_vec());
        }

        start = split;
        while start < text.len() && text[start] == b' ' {
            start += 1;
        }
    }

    out
}
