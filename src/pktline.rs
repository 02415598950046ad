//! C1 — Git's pkt-line wire framing.
//!
//! A packet is `LLLL payload` where `LLLL` is four lowercase hex digits
//! giving the packet's total length including those four bytes. `0000` is a
//! flush packet (exactly four bytes, no payload). Lengths `0001..=0003` are
//! never valid.

use bytes::{Bytes, BytesMut};

use crate::error::PktLineError;

pub const FLUSH_PACKET: &[u8] = b"0000";

/// Reads the four-byte length prefix at `buf[offset..]`.
///
/// Returns `None` if fewer than four bytes remain, or if those four bytes
/// aren't all lowercase hex digits — mirrors spec property 2 (`readLength`
/// returns -1 under those conditions, represented here as `None`).
pub fn read_length(buf: &[u8], offset: usize) -> Option<usize> {
    let digits = buf.get(offset..offset + 4)?;
    if !digits
        .iter()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
    {
        return None;
    }
    let mut value = 0usize;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => unreachable!(),
        };
        value = value * 16 + digit as usize;
    }
    Some(value)
}

/// Outcome of reaching the edge of the available buffer while iterating.
#[derive(Debug, PartialEq, Eq)]
pub enum IterEnd {
    /// Iteration consumed every packet the caller asked it to.
    Exhausted,
    /// Stopped on a flush packet; `trailer` is everything from the flush
    /// packet onward, for resumable splitting.
    Flush { trailer_offset: usize },
    /// Stopped because the tail frame was incomplete; `carry_offset` is
    /// where the incomplete data starts, for carry-over into the next chunk.
    Underflow { carry_offset: usize },
}

/// Yields `[start, end)` byte ranges for each complete pkt-line frame in
/// `buf`, starting at `offset`.
///
/// `break_on_flush`/`break_on_underflow` control the edge behavior described
/// in spec.md §4.1; when both are `false` a malformed tail always fails.
pub fn iterate(
    buf: &[u8],
    offset: usize,
    break_on_flush: bool,
    break_on_underflow: bool,
) -> Result<(Vec<(usize, usize)>, IterEnd), PktLineError> {
    let mut frames = Vec::new();
    let mut pos = offset;

    loop {
        if pos >= buf.len() {
            return Ok((frames, IterEnd::Exhausted));
        }

        let Some(length) = read_length(buf, pos) else {
            if break_on_underflow && buf.len() - pos < 4 {
                return Ok((frames, IterEnd::Underflow { carry_offset: pos }));
            }
            return Err(PktLineError::InvalidPacket {
                offset: pos,
                buf_len: buf.len(),
            });
        };

        if length == 0 {
            if break_on_flush {
                return Ok((frames, IterEnd::Flush { trailer_offset: pos }));
            }
            frames.push((pos, pos + 4));
            pos += 4;
            continue;
        }

        if (1..4).contains(&length) {
            return Err(PktLineError::InvalidPacket {
                offset: pos,
                buf_len: buf.len(),
            });
        }

        let end = pos + length;
        if end > buf.len() {
            if break_on_underflow {
                return Ok((frames, IterEnd::Underflow { carry_offset: pos }));
            }
            return Err(PktLineError::IncompletePacket {
                expected_end: end,
                buf_len: buf.len(),
            });
        }

        frames.push((pos, end));
        pos = end;
    }
}

/// A streaming pkt-line frame detector: feed it arbitrary chunks, it invokes
/// `on_frame` for every complete frame and returns the bytes to forward
/// downstream unchanged (an explicit stateful codec in place of a
/// coroutine/iterator-with-lookahead).
#[derive(Debug, Default)]
pub struct PacketReader {
    carry: BytesMut,
}

impl PacketReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one chunk of input, calling `on_frame` for each complete
    /// frame found (including any completed by combining with the
    /// carry-over from a previous chunk). Returns the full chunk contents
    /// for pass-through to the output sink — the codec never drops bytes.
    pub fn push_chunk(
        &mut self,
        chunk: &[u8],
        mut on_frame: impl FnMut(&[u8]),
    ) -> Result<(), PktLineError> {
        self.carry.extend_from_slice(chunk);

        let (frames, end) = iterate(&self.carry, 0, false, true)?;
        for (start, stop) in &frames {
            on_frame(&self.carry[*start..*stop]);
        }

        match end {
            IterEnd::Underflow { carry_offset } => {
                let remaining = self.carry.split_off(carry_offset);
                self.carry = remaining;
            }
            IterEnd::Exhausted => self.carry.clear(),
            IterEnd::Flush { .. } => unreachable!("break_on_flush is false"),
        }

        Ok(())
    }

    /// Call once the underlying stream has ended. Fails if a partial frame
    /// is still buffered.
    pub fn finish(self) -> Result<(), PktLineError> {
        if self.carry.is_empty() {
            Ok(())
        } else {
            Err(PktLineError::IncompletePacket {
                expected_end: read_length(&self.carry, 0).map_or(4, |l| l.max(4)),
                buf_len: self.carry.len(),
            })
        }
    }
}

/// Concatenates whole-packet buffers. When `split_at` is `Some(index)`, the
/// first flush packet found inside `buffers[index]` is located and every
/// later buffer is spliced in immediately before it — the mechanism by
/// which sideband messages are injected ahead of a response's trailing
/// flush.
pub fn concat_packets(buffers: &[Bytes], split_at: Option<usize>) -> Result<Bytes, PktLineError> {
    let Some(split_at) = split_at else {
        let mut out = BytesMut::with_capacity(buffers.iter().map(Bytes::len).sum());
        for buf in buffers {
            out.extend_from_slice(buf);
        }
        return Ok(out.freeze());
    };

    let target = &buffers[split_at];
    let (_, end) = iterate(target, 0, true, false)?;
    let IterEnd::Flush { trailer_offset } = end else {
        return Err(PktLineError::IncompletePacket {
            expected_end: target.len() + 4,
            buf_len: target.len(),
        });
    };

    let mut out = BytesMut::new();
    for buf in &buffers[..split_at] {
        out.extend_from_slice(buf);
    }
    out.extend_from_slice(&target[..trailer_offset]);
    for buf in &buffers[split_at + 1..] {
        out.extend_from_slice(buf);
    }
    out.extend_from_slice(&target[trailer_offset..]);

    Ok(out.freeze())
}

/// Encodes `payload` as a pkt-line frame (`LLLL` + payload).
pub fn encode(payload: &[u8]) -> Bytes {
    let len = payload.len() + 4;
    let mut out = BytesMut::with_capacity(len);
    out.extend_from_slice(format!("{len:04x}").as_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Encodes a sideband-2 (progress channel) frame: leading byte `0x02`
/// followed by `msg`, length-prefixed like any other pkt-line frame.
pub fn encode_sideband2(msg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(msg.len() + 1);
    payload.push(0x02);
    payload.extend_from_slice(msg);
    encode(&payload)
}
