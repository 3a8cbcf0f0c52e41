//! Self-describing frames: `[seq u32 le][len u32 le][body]`, where body byte
//! `i` is `(seq + i) as u8`. Frames survive stream coalescing and any
//! corruption or reordering shows up in [`decode_frames`].

pub const FRAME_HEADER_LEN: usize = 8;

/// Builds frame `seq` with `len` total bytes (never shorter than the header).
pub fn frame_payload(seq: u32, len: usize) -> Vec<u8> {
    let len = len.max(FRAME_HEADER_LEN);
    let mut frame = Vec::with_capacity(len);
    frame.extend_from_slice(&seq.to_le_bytes());
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.extend((0..len - FRAME_HEADER_LEN).map(|i| seq.wrapping_add(i as u32) as u8));
    frame
}

/// Splits a drained byte stream back into frame sequence numbers.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<u32>, String> {
    let mut seqs = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(format!("{} trailing bytes after frame", bytes.len()));
        }
        let seq = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if len < FRAME_HEADER_LEN || len > bytes.len() {
            return Err(format!("frame {seq} declares {len} bytes, {} remain", bytes.len()));
        }
        let body = &bytes[FRAME_HEADER_LEN..len];
        if let Some(offset) = body
            .iter()
            .enumerate()
            .position(|(i, b)| *b != seq.wrapping_add(i as u32) as u8)
        {
            return Err(format!("frame {seq} corrupted at body offset {offset}"));
        }
        seqs.push(seq);
        bytes = &bytes[len..];
    }
    Ok(seqs)
}
