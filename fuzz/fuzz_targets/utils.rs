pub const MAX_INPUT_SIZE: usize = 256 * 1024;

/// Splits `data` into frames, each prefixed by a little-endian `u16` length.
///
/// The input is capped to `MAX_INPUT_SIZE`; a truncated final frame is kept as-is.
pub fn split_frames(data: &[u8]) -> Vec<Vec<u8>> {
    let mut rest = &data[..data.len().min(MAX_INPUT_SIZE)];
    let mut frames = Vec::new();
    while rest.len() >= 2 {
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        let take = len.min(rest.len());
        frames.push(rest[..take].to_vec());
        rest = &rest[take..];
    }
    frames
}
