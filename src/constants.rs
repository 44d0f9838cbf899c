// Raw PCM format shared by every stage between the fetchers and the encoder
pub const SAMPLE_RATE: u32 = 48000; // 48 kHz, voice transport native rate
pub const BIT_DEPTH: u16 = 16; // s16le
pub const CHANNELS: u16 = 2; // Stereo

/// Bytes in one second of raw PCM.
pub const BYTES_PER_SECOND: usize = SAMPLE_RATE as usize * CHANNELS as usize * (BIT_DEPTH as usize / 8);

/// Bytes in one interleaved frame (one sample per channel).
pub const FRAME_BYTES: usize = CHANNELS as usize * (BIT_DEPTH as usize / 8);

/// Byte length of `ms` milliseconds of raw PCM, rounded down to a whole frame.
pub fn pcm_bytes_for_ms(ms: u64) -> usize {
    let bytes = BYTES_PER_SECOND as u64 * ms / 1000;
    (bytes as usize / FRAME_BYTES) * FRAME_BYTES
}
