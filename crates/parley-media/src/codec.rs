//! G.711 μ-law codec for 8 kHz telephony audio.

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// μ-law byte that decodes to silence.
pub const ULAW_SILENCE: u8 = 0xFF;

/// Decode one μ-law byte into a 16-bit linear sample.
pub fn decode_sample(byte: u8) -> i16 {
    let u = !byte;
    let sign = u & 0x80;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encode one 16-bit linear sample as μ-law.
pub fn encode_sample(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    value = value.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && value & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (value >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode a μ-law payload into PCM16 little-endian bytes.
pub fn ulaw_to_pcm16(payload: &[u8]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(payload.len() * 2);
    for &byte in payload {
        pcm.extend_from_slice(&decode_sample(byte).to_le_bytes());
    }
    pcm
}

/// Encode PCM16 little-endian bytes as μ-law. A trailing odd byte is ignored.
pub fn pcm16_to_ulaw(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .map(|pair| encode_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}
