//! WAV framing and PCM helpers.
//!
//! Pure functions with no I/O and no async runtime. Batch recognizers want a WAV
//! container while clients usually stream bare 16-bit PCM, and streamed PCM
//! from synthesizers arrives split at arbitrary byte offsets.

/// Bytes per 16-bit mono sample.
const BYTES_PER_SAMPLE: u32 = 2;

/// Length of the header written by [`pcm_to_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Size field value streaming producers use for "not known yet".
const UNKNOWN_SIZE: u32 = u32::MAX;

/// Wrap raw 16-bit mono PCM in a canonical 44-byte WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    // An odd trailing byte is half a sample; drop it
    let data = &pcm[..pcm.len() - pcm.len() % 2];
    let data_len = data.len() as u32;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data.len());
    write_header(&mut out, data_len + WAV_HEADER_LEN as u32 - 8, data_len, sample_rate);
    out.extend_from_slice(data);
    out
}

/// Header for PCM whose length is not known yet. Both size fields carry the
/// `0xFFFFFFFF` placeholder, so the samples can follow as they arrive.
pub fn streaming_wav_header(sample_rate: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(WAV_HEADER_LEN);
    write_header(&mut out, UNKNOWN_SIZE, UNKNOWN_SIZE, sample_rate);
    out
}

fn write_header(out: &mut Vec<u8>, riff_len: u32, data_len: u32, sample_rate: u32) {
    let mut put = |bytes: &[u8]| out.extend_from_slice(bytes);
    put(b"RIFF");
    put(&riff_len.to_le_bytes());
    put(b"WAVEfmt ");
    put(&16u32.to_le_bytes());
    put(&1u16.to_le_bytes()); // integer PCM
    put(&1u16.to_le_bytes()); // channels
    put(&sample_rate.to_le_bytes());
    put(&(sample_rate * BYTES_PER_SAMPLE).to_le_bytes());
    put(&(BYTES_PER_SAMPLE as u16).to_le_bytes());
    put(&16u16.to_le_bytes());
    put(b"data");
    put(&data_len.to_le_bytes());
}

/// Format of a WAV payload and where its samples start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data_offset: usize,
}

fn le_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Locate the `fmt ` and `data` chunks of a RIFF/WAVE buffer.
///
/// Unknown chunks are skipped. A size of `0xFFFFFFFF`, written by streaming
/// producers, is read as the canonical size for `fmt ` and as empty for
/// anything else.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, &'static str> {
    if !is_wav(buf) {
        return Err("not a RIFF/WAVE buffer");
    }

    let mut format = None;
    let mut pos = 12;
    while let (Some(id), Some(size)) = (buf.get(pos..pos + 4), le_u32(buf, pos + 4)) {
        let body = pos + 8;
        match id {
            b"data" => {
                let (channels, sample_rate, bits_per_sample) =
                    format.ok_or("data chunk before fmt chunk")?;
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: body,
                });
            }
            b"fmt " => {
                let fields = (
                    le_u16(buf, body),
                    le_u16(buf, body + 2),
                    le_u32(buf, body + 4),
                    le_u16(buf, body + 14),
                );
                let (Some(tag), Some(channels), Some(rate), Some(bits)) = fields else {
                    return Err("fmt chunk truncated");
                };
                if tag != 1 {
                    return Err("not integer PCM");
                }
                format = Some((channels, rate, bits));
                pos = body + if size == UNKNOWN_SIZE { 16 } else { size as usize };
            }
            _ => pos = body + if size == UNKNOWN_SIZE { 0 } else { size as usize },
        }
    }
    Err("data chunk not found")
}

/// Whether the buffer starts with a RIFF/WAVE header.
pub fn is_wav(buf: &[u8]) -> bool {
    buf.get(0..4) == Some(b"RIFF".as_slice()) && buf.get(8..12) == Some(b"WAVE".as_slice())
}

/// Trim `bytes` to whole 16-bit samples, carrying an odd trailing byte into
/// the next call through `carry`.
pub fn align_pcm(bytes: &[u8], carry: &mut Option<u8>) -> Vec<u8> {
    let mut data = Vec::with_capacity(bytes.len() + 1);
    if let Some(lo) = carry.take() {
        data.push(lo);
    }
    data.extend_from_slice(bytes);

    if data.len() % 2 == 1 {
        *carry = data.pop();
    }
    data
}

/// Playback length of 16-bit mono PCM.
pub fn pcm_duration_ms(byte_len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    let samples = byte_len as u64 / BYTES_PER_SAMPLE as u64;
    samples * 1000 / sample_rate as u64
}
