//! Decoder registry.
//!
//! A process-wide registry maps codec name → decoder constructor,
//! mirroring how the original system lets externally-registered
//! codecs participate without the harbor module depending on codec
//! crates directly. Two concrete decoders ship out of the box — Opus,
//! via the `opus` crate, and a raw PCM passthrough — giving
//! `register_decoder`/`feed` a real, runnable path end to end. It is
//! not a general transcoding layer: unknown codec names fail with
//! [`ClockError::UnknownCodec`].

use super::Sink;
use crate::error::{ClockError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// A decoder for one negotiated codec. `decode` runs on the harbor's
/// per-connection feed thread and drives the [`Sink`] until the
/// stream ends or a decode error occurs.
pub trait StreamDecoder: Send + Sync {
    fn decode(&self, sink: &Sink) -> Result<()>;
}

pub type Constructor = Arc<dyn Fn() -> Arc<dyn StreamDecoder> + Send + Sync>;

static REGISTRY: OnceLock<RwLock<HashMap<String, Constructor>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Constructor>> {
    REGISTRY.get_or_init(|| {
        let mut m: HashMap<String, Constructor> = HashMap::new();
        m.insert(
            "opus".to_string(),
            Arc::new(|| Arc::new(OpusStreamDecoder::default()) as Arc<dyn StreamDecoder>),
        );
        m.insert(
            "pcm".to_string(),
            Arc::new(|| Arc::new(PcmStreamDecoder) as Arc<dyn StreamDecoder>),
        );
        RwLock::new(m)
    })
}

/// Register (or overwrite) the constructor for a codec name.
pub fn register(name: &str, ctor: Constructor) {
    registry().write().unwrap().insert(name.to_string(), ctor);
}

/// Look up and instantiate the decoder for `name`.
pub fn lookup(name: &str) -> Result<Arc<dyn StreamDecoder>> {
    registry()
        .read()
        .unwrap()
        .get(name)
        .map(|ctor| ctor())
        .ok_or_else(|| ClockError::UnknownCodec(name.to_string()))
}

/// Reference Opus decoder. Frames are length-prefixed on the
/// wire: a 4-byte big-endian packet length followed by that many
/// bytes of Opus payload. Decodes to interleaved stereo float PCM at
/// 48kHz, matching the Generator's native sample layout for harbor
/// inputs configured at that rate.
struct OpusStreamDecoder {
    sample_rate: u32,
    channels: opus::Channels,
}

impl Default for OpusStreamDecoder {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: opus::Channels::Stereo,
        }
    }
}

impl StreamDecoder for OpusStreamDecoder {
    fn decode(&self, sink: &Sink) -> Result<()> {
        let mut decoder = opus::Decoder::new(self.sample_rate, self.channels)
            .map_err(|e| ClockError::Other(anyhow::anyhow!("opus decoder init failed: {e}")))?;

        // 120ms @ 48kHz stereo is Opus's largest possible frame.
        let mut pcm = vec![0f32; 5760 * 2];

        loop {
            let len_buf = sink.read_exact(4)?;
            let packet_len =
                u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
            if packet_len == 0 {
                continue;
            }
            let packet = sink.read_exact(packet_len)?;
            let samples = decoder
                .decode_float(&packet, &mut pcm, false)
                .map_err(|e| ClockError::Other(anyhow::anyhow!("opus decode failed: {e}")))?;
            sink.put(self.sample_rate, &pcm[..samples * 2])?;
        }
    }
}

/// Raw PCM passthrough for clients that send already-uncompressed
/// audio. Frames are length-prefixed the same way as Opus (a 4-byte
/// big-endian byte count) but the payload is interleaved little-endian
/// `f32` samples handed straight to the buffer with no transcoding.
struct PcmStreamDecoder;

impl StreamDecoder for PcmStreamDecoder {
    fn decode(&self, sink: &Sink) -> Result<()> {
        loop {
            let len_buf = sink.read_exact(4)?;
            let chunk_len =
                u32::from_be_bytes([len_buf[0], len_buf[1], len_buf[2], len_buf[3]]) as usize;
            if chunk_len == 0 {
                continue;
            }
            let chunk = sink.read_exact(chunk_len)?;
            sink.put_raw(&Bytes::from(chunk))?;
        }
    }
}
