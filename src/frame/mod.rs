//! Frame model & Generator.
//!
//! The Generator is the sole reusable buffer unit shared across sources:
//! a bounded FIFO of interleaved PCM samples with metadata markers
//! interleaved at sample offsets. It has no notion of sources, clocks,
//! or sockets — it is a pure data structure, which is why it lives in
//! its own leaf module.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

/// A metadata marker attached at a given sample offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMarker {
    /// Offset into `samples`, in frames (not bytes).
    pub offset: usize,
    pub values: HashMap<String, String>,
}

/// Bounded FIFO of PCM sample frames with interleaved metadata markers.
///
/// `samples` is kept as interleaved `f32` frames (`channels` values per
/// frame) rather than raw bytes — decoders hand over already-decoded
/// PCM, and keeping it typed avoids a layout footgun at every call site
/// that reads it back out. The wire/byte layout is a concern of
/// whatever encodes frames back out, not of this buffer.
#[derive(Debug)]
pub struct Generator {
    channels: usize,
    samples: VecDeque<f32>,
    metadata: VecDeque<MetadataMarker>,
    /// Capacity, in frames (`abg_max_len`).
    max_len: usize,
}

impl Generator {
    pub fn new(channels: usize, max_len: usize) -> Self {
        assert!(channels > 0, "Generator requires at least one channel");
        Self {
            channels,
            samples: VecDeque::new(),
            metadata: VecDeque::new(),
            max_len,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Length in frames currently buffered.
    pub fn len(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append interleaved PCM frames produced by the decoder.
    ///
    /// `data.len()` must be a multiple of `channels`; a short tail is
    /// dropped with a warning rather than panicking, since a decoder
    /// bug should degrade audio, not crash the feeder thread.
    pub fn push(&mut self, data: &[f32]) {
        let usable = data.len() - (data.len() % self.channels);
        if usable != data.len() {
            tracing::warn!(
                "Generator::push got {} samples, not a multiple of {} channels; dropping {} trailing samples",
                data.len(),
                self.channels,
                data.len() - usable
            );
        }
        self.samples.extend(&data[..usable]);
    }

    /// Append raw little-endian `f32` PCM bytes, for decoders (like the
    /// raw passthrough codec) that hand over undecoded wire bytes
    /// instead of already-typed samples. A trailing partial sample is
    /// dropped by `chunks_exact` the same way `push` drops a trailing
    /// partial frame.
    pub fn push_bytes_as_f32(&mut self, data: &Bytes) {
        let floats: Vec<f32> = data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.push(&floats);
    }

    /// Insert a metadata marker at the given frame offset.
    ///
    /// Offsets beyond the current length are clamped to the end of the
    /// buffer (`self.len()`), preserving the invariant that every
    /// marker's offset falls within `[0, len(samples)]`.
    pub fn insert_metadata(&mut self, offset: usize, values: HashMap<String, String>) {
        let offset = offset.min(self.len());
        self.metadata.push_back(MetadataMarker { offset, values });
    }

    pub fn metadata(&self) -> impl Iterator<Item = &MetadataMarker> {
        self.metadata.iter()
    }

    /// Drop the oldest `n` frames, shifting remaining metadata offsets
    /// down accordingly. Markers that fall entirely within the dropped
    /// region are discarded.
    pub fn drop_oldest(&mut self, n: usize) {
        let n = n.min(self.len());
        if n == 0 {
            return;
        }
        self.samples.drain(..n * self.channels);
        self.metadata.retain_mut(|marker| {
            if marker.offset < n {
                false
            } else {
                marker.offset -= n;
                true
            }
        });
    }

    /// Enforce `max_len` by dropping the oldest excess frames. Returns
    /// the number of frames dropped.
    pub fn enforce_capacity(&mut self) -> usize {
        if self.len() <= self.max_len {
            return 0;
        }
        let excess = self.len() - self.max_len;
        self.drop_oldest(excess);
        excess
    }

    /// Drain up to `n` frames from the front, for a consumer pulling
    /// samples out of the buffer.
    pub fn drain(&mut self, n: usize) -> Vec<f32> {
        let n = n.min(self.len());
        let taken: Vec<f32> = self.samples.drain(..n * self.channels).collect();
        self.metadata.retain_mut(|marker| {
            if marker.offset < n {
                false
            } else {
                marker.offset -= n;
                true
            }
        });
        taken
    }
}
