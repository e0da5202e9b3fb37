//! Harbor input source: a socket-fed decoder
//! cooperating with a bounded Generator, protected by a mutex, with
//! backpressure handled by dropping old samples.
//!
//! A `HarborInput` is attached to a clock like any other source, but
//! its real work happens off the tick: a connected client's bytes
//! flow in on a dedicated feed thread, through a [`StreamDecoder`],
//! into the bounded [`Generator`] via [`HarborInput::put`]. `output()`
//! itself is a no-op — the harbor doesn't produce a frame per tick,
//! it just needs a clock lifecycle (`get_ready`/`leave`) to know when
//! to tear down outstanding connections.

pub mod decoder;

pub use decoder::StreamDecoder;

use crate::clock::ClockVariable;
use crate::error::{ClockError, Result};
use crate::frame::Generator;
use crate::source::{ActiveSource, Source, Stype};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Optional HTTP-basic-style authentication gate evaluated before a
/// socket is handed to [`HarborInput::relay`].
pub struct Login {
    pub user: Option<String>,
    pub authenticate: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

/// Construction parameters for a mountpoint's [`HarborInput`].
pub struct HarborConfig {
    pub max_seconds: f64,
    pub channels: usize,
    pub samplerate: u32,
    pub dump_path: Option<PathBuf>,
    pub login: Option<Login>,
    pub on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            max_seconds: 10.0,
            channels: 2,
            samplerate: 48_000,
            dump_path: None,
            login: None,
            on_connect: None,
            on_disconnect: None,
        }
    }
}

/// Telemetry commands a namespace-aware server component dispatches
/// into a harbor input: `stop`, `kick`, `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Telemetry {
    Stop,
    Kick,
    Status,
}

pub struct HarborInput {
    id: String,
    mount: String,
    clock_var: ClockVariable,
    max_seconds: f64,
    relaying: AtomicBool,
    telemetry_registered: AtomicBool,
    decoder: Mutex<Option<Arc<dyn StreamDecoder>>>,
    stype_negotiated: Mutex<Option<String>>,
    dump_path: Option<PathBuf>,
    dump: Mutex<Option<File>>,
    abg: Mutex<Generator>,
    login: Option<Login>,
    on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HarborInput {
    pub fn new(mount: String, config: HarborConfig) -> Arc<Self> {
        let max_len = (config.samplerate as f64 * config.max_seconds) as usize;
        Arc::new(Self {
            id: format!("harbor:{mount}"),
            mount,
            clock_var: ClockVariable::unknown(),
            max_seconds: config.max_seconds,
            relaying: AtomicBool::new(false),
            telemetry_registered: AtomicBool::new(false),
            decoder: Mutex::new(None),
            stype_negotiated: Mutex::new(None),
            dump_path: config.dump_path,
            dump: Mutex::new(None),
            abg: Mutex::new(Generator::new(config.channels, max_len)),
            login: config.login,
            on_connect: config.on_connect,
            on_disconnect: config.on_disconnect,
            worker: Mutex::new(None),
        })
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    pub fn is_relaying(&self) -> bool {
        self.relaying.load(Ordering::SeqCst)
    }

    /// Current buffered length, in frames — exposed for a downstream
    /// consumer (an encoder, say) deciding how much to pull.
    pub fn buffered_len(&self) -> usize {
        self.abg.lock().len()
    }

    /// Pull up to `n` buffered frames out for a downstream consumer.
    pub fn drain(&self, n: usize) -> Vec<f32> {
        self.abg.lock().drain(n)
    }

    pub fn negotiated_codec(&self) -> Option<String> {
        self.stype_negotiated.lock().clone()
    }

    pub fn authenticate(&self, user: &str, pass: &str) -> bool {
        match &self.login {
            None => true,
            Some(login) => (login.authenticate)(user, pass),
        }
    }

    /// Idempotent registration of telemetry commands under a
    /// namespace derived from the source id.
    pub fn wake_up(&self) {
        if self.telemetry_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            "[{}] registered telemetry commands (stop, kick, status) under '{}'",
            self.id,
            self.telemetry_namespace()
        );
    }

    fn telemetry_namespace(&self) -> String {
        format!("sources/{}", self.id)
    }

    pub fn dispatch(&self, cmd: Telemetry) -> String {
        match cmd {
            Telemetry::Stop | Telemetry::Kick => {
                self.disconnect();
                "disconnected current client".to_string()
            }
            Telemetry::Status => self.status(),
        }
    }

    pub fn status(&self) -> String {
        if self.is_relaying() {
            "source is relaying".to_string()
        } else {
            "source is not relaying".to_string()
        }
    }

    /// Look up a decoder constructor by codec name and bind it as the
    /// negotiated decoder for subsequent connections.
    pub fn register_decoder(&self, codec_name: &str) -> Result<()> {
        let d = decoder::lookup(codec_name)?;
        *self.decoder.lock() = Some(d);
        *self.stype_negotiated.lock() = Some(codec_name.to_string());
        Ok(())
    }

    /// Accept a connected client: mark relaying, run `on_connect`,
    /// open the dump file if configured, and spawn the feed thread.
    pub fn relay<S>(self: &Arc<Self>, socket: S) -> Result<()>
    where
        S: Read + Send + 'static,
    {
        self.relaying.store(true, Ordering::SeqCst);
        if let Some(cb) = &self.on_connect {
            cb();
        }
        if let Some(path) = &self.dump_path {
            match File::create(path) {
                Ok(f) => *self.dump.lock() = Some(f),
                Err(e) => {
                    tracing::warn!("[{}] failed to open dump file {}: {}", self.id, path.display(), e)
                }
            }
        }

        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("harbor-feed-{}", self.id))
            .spawn(move || this.feed(socket))
            .map_err(|e| {
                self.relaying.store(false, Ordering::SeqCst);
                ClockError::Runtime(format!("failed to spawn harbor feed thread: {e}"))
            })?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Runs on the feed thread: hands the socket to the negotiated
    /// decoder via a [`Sink`], catches any error it raises, logs it,
    /// and unconditionally disconnects.
    fn feed<S: Read + Send>(self: Arc<Self>, socket: S) {
        let decoder = self.decoder.lock().clone();
        match decoder {
            None => {
                tracing::error!("[{}] {}", self.id, ClockError::NoDecoder);
            }
            Some(decoder) => {
                let sink = Sink {
                    harbor: self.as_ref(),
                    stream: Mutex::new(Box::new(socket)),
                };
                if let Err(e) = decoder.decode(&sink) {
                    tracing::info!("[{}] decoder stopped: {}", self.id, e);
                }
            }
        }
        self.disconnect();
    }

    fn disconnect(&self) {
        if self.relaying.swap(false, Ordering::SeqCst) {
            if let Some(cb) = &self.on_disconnect {
                cb();
            }
            *self.dump.lock() = None;
            tracing::info!("[{}] client disconnected", self.id);
        }
    }

    fn insert_metadata(&self, m: HashMap<String, String>) {
        let artist = m.get("artist").cloned().unwrap_or_default();
        let title = m.get("title").cloned().unwrap_or_default();
        tracing::info!(
            "[{}] new metadata: artist=\"{}\" title=\"{}\"",
            self.id,
            artist,
            title
        );
        self.abg.lock().insert_metadata(0, m);
    }

    /// Feed decoded samples into the bounded buffer, applying
    /// backpressure by briefly sleeping and, if the consumer is still
    /// behind, dropping the oldest excess frames.
    fn put(&self, _sample_freq: u32, data: &[f32]) -> Result<()> {
        self.put_with(|abg| abg.push(data))
    }

    /// Feed raw little-endian `f32` PCM bytes, for a decoder that
    /// passes undecoded wire bytes straight through. Shares `put`'s
    /// backpressure handling.
    fn put_raw(&self, data: &bytes::Bytes) -> Result<()> {
        self.put_with(|abg| abg.push_bytes_as_f32(data))
    }

    fn put_with(&self, push: impl FnOnce(&mut Generator)) -> Result<()> {
        if !self.is_relaying() {
            return Err(ClockError::RelayingStopped);
        }

        let mut abg = self.abg.lock();
        if abg.len() >= abg.max_len() {
            drop(abg);
            std::thread::sleep(Duration::from_secs_f64(self.max_seconds / 3.0));
            abg = self.abg.lock();
            if abg.len() >= abg.max_len() {
                let dropped = abg.enforce_capacity();
                tracing::warn!(
                    "[{}] consumer too slow, dropped {} oldest frame(s)",
                    self.id,
                    dropped
                );
            }
        }

        push(&mut abg);
        // The chunk just pushed can itself push the buffer past
        // max_len even when the pre-push check above didn't trigger
        // (or only just cleared it) — re-enforce so the buffer never
        // sits above capacity once `put`/`put_raw` returns.
        let dropped = abg.enforce_capacity();
        if dropped > 0 {
            tracing::warn!(
                "[{}] consumer too slow, dropped {} oldest frame(s)",
                self.id,
                dropped
            );
        }
        Ok(())
    }
}

impl Source for HarborInput {
    fn id(&self) -> &str {
        &self.id
    }

    fn stype(&self) -> Stype {
        Stype::Fallible
    }

    fn clock_variable(&self) -> &ClockVariable {
        &self.clock_var
    }
}

impl ActiveSource for HarborInput {
    fn get_ready(&self, _roots: &[String]) -> Result<()> {
        self.wake_up();
        Ok(())
    }

    fn output(&self) -> Result<()> {
        Ok(())
    }

    fn leave(&self, _root: bool) {
        self.disconnect();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// A decoder's handle back into the harbor: `put`, `read`,
/// `insert_metadata`, `close`.
pub struct Sink<'a> {
    harbor: &'a HarborInput,
    stream: Mutex<Box<dyn Read + Send>>,
}

impl<'a> Sink<'a> {
    /// Read up to `len` bytes from the socket; an immediate 0-byte
    /// read raises [`ClockError::EndOfFile`]. If a dump file is
    /// open, the same bytes are mirrored to it.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = {
            let mut stream = self.stream.lock();
            stream.read(&mut buf)?
        };
        if n == 0 {
            return Err(ClockError::EndOfFile);
        }
        buf.truncate(n);

        if let Some(dump) = self.harbor.dump.lock().as_mut() {
            let _ = dump.write_all(&buf);
        }
        Ok(buf)
    }

    /// Read exactly `len` bytes, looping over `read` since a single
    /// socket read can come back short (a length prefix straddling a
    /// TCP segment boundary is normal, not malformed input).
    pub fn read_exact(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        while buf.len() < len {
            buf.extend(self.read(len - buf.len())?);
        }
        Ok(buf)
    }

    pub fn put(&self, sample_freq: u32, data: &[f32]) -> Result<()> {
        self.harbor.put(sample_freq, data)
    }

    /// Like `put`, but for a decoder that hands over raw little-endian
    /// `f32` PCM bytes instead of already-decoded samples.
    pub fn put_raw(&self, data: &bytes::Bytes) -> Result<()> {
        self.harbor.put_raw(data)
    }

    pub fn insert_metadata(&self, m: HashMap<String, String>) {
        self.harbor.insert_metadata(m);
    }

    pub fn close(&self) {
        self.harbor.disconnect();
    }
}

/// Side registry mapping `/mountpoint → source`, consumed by the
/// (external) server component to route inbound connections.
struct HarborRegistry {
    inputs: Mutex<HashMap<String, Arc<HarborInput>>>,
}

static REGISTRY: OnceLock<HarborRegistry> = OnceLock::new();

fn registry() -> &'static HarborRegistry {
    REGISTRY.get_or_init(|| HarborRegistry {
        inputs: Mutex::new(HashMap::new()),
    })
}

/// `input.harbor(mount)`: returns the existing source at `mount` if
/// present, otherwise creates and registers one, also enqueuing it
/// for the next collection.
pub fn harbor(mount: &str, config: HarborConfig) -> Arc<HarborInput> {
    let mut inputs = registry().inputs.lock();
    if let Some(existing) = inputs.get(mount) {
        return existing.clone();
    }

    let input = HarborInput::new(mount.to_string(), config);
    inputs.insert(mount.to_string(), input.clone());
    drop(inputs);

    crate::source::register_new_source(input.clone() as Arc<dyn ActiveSource>);
    input
}

/// Test-only: drop every registered mountpoint so harbor tests don't
/// leak state into each other.
#[cfg(test)]
pub fn reset_for_test() {
    registry().inputs.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(max_seconds: f64, samplerate: u32) -> HarborConfig {
        HarborConfig {
            max_seconds,
            channels: 1,
            samplerate,
            ..Default::default()
        }
    }

    #[test]
    fn harbor_returns_existing_source_for_same_mount() {
        reset_for_test();
        let a = harbor("/live", config(10.0, 48_000));
        let b = harbor("/live", config(10.0, 48_000));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn register_decoder_unknown_codec_fails() {
        let input = HarborInput::new("/x".into(), config(10.0, 48_000));
        let err = input.register_decoder("definitely-not-a-codec").unwrap_err();
        assert!(matches!(err, ClockError::UnknownCodec(_)));
    }

    #[test]
    fn put_without_relaying_fails() {
        let input = HarborInput::new("/x".into(), config(10.0, 48_000));
        let err = input.put(48_000, &[0.0, 0.0]).unwrap_err();
        assert!(matches!(err, ClockError::RelayingStopped));
    }

    // Covers the same pre-push backpressure branch as the sleep/drop
    // path below without the real 3s+ of wall time S5 (moved to
    // tests/harbor_backpressure_test.rs) exercises end to end.
    #[test]
    fn put_enforces_capacity_on_the_chunk_that_crosses_it() {
        let samplerate = 1000usize;
        let input = HarborInput::new("/bp-unit".into(), config(1.0, samplerate as u32));
        input.relaying.store(true, Ordering::SeqCst);

        // A single chunk larger than max_len must not be allowed to
        // grow the buffer past max_len.
        let chunk = vec![0.0f32; samplerate * 2];
        input.put(samplerate as u32, &chunk).unwrap();

        assert_eq!(input.buffered_len(), samplerate);
    }

    #[test]
    fn status_reflects_relaying_state() {
        let input = HarborInput::new("/x".into(), config(10.0, 48_000));
        assert_eq!(input.status(), "source is not relaying");
        input.relaying.store(true, Ordering::SeqCst);
        assert_eq!(input.status(), "source is relaying");
    }

    #[test]
    fn sink_read_raises_end_of_file_on_empty_stream() {
        let input = HarborInput::new("/x".into(), config(10.0, 48_000));
        let sink = Sink {
            harbor: &input,
            stream: Mutex::new(Box::new(Cursor::new(Vec::<u8>::new()))),
        };
        let err = sink.read(4).unwrap_err();
        assert!(matches!(err, ClockError::EndOfFile));
    }

    #[test]
    fn wake_up_is_idempotent() {
        let input = HarborInput::new("/x".into(), config(10.0, 48_000));
        input.wake_up();
        input.wake_up();
        assert!(input.telemetry_registered.load(Ordering::SeqCst));
    }
}
