//! Audio platform seam.
//!
//! A backend opens a context; a context starts suspended and must be resumed
//! from an explicit user action before it will play anything. Each burst
//! played returns a [`Voice`] that can be cut off mid-burst.

use futures::future::BoxFuture;
use std::io::{self, Cursor, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

#[cfg(feature = "device")]
mod device;
#[cfg(feature = "device")]
pub use device::DeviceBackend;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio is not supported here: {0}")]
    Unsupported(String),
    #[error("audio context is {0:?}")]
    NotRunning(ContextState),
    #[error("audio I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode audio: {0}")]
    Encode(#[from] hound::Error),
}

/// Lifecycle of an audio context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// A rendered, mono burst of samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Number of discrete frequency steps in the burst
    pub steps: usize,
}

impl Burst {
    /// A short burst of zero-amplitude samples.
    pub fn silent(sample_rate: u32, samples: usize) -> Self {
        Self {
            samples: vec![0.0; samples],
            sample_rate,
            steps: 0,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }
}

/// Handle to one playing burst.
pub trait Voice: Send {
    /// Cut the burst off now, without waiting for its natural decay.
    fn silence(&mut self);
    fn is_sounding(&mut self) -> bool;
}

/// A live audio engine context.
pub trait AudioContext: Send + Sync {
    fn state(&self) -> ContextState;
    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>>;
    fn play(&self, burst: &Burst) -> Result<Box<dyn Voice>, AudioError>;
    fn close(&self);
}

/// Something that can construct audio contexts.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError>;
}

struct StateCell(Mutex<ContextState>);

impl StateCell {
    fn new() -> Self {
        Self(Mutex::new(ContextState::Suspended))
    }

    fn get(&self) -> ContextState {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set(&self, state: ContextState) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn require_running(&self) -> Result<(), AudioError> {
        match self.get() {
            ContextState::Running => Ok(()),
            other => Err(AudioError::NotRunning(other)),
        }
    }

    fn resume(&self) -> Result<(), AudioError> {
        match self.get() {
            ContextState::Closed => Err(AudioError::NotRunning(ContextState::Closed)),
            _ => {
                self.set(ContextState::Running);
                Ok(())
            }
        }
    }
}

/// Pipes each burst, WAV-encoded, into an external player process.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full command line such as `["aplay", "-q", "-"]`.
    pub fn from_command_line(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl Default for CommandBackend {
    fn default() -> Self {
        let command = default_player_command();
        Self::from_command_line(&command).unwrap_or_else(|| Self::new("aplay", Vec::new()))
    }
}

/// Player that reads a WAV stream from stdin on this platform.
pub fn default_player_command() -> Vec<String> {
    let parts: &[&str] = if cfg!(target_os = "linux") {
        &["aplay", "-q", "-"]
    } else {
        // sox
        &["play", "-q", "-t", "wav", "-"]
    };
    parts.iter().map(|s| s.to_string()).collect()
}

impl AudioBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
        let program = find_in_path(&self.program).ok_or_else(|| {
            AudioError::Unsupported(format!("player `{}` not found in PATH", self.program))
        })?;
        debug!(player = %program.display(), "Opened command audio context");
        Ok(Arc::new(CommandContext {
            program,
            args: self.args.clone(),
            state: StateCell::new(),
        }))
    }
}

struct CommandContext {
    program: PathBuf,
    args: Vec<String>,
    state: StateCell,
}

impl AudioContext for CommandContext {
    fn state(&self) -> ContextState {
        self.state.get()
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        Box::pin(async move { self.state.resume() })
    }

    fn play(&self, burst: &Burst) -> Result<Box<dyn Voice>, AudioError> {
        self.state.require_running()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AudioError::Unsupported("no async runtime".to_string()))?;
        let wav = encode_wav(burst)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            runtime.spawn(async move {
                // A killed player closes the pipe early; that is expected.
                if let Err(e) = stdin.write_all(&wav).await {
                    debug!("Player stdin closed: {}", e);
                }
            });
        }

        Ok(Box::new(CommandVoice { child }))
    }

    fn close(&self) {
        self.state.set(ContextState::Closed);
    }
}

struct CommandVoice {
    child: Child,
}

impl Voice for CommandVoice {
    fn silence(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited.
            debug!("Player kill failed: {}", e);
        }
    }

    fn is_sounding(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Encode a burst as 16-bit mono PCM WAV.
pub fn encode_wav(burst: &Burst) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: burst.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in &burst.samples {
            writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// Terminal bell. Works almost everywhere, cannot be cut off.
#[derive(Debug, Default, Clone, Copy)]
pub struct BellBackend;

impl AudioBackend for BellBackend {
    fn name(&self) -> &'static str {
        "bell"
    }

    fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
        Ok(Arc::new(BellContext {
            state: StateCell::new(),
        }))
    }
}

struct BellContext {
    state: StateCell,
}

impl AudioContext for BellContext {
    fn state(&self) -> ContextState {
        self.state.get()
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        Box::pin(async move { self.state.resume() })
    }

    fn play(&self, burst: &Burst) -> Result<Box<dyn Voice>, AudioError> {
        self.state.require_running()?;
        if !burst.is_silent() {
            // BEL character; the terminal decides what it sounds like
            let mut stdout = io::stdout();
            stdout.write_all(b"\x07")?;
            stdout.flush()?;
        }
        Ok(Box::new(SilentVoice))
    }

    fn close(&self) {
        self.state.set(ContextState::Closed);
    }
}

struct SilentVoice;

impl Voice for SilentVoice {
    fn silence(&mut self) {}

    fn is_sounding(&mut self) -> bool {
        false
    }
}

/// No audio at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
        warn!("Audio output disabled");
        Err(AudioError::Unsupported("audio output disabled".to_string()))
    }
}
