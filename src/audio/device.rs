//! Audio output straight to the default device through cpal.
//!
//! cpal streams cannot leave the thread that built them, so each context
//! owns a dedicated output thread. Bursts are mixed into the stream by the
//! data callback.

use super::{AudioBackend, AudioContext, AudioError, Burst, ContextState, StateCell, Voice};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;
use tracing::{debug, error, info};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
struct TrackState {
    cut: AtomicBool,
    finished: AtomicBool,
}

/// One burst being mixed into the output.
struct Track {
    samples: Arc<[f32]>,
    position: f64,
    /// Source samples per output frame
    step: f64,
    state: Arc<TrackState>,
}

impl Track {
    fn next(&mut self) -> Option<f32> {
        if self.state.cut.load(Ordering::Relaxed) {
            return None;
        }
        let Some(sample) = self.samples.get(self.position as usize) else {
            self.state.finished.store(true, Ordering::Relaxed);
            return None;
        };
        self.position += self.step;
        Some(*sample)
    }
}

#[derive(Default)]
struct Mixer {
    tracks: Mutex<Vec<Track>>,
}

impl Mixer {
    fn add(&self, burst: &Burst, output_rate: u32) -> DeviceVoice {
        let state = Arc::new(TrackState::default());
        lock(&self.tracks).push(Track {
            samples: Arc::from(burst.samples.as_slice()),
            position: 0.0,
            step: f64::from(burst.sample_rate) / f64::from(output_rate.max(1)),
            state: Arc::clone(&state),
        });
        DeviceVoice { state }
    }

    /// Fill an interleaved output buffer, same value on every channel.
    fn fill<T: SizedSample + FromSample<f32>>(&self, data: &mut [T], channels: usize) {
        let mut tracks = lock(&self.tracks);
        for frame in data.chunks_mut(channels.max(1)) {
            let mixed: f32 = tracks.iter_mut().filter_map(Track::next).sum();
            let sample = <T as FromSample<f32>>::from_sample_(mixed.clamp(-1.0, 1.0));
            frame.fill(sample);
        }
        tracks.retain(|t| !t.state.cut.load(Ordering::Relaxed) && !t.state.finished.load(Ordering::Relaxed));
    }
}

struct DeviceVoice {
    state: Arc<TrackState>,
}

impl Voice for DeviceVoice {
    fn silence(&mut self) {
        self.state.cut.store(true, Ordering::Relaxed);
    }

    fn is_sounding(&mut self) -> bool {
        !self.state.cut.load(Ordering::Relaxed) && !self.state.finished.load(Ordering::Relaxed)
    }
}

/// The system's default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceBackend;

impl AudioBackend for DeviceBackend {
    fn name(&self) -> &'static str {
        "device"
    }

    fn open(&self) -> Result<Arc<dyn AudioContext>, AudioError> {
        let mixer = Arc::new(Mixer::default());
        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let output_mixer = Arc::clone(&mixer);
        thread::Builder::new()
            .name("singlebell-audio".to_string())
            .spawn(move || run_output(output_mixer, ready_tx, shutdown_rx))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| AudioError::Unsupported("audio thread exited".to_string()))?
            .map_err(AudioError::Unsupported)?;

        Ok(Arc::new(DeviceContext {
            mixer,
            rate,
            state: StateCell::new(),
            shutdown: Mutex::new(Some(shutdown_tx)),
        }))
    }
}

struct DeviceContext {
    mixer: Arc<Mixer>,
    rate: u32,
    state: StateCell,
    /// Dropping the sender ends the output thread.
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl AudioContext for DeviceContext {
    fn state(&self) -> ContextState {
        self.state.get()
    }

    fn resume(&self) -> BoxFuture<'_, Result<(), AudioError>> {
        Box::pin(async move { self.state.resume() })
    }

    fn play(&self, burst: &Burst) -> Result<Box<dyn Voice>, AudioError> {
        self.state.require_running()?;
        Ok(Box::new(self.mixer.add(burst, self.rate)))
    }

    fn close(&self) {
        self.state.set(ContextState::Closed);
        lock(&self.shutdown).take();
    }
}

fn run_output(mixer: Arc<Mixer>, ready: mpsc::Sender<Result<u32, String>>, shutdown: mpsc::Receiver<()>) {
    let stream = match open_stream(&mixer) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Blocks until the context is closed or dropped.
    let _ = shutdown.recv();
    if let Err(e) = stream.pause() {
        debug!("Failed to pause audio stream: {}", e);
    }
    debug!("Audio output thread finished");
}

fn open_stream(mixer: &Arc<Mixer>) -> Result<(Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no default output device".to_string())?;
    let supported = device
        .default_output_config()
        .map_err(|e| format!("failed to get default config: {}", e))?;

    let sample_format = supported.sample_format();
    let config = supported.config();
    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, mixer)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, mixer)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, mixer)?,
        other => return Err(format!("unsupported sample format: {:?}", other)),
    };
    stream
        .play()
        .map_err(|e| format!("failed to start stream: {}", e))?;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "Audio device opened"
    );
    Ok((stream, config.sample_rate.0))
}

fn build_stream<T: SizedSample + FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    mixer: &Arc<Mixer>,
) -> Result<Stream, String> {
    let channels = config.channels as usize;
    let mixer = Arc::clone(mixer);
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| mixer.fill(data, channels),
            |err| error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))
}
