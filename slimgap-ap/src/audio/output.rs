//! Audio output
//!
//! An [`OutputDevice`] pulls audio through a [`RenderCursor`] at the
//! device's pace. Two implementations:
//!
//! - [`PacedOutput`]: a real-time clocked null sink. It consumes audio at
//!   exactly the output rate and discards it, so protocol timing (track
//!   start, drain, elapsed time) behaves as it would on hardware. Default.
//! - `CpalOutput` (feature `cpal-output`): a real device via cpal, with
//!   fallback to the default device and rebuild after stream errors.

use crate::error::{Error, Result};
use crate::playback::RenderCursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output device availability change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Device failed; audio is not being consumed
    Interrupted { reason: String },
    /// Device usable again
    Restored,
}

/// Sink that drives a render cursor
pub trait OutputDevice: Send {
    /// Begin pulling audio
    fn start(&mut self, cursor: RenderCursor) -> Result<()>;

    /// Stop pulling audio and release the device
    fn stop(&mut self);

    fn name(&self) -> &str;
}

/// Default render period for the paced sink
pub const DEFAULT_PERIOD: Duration = Duration::from_millis(10);

/// Real-time clocked null sink
pub struct PacedOutput {
    sample_rate: u32,
    period: Duration,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PacedOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self::with_period(sample_rate, DEFAULT_PERIOD)
    }

    pub fn with_period(sample_rate: u32, period: Duration) -> Self {
        Self {
            sample_rate,
            period,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl OutputDevice for PacedOutput {
    fn start(&mut self, mut cursor: RenderCursor) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::AudioOutput("Paced output already running".to_string()));
        }

        let frames_per_period =
            ((self.sample_rate as u128 * self.period.as_micros()) / 1_000_000).max(1) as usize;
        let period = self.period;
        let stop_flag = Arc::clone(&self.stop_flag);
        stop_flag.store(false, Ordering::Release);

        info!(
            "Starting paced output: {}Hz, {} frames every {:?}",
            self.sample_rate, frames_per_period, period
        );

        let handle = std::thread::Builder::new()
            .name("slimgap-output".to_string())
            .spawn(move || {
                let mut samples = vec![0.0f32; frames_per_period * 2];
                let mut deadline = Instant::now();
                while !stop_flag.load(Ordering::Acquire) {
                    cursor.render(&mut samples);

                    // Absolute deadlines so scheduling jitter does not accumulate
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    } else if now - deadline > period * 10 {
                        debug!("Paced output fell behind by {:?}, resynchronizing", now - deadline);
                        deadline = now;
                    }
                }
                debug!("Paced output thread exiting");
            })
            .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {}", e)))?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Paced output thread panicked");
            }
        }
    }

    fn name(&self) -> &str {
        "paced"
    }
}

impl Drop for PacedOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalOutput;

#[cfg(feature = "cpal-output")]
mod cpal_output {
    use super::{OutputDevice, OutputEvent};
    use crate::error::{Error, Result};
    use crate::playback::events::{CoordinatorEvent, EventSender};
    use crate::playback::RenderCursor;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, SampleFormat, Stream, StreamConfig};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tracing::{debug, error, info, warn};

    const RETRY_INTERVAL: Duration = Duration::from_secs(1);
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// cpal device output
    ///
    /// cpal streams are not `Send` on every platform, so the stream lives
    /// on a dedicated thread which also rebuilds it after device errors.
    pub struct CpalOutput {
        device_name: Option<String>,
        sample_rate: u32,
        events: EventSender,
        stop_flag: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalOutput {
        pub fn new(device_name: Option<String>, sample_rate: u32, events: EventSender) -> Self {
            Self {
                device_name,
                sample_rate,
                events,
                stop_flag: Arc::new(AtomicBool::new(false)),
                thread: None,
            }
        }

        /// List available output device names
        pub fn list_devices() -> Result<Vec<String>> {
            let host = cpal::default_host();
            let devices: Vec<String> = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
                .filter_map(|device| device.name().ok())
                .collect();
            debug!("Found {} output devices", devices.len());
            Ok(devices)
        }
    }

    /// Requested device, or the default one if it is missing
    fn open_device(device_name: Option<&str>) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(device);
            }
            warn!("Requested device '{}' not found, falling back to default device", name);
        }

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No default output device found".to_string()))?;
        info!(
            "Using default audio device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        Ok(device)
    }

    /// Stereo f32 at the output rate, which is what the buffer holds
    fn stream_config(device: &Device, sample_rate: u32) -> Result<StreamConfig> {
        let mut supported = device
            .supported_output_configs()
            .map_err(|e| Error::AudioOutput(format!("Failed to get device configs: {}", e)))?;

        supported
            .find(|config| {
                config.channels() == 2
                    && config.sample_format() == SampleFormat::F32
                    && config.min_sample_rate().0 <= sample_rate
                    && config.max_sample_rate().0 >= sample_rate
            })
            .map(|config| config.with_sample_rate(cpal::SampleRate(sample_rate)).config())
            .ok_or_else(|| {
                Error::AudioOutput(format!("Device has no stereo f32 mode at {}Hz", sample_rate))
            })
    }

    fn build_stream(
        device_name: Option<&str>,
        sample_rate: u32,
        cursor: Arc<Mutex<RenderCursor>>,
        error_flag: Arc<AtomicBool>,
    ) -> Result<Stream> {
        let device = open_device(device_name)?;
        let config = stream_config(&device, sample_rate)?;
        debug!(
            "Audio config: sample_rate={}, channels={}, buffer_size={:?}",
            config.sample_rate.0, config.channels, config.buffer_size
        );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut cursor = cursor.lock().unwrap_or_else(|p| p.into_inner());
                    cursor.render(data);
                },
                move |err| {
                    error!("Audio stream error: {} - marking for recovery", err);
                    error_flag.store(true, Ordering::SeqCst);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {}", e)))?;
        Ok(stream)
    }

    impl OutputDevice for CpalOutput {
        fn start(&mut self, cursor: RenderCursor) -> Result<()> {
            if self.thread.is_some() {
                return Err(Error::AudioOutput("cpal output already running".to_string()));
            }

            let cursor = Arc::new(Mutex::new(cursor));
            let device_name = self.device_name.clone();
            let sample_rate = self.sample_rate;
            let events = self.events.clone();
            let stop_flag = Arc::clone(&self.stop_flag);

            // Fail fast if the device cannot be opened at all
            let error_flag = Arc::new(AtomicBool::new(false));
            let first = build_stream(
                device_name.as_deref(),
                sample_rate,
                Arc::clone(&cursor),
                Arc::clone(&error_flag),
            )?;
            drop(first);

            let handle = std::thread::Builder::new()
                .name("slimgap-cpal".to_string())
                .spawn(move || {
                    let mut stream: Option<Stream> = None;
                    let mut interrupted = false;
                    while !stop_flag.load(Ordering::Acquire) {
                        if stream.is_none() {
                            error_flag.store(false, Ordering::SeqCst);
                            match build_stream(
                                device_name.as_deref(),
                                sample_rate,
                                Arc::clone(&cursor),
                                Arc::clone(&error_flag),
                            ) {
                                Ok(s) => {
                                    stream = Some(s);
                                    if interrupted {
                                        info!("Audio device restored");
                                        interrupted = false;
                                        let _ = events
                                            .send(CoordinatorEvent::Output(OutputEvent::Restored));
                                    }
                                }
                                Err(e) => {
                                    if !interrupted {
                                        interrupted = true;
                                        let _ = events.send(CoordinatorEvent::Output(
                                            OutputEvent::Interrupted {
                                                reason: e.to_string(),
                                            },
                                        ));
                                    }
                                    std::thread::sleep(RETRY_INTERVAL);
                                    continue;
                                }
                            }
                        }

                        if error_flag.load(Ordering::SeqCst) {
                            stream = None;
                            if !interrupted {
                                interrupted = true;
                                let _ = events.send(CoordinatorEvent::Output(
                                    OutputEvent::Interrupted {
                                        reason: "audio stream error".to_string(),
                                    },
                                ));
                            }
                            std::thread::sleep(RETRY_INTERVAL);
                            continue;
                        }

                        std::thread::sleep(POLL_INTERVAL);
                    }
                    drop(stream);
                    debug!("cpal output thread exiting");
                })
                .map_err(|e| Error::AudioOutput(format!("Failed to spawn output thread: {}", e)))?;

            self.thread = Some(handle);
            Ok(())
        }

        fn stop(&mut self) {
            self.stop_flag.store(true, Ordering::Release);
            if let Some(handle) = self.thread.take() {
                if handle.join().is_err() {
                    warn!("cpal output thread panicked");
                }
            }
        }

        fn name(&self) -> &str {
            "cpal"
        }
    }

    impl Drop for CpalOutput {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
