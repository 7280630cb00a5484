//! Microphone capture and speaker playback via `cpal` (grounded in the
//! teacher's `audio.rs`: device enumeration, a `build_input_stream` that
//! copies captured samples into an application-owned buffer, and a
//! `build_output_stream` mirror for playback). Adapted here to the
//! [`crate::capture::AudioSource`] trait and to the fixed PCM frame shape
//! the rest of the crate uses (spec §4.4).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::buffers::audio_ring::{DEFAULT_CHANNELS, DEFAULT_FRAME_SAMPLES, DEFAULT_SAMPLE_RATE};
use crate::buffers::PcmFrame;
use crate::capture::AudioSource;
use crate::error::{AsciiChatError, Result};

/// Enumerate available input and output devices.
pub fn list_devices() -> Result<(Vec<Device>, Vec<Device>)> {
    let host = cpal::default_host();
    let inputs: Vec<_> = host.input_devices().map_err(|_| AsciiChatError::Allocation("enumerating input devices"))?.collect();
    let outputs: Vec<_> =
        host.output_devices().map_err(|_| AsciiChatError::Allocation("enumerating output devices"))?.collect();
    Ok((inputs, outputs))
}

/// Best-effort device name (fallback to "<unknown>").
pub fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// Microphone capture source backed by a real `cpal` input stream. The
/// stream's callback resamples/regroups captured audio into fixed-size
/// [`PcmFrame`]s (spec §4.4: "Frame size... fixed at compile time") and
/// pushes them through a bounded channel; [`AudioSource::next_frame`] just
/// drains that channel, so the stream's own thread (owned by `cpal`,
/// outside our thread-per-worker model) never blocks on us.
pub struct CpalAudioSource {
    _stream: cpal::Stream,
    rx: Receiver<PcmFrame>,
    running: Arc<AtomicBool>,
}

impl CpalAudioSource {
    /// Open the host's default input device and start capturing.
    pub fn default_input() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AsciiChatError::Allocation("no default input device"))?;
        Self::from_device(&device)
    }

    pub fn from_device(device: &Device) -> Result<Self> {
        let cfg = device.default_input_config().map_err(|_| AsciiChatError::Allocation("no default input config"))?;
        let sample_format = cfg.sample_format();
        let config: StreamConfig = cfg.into();
        let (tx, rx): (Sender<PcmFrame>, Receiver<PcmFrame>) = crossbeam_channel::bounded(64);
        let running = Arc::new(AtomicBool::new(true));

        let stream = build_input_stream(device, &config, sample_format, tx, running.clone())?;
        stream.play().map_err(|_| AsciiChatError::Allocation("starting input stream"))?;
        debug!(sample_rate = config.sample_rate.0, channels = config.channels, "input stream started");
        Ok(Self { _stream: stream, rx, running })
    }
}

impl AudioSource for CpalAudioSource {
    fn next_frame(&mut self) -> Result<Option<PcmFrame>> {
        if !self.running.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match self.rx.recv_timeout(std::time::Duration::from_millis(500)) {
            Ok(frame) => Ok(Some(frame)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(Some(vec![0.0; DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS])),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Drop for CpalAudioSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Regroup an input callback's raw samples into fixed-size interleaved f32
/// frames of `DEFAULT_FRAME_SAMPLES * channels` samples, resampling the
/// channel count by duplication/averaging to [`DEFAULT_CHANNELS`] and
/// leaving sample-rate conversion to the mixer (spec §4.4 documents the
/// chosen defaults; no resampler is pulled in for this path, matching the
/// teacher, which also performs no resampling).
struct Regrouper {
    channels: usize,
    scratch: Vec<f32>,
}

impl Regrouper {
    fn new(channels: usize) -> Self {
        Self { channels, scratch: Vec::with_capacity(DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS * 2) }
    }

    fn push(&mut self, samples: &[f32], tx: &Sender<PcmFrame>) {
        for chunk in samples.chunks(self.channels) {
            match (self.channels, DEFAULT_CHANNELS) {
                (c, d) if c == d => self.scratch.extend_from_slice(chunk),
                (1, 2) => {
                    self.scratch.push(chunk[0]);
                    self.scratch.push(chunk[0]);
                }
                (c, 1) if c >= 1 => {
                    let avg = chunk.iter().sum::<f32>() / chunk.len() as f32;
                    self.scratch.push(avg);
                }
                _ => self.scratch.extend_from_slice(chunk),
            }
            let frame_len = DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS;
            while self.scratch.len() >= frame_len {
                let frame: PcmFrame = self.scratch.drain(..frame_len).collect();
                let _ = tx.try_send(frame);
            }
        }
    }
}

fn build_input_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    tx: Sender<PcmFrame>,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let err_fn = |err| warn!(%err, "audio input stream error");

    let stream = match sample_format {
        SampleFormat::F32 => {
            let mut regrouper = Regrouper::new(channels);
            device
                .build_input_stream(
                    config,
                    move |data: &[f32], _| {
                        if running.load(Ordering::Relaxed) {
                            regrouper.push(data, &tx);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|_| AsciiChatError::Allocation("building f32 input stream"))?
        }
        SampleFormat::I16 => {
            let mut regrouper = Regrouper::new(channels);
            device
                .build_input_stream(
                    config,
                    move |data: &[i16], _| {
                        if running.load(Ordering::Relaxed) {
                            let floats: Vec<f32> = data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                            regrouper.push(&floats, &tx);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|_| AsciiChatError::Allocation("building i16 input stream"))?
        }
        SampleFormat::U16 => {
            let mut regrouper = Regrouper::new(channels);
            device
                .build_input_stream(
                    config,
                    move |data: &[u16], _| {
                        if running.load(Ordering::Relaxed) {
                            let floats: Vec<f32> =
                                data.iter().map(|s| (*s as f32 - 32768.0) / 32768.0).collect();
                            regrouper.push(&floats, &tx);
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|_| AsciiChatError::Allocation("building u16 input stream"))?
        }
        _other => return Err(AsciiChatError::Allocation("unsupported cpal sample format")),
    };
    Ok(stream)
}

/// Start playback of mixed audio received from the server. Frames are
/// drained from `rx` by the output stream's own callback (outside our
/// thread model, same as capture).
pub fn build_output_stream(device: &Device, rx: Receiver<PcmFrame>, running: Arc<AtomicBool>) -> Result<cpal::Stream> {
    let cfg = device.default_output_config().map_err(|_| AsciiChatError::Allocation("no default output config"))?;
    let config: StreamConfig = cfg.into();
    let stream = device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _| {
                if !running.load(Ordering::Relaxed) {
                    out.fill(0.0);
                    return;
                }
                match rx.try_recv() {
                    Ok(frame) => {
                        let n = out.len().min(frame.len());
                        out[..n].copy_from_slice(&frame[..n]);
                        for sample in &mut out[n..] {
                            *sample = 0.0;
                        }
                    }
                    Err(_) => out.fill(0.0),
                }
            },
            |err| warn!(%err, "audio output stream error"),
            None,
        )
        .map_err(|_| AsciiChatError::Allocation("building output stream"))?;
    stream.play().map_err(|_| AsciiChatError::Allocation("starting output stream"))?;
    Ok(stream)
}

/// Sample rate, channel count, and frame size this crate's audio pipeline
/// uses end to end (spec §4.4, §9's open question on documenting defaults).
pub fn default_params() -> (u32, usize, usize) {
    (DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, DEFAULT_FRAME_SAMPLES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regroup_matching_channels_passes_through() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let mut regrouper = Regrouper::new(DEFAULT_CHANNELS);
        let samples = vec![0.5f32; DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS];
        regrouper.push(&samples, &tx);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS);
    }

    #[test]
    fn regroup_mono_duplicates_to_stereo() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let mut regrouper = Regrouper::new(1);
        let samples = vec![0.25f32; DEFAULT_FRAME_SAMPLES];
        regrouper.push(&samples, &tx);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), DEFAULT_FRAME_SAMPLES * DEFAULT_CHANNELS);
        assert!(frame.iter().all(|&s| s == 0.25));
    }
}
