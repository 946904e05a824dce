//! Converts a downloaded video into an MP3 artifact.
//!
//! Primary strategy is an external `ffmpeg` invocation at a fixed bitrate
//! and sample rate. When ffmpeg is missing, exits non-zero, or exceeds its
//! time budget, the fallback decodes the container in-process with symphonia
//! and re-encodes the audio track through LAME at the same bitrate. Only
//! when both strategies fail does the extractor report an error, carrying
//! both messages for diagnostics.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, InterleavedPcm, Quality};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::process::Command;

use crate::error::{PipelineError, Result};

/// Wall-clock budget for the external transcoder.
const FFMPEG_TIMEOUT: Duration = Duration::from_secs(300);

const AUDIO_BITRATE_KBPS: &str = "192k";
const AUDIO_SAMPLE_RATE: &str = "44100";

/// Frames fed to the LAME encoder per call.
const ENCODE_CHUNK_FRAMES: usize = 1152 * 64;

#[cfg(test)]
use std::path::PathBuf;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

#[cfg(test)]
static FFMPEG_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn ffmpeg_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = FFMPEG_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("ffmpeg")
}

#[cfg(test)]
pub(crate) fn set_ffmpeg_stub_path(path: PathBuf) -> FfmpegStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = FFMPEG_STUB.lock().unwrap();
        *lock = Some(path);
    }
    FfmpegStubGuard { lock: Some(guard) }
}

#[cfg(test)]
pub(crate) struct FfmpegStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for FfmpegStubGuard {
    fn drop(&mut self) {
        *FFMPEG_STUB.lock().unwrap() = None;
        self.lock.take();
    }
}

/// Extracts the audio track of `video_path` into `audio_path` as MP3.
/// The caller is expected to verify the output size afterwards.
pub async fn extract_audio(video_path: &Path, audio_path: &Path) -> Result<()> {
    let primary_err = match run_ffmpeg(video_path, audio_path).await {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };

    eprintln!("Warning: ffmpeg extraction failed ({primary_err}), trying in-process decoder");

    let video = video_path.to_path_buf();
    let audio = audio_path.to_path_buf();
    let fallback = tokio::task::spawn_blocking(move || decode_and_encode(&video, &audio))
        .await
        .map_err(|err| PipelineError::extraction(format!("decoder task failed: {err}")))?;

    match fallback {
        Ok(()) => Ok(()),
        Err(fallback_err) => Err(PipelineError::extraction(format!(
            "Both ffmpeg and in-process audio extraction failed. ffmpeg: {primary_err}. decoder: {fallback_err}"
        ))),
    }
}

async fn run_ffmpeg(video_path: &Path, audio_path: &Path) -> Result<()> {
    let mut command = ffmpeg_command();
    command
        .arg("-i")
        .arg(video_path)
        .arg("-vn")
        .arg("-acodec")
        .arg("libmp3lame")
        .arg("-ab")
        .arg(AUDIO_BITRATE_KBPS)
        .arg("-ar")
        .arg(AUDIO_SAMPLE_RATE)
        .arg("-y")
        .arg(audio_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(FFMPEG_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            PipelineError::timeout(format!(
                "ffmpeg exceeded {} seconds",
                FFMPEG_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                PipelineError::process(
                    "Command not found: ffmpeg. Please ensure it's installed and in PATH.",
                )
            } else {
                PipelineError::process(format!("error running ffmpeg: {err}"))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("unknown ffmpeg error");
        return Err(PipelineError::process(format!(
            "ffmpeg exited with {}: {detail}",
            output.status
        )));
    }

    Ok(())
}

/// In-process fallback: symphonia decode, LAME encode.
fn decode_and_encode(video_path: &Path, audio_path: &Path) -> Result<()> {
    let decoded = decode_audio_track(video_path)?;
    let mp3 = encode_mp3(&decoded)?;
    std::fs::write(audio_path, mp3)
        .map_err(|err| PipelineError::io(format!("writing {}: {err}", audio_path.display())))?;
    Ok(())
}

struct DecodedAudio {
    /// Interleaved stereo f32 samples.
    samples: Vec<f32>,
    sample_rate: u32,
}

fn decode_audio_track(path: &Path) -> Result<DecodedAudio> {
    let src = std::fs::File::open(path)
        .map_err(|err| PipelineError::io(format!("opening {}: {err}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| PipelineError::extraction(format!("unreadable container: {err}")))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PipelineError::extraction("no audio track found in video file"))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| PipelineError::extraction(format!("unsupported audio codec: {err}")))?;

    let mut interleaved: Vec<f32> = Vec::new();
    let mut sample_rate = 0u32;
    let mut channels = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => {
                return Err(PipelineError::extraction(format!("decode error: {err}")));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(buffer) => {
                let spec = *buffer.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count();
                let mut sample_buf = SampleBuffer::<f32>::new(buffer.capacity() as u64, spec);
                sample_buf.copy_interleaved_ref(buffer);
                interleaved.extend_from_slice(sample_buf.samples());
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => {
                return Err(PipelineError::extraction(format!("decode error: {err}")));
            }
        }
    }

    if interleaved.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(PipelineError::extraction(
            "no audio track found in video file",
        ));
    }

    Ok(DecodedAudio {
        samples: to_stereo(&interleaved, channels),
        sample_rate,
    })
}

/// Normalizes any channel layout to interleaved stereo: mono is duplicated,
/// wider layouts keep their first two channels.
fn to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => interleaved.to_vec(),
        1 => interleaved.iter().flat_map(|s| [*s, *s]).collect(),
        n => interleaved
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

fn encode_mp3(audio: &DecodedAudio) -> Result<Vec<u8>> {
    let mut builder = Builder::new()
        .ok_or_else(|| PipelineError::extraction("could not create LAME encoder"))?;
    builder
        .set_num_channels(2)
        .map_err(|err| PipelineError::extraction(format!("LAME channel setup: {err}")))?;
    builder
        .set_sample_rate(audio.sample_rate)
        .map_err(|err| PipelineError::extraction(format!("LAME sample rate setup: {err}")))?;
    builder
        .set_brate(Bitrate::Kbps192)
        .map_err(|err| PipelineError::extraction(format!("LAME bitrate setup: {err}")))?;
    builder
        .set_quality(Quality::Best)
        .map_err(|err| PipelineError::extraction(format!("LAME quality setup: {err}")))?;
    let mut encoder = builder
        .build()
        .map_err(|err| PipelineError::extraction(format!("LAME init: {err}")))?;

    let mut out: Vec<u8> = Vec::new();
    for chunk in audio.samples.chunks(ENCODE_CHUNK_FRAMES * 2) {
        out.reserve(mp3lame_encoder::max_required_buffer_size(chunk.len() / 2));
        let written = encoder
            .encode(InterleavedPcm(chunk), out.spare_capacity_mut())
            .map_err(|err| PipelineError::extraction(format!("LAME encode: {err}")))?;
        // LAME guarantees exactly `written` initialized bytes.
        unsafe {
            out.set_len(out.len() + written);
        }
    }

    out.reserve(mp3lame_encoder::max_required_buffer_size(
        ENCODE_CHUNK_FRAMES,
    ));
    let flushed = encoder
        .flush::<FlushNoGap>(out.spare_capacity_mut())
        .map_err(|err| PipelineError::extraction(format!("LAME flush: {err}")))?;
    unsafe {
        out.set_len(out.len() + flushed);
    }

    Ok(out)
}
