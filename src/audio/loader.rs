//! # Audio Loading
//!
//! Decodes uploaded bytes into interleaved f32 frames. WAV goes through the `wav`
//! crate; everything else (MP3, FLAC, OGG/Vorbis, AAC/MP4) is probed by symphonia.
//! WAV files the `wav` crate cannot read (extensible headers, odd bit depths) fall
//! through to symphonia as well.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use super::RawAudio;
use crate::error::{AppError, AppResult};

/// Decoded audio before any conditioning.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// Decode a raw upload.
pub fn load(raw: &RawAudio) -> AppResult<DecodedAudio> {
    if raw.bytes.is_empty() {
        return Err(AppError::Input("Uploaded audio is empty".to_string()));
    }

    let decoded = if looks_like_wav(raw) {
        match decode_wav(&raw.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("wav reader rejected upload ({}), probing with symphonia", e);
                decode_with_symphonia(raw)?
            }
        }
    } else {
        decode_with_symphonia(raw)?
    };

    if decoded.channels == 0 || decoded.sample_rate == 0 {
        return Err(AppError::Input("Audio has no channels or no sample rate".to_string()));
    }
    if decoded.frames() == 0 {
        return Err(AppError::Input("Audio contains no samples".to_string()));
    }

    debug!(
        "Decoded {} frames at {} Hz, {} channel(s)",
        decoded.frames(),
        decoded.sample_rate,
        decoded.channels
    );
    Ok(decoded)
}

/// Average interleaved channels into one.
pub fn mix_to_mono(decoded: &DecodedAudio) -> Vec<f32> {
    if decoded.channels <= 1 {
        return decoded.samples.clone();
    }
    let scale = 1.0 / decoded.channels as f32;
    decoded
        .samples
        .chunks_exact(decoded.channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Bytes needed to recognise a RIFF/WAVE header.
pub const RIFF_HEADER_LEN: usize = 12;

/// True when `bytes` open with a RIFF chunk of form type `WAVE`.
pub fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= RIFF_HEADER_LEN && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn looks_like_wav(raw: &RawAudio) -> bool {
    let riff = is_riff_wave(&raw.bytes);
    let declared = matches!(
        raw.content_type.as_str(),
        "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave"
    );
    riff || declared
}

fn decode_wav(bytes: &[u8]) -> std::io::Result<DecodedAudio> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)?;

    let samples: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.iter().map(|&s| s as f32 / 32768.0).collect(),
        wav::BitDepth::TwentyFour(v) => v.iter().map(|&s| s as f32 / 8_388_608.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => Vec::new(),
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: header.sampling_rate,
        channels: header.channel_count as usize,
    })
}

fn decode_with_symphonia(raw: &RawAudio) -> AppResult<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(raw.bytes.clone())), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = raw
        .file_name
        .as_deref()
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
    {
        hint.with_extension(ext);
    }
    if !raw.content_type.is_empty() {
        hint.mime_type(&raw.content_type);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AppError::Input(format!("Unsupported or corrupt audio: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AppError::Input("No audio track found".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AppError::Input(format!("Failed to create decoder: {}", e)))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AppError::Input(format!("Error reading audio packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count();
                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(AppError::Input(format!("Decode error: {}", e))),
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}
