//! Decoding of inbound audio fragments
//!
//! Fragments arrive as base64 inline data tagged with a MIME type. Raw PCM
//! (`audio/pcm;rate=24000`) is the common case; WAV payloads are read with
//! hound. Whatever the input layout, the result is converted to the output
//! device's rate and channel count.

use super::chunk::{AudioChunk, AudioFormat};
use crate::error::DecodeError;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Rate assumed for `audio/pcm` payloads that carry no `rate` parameter
const DEFAULT_PCM_RATE: u32 = 24000;

/// One unit of remotely produced audio, as carried on the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFragment {
    pub mime_type: String,
    /// Base64-encoded payload
    pub data: String,
}

impl EncodedFragment {
    pub fn is_audio(&self) -> bool {
        self.mime_type.trim().to_ascii_lowercase().starts_with("audio/")
    }
}

/// Decode a fragment into a chunk in `output` format
///
/// Returns `Ok(None)` for an empty payload, which contributes no duration.
pub fn decode_fragment(
    fragment: &EncodedFragment,
    output: AudioFormat,
) -> Result<Option<AudioChunk>, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(fragment.data.trim())?;
    if bytes.is_empty() {
        return Ok(None);
    }

    let (samples, input) = decode_bytes(&fragment.mime_type, &bytes)?;
    if samples.is_empty() {
        return Ok(None);
    }

    let mapped = map_channels(&samples, input.channels, output.channels);
    let resampled = resample(
        &mapped,
        output.channels,
        input.sample_rate,
        output.sample_rate,
    );
    if resampled.is_empty() {
        return Ok(None);
    }

    Ok(Some(AudioChunk::new(resampled, output)))
}

/// Parse the container, returning interleaved samples and their layout
fn decode_bytes(mime_type: &str, bytes: &[u8]) -> Result<(Vec<f32>, AudioFormat), DecodeError> {
    let mime = MimeType::parse(mime_type);

    match mime.essence.as_str() {
        // Raw PCM can start with "RIFF" by chance, so only sniff other types
        "audio/pcm" | "audio/l16" => {
            let format = AudioFormat {
                sample_rate: mime.numeric_param("rate")?.unwrap_or(DEFAULT_PCM_RATE),
                channels: mime.numeric_param("channels")?.unwrap_or(1),
            };
            let samples = decode_pcm16(bytes, format.channels)?;
            Ok((samples, format))
        }
        "audio/wav" | "audio/x-wav" => decode_wav(bytes),
        _ if bytes.starts_with(b"RIFF") => decode_wav(bytes),
        _ => Err(DecodeError::Unsupported(mime_type.to_string())),
    }
}

/// Signed 16-bit little-endian interleaved PCM
fn decode_pcm16(bytes: &[u8], channels: u16) -> Result<Vec<f32>, DecodeError> {
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(DecodeError::Truncated {
            len: bytes.len(),
            channels,
        });
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, AudioFormat), DecodeError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(DecodeError::Unsupported(format!(
            "WAV with {} channels at {} Hz",
            spec.channels, spec.sample_rate
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<Vec<f32>, _>>()?,
        hound::SampleFormat::Int => {
            let max_value = (1u64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect::<Result<Vec<f32>, _>>()?
        }
    };

    Ok((
        samples,
        AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        },
    ))
}

/// Convert interleaved samples between channel counts
///
/// Downmixing to mono averages, upmixing from mono replicates. Other
/// combinations go through mono.
pub fn map_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = from.max(1) as usize;
    let to = to.max(1) as usize;

    if from == to {
        return samples.to_vec();
    }

    let mono: Vec<f32> = if from == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks(from)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    if to == 1 {
        return mono;
    }

    mono.iter()
        .flat_map(|&s| std::iter::repeat(s).take(to))
        .collect()
}

/// Linear resampling of interleaved frames
pub fn resample(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let channels = channels.max(1) as usize;
    let in_frames = samples.len() / channels;
    let ratio = from_rate as f64 / to_rate as f64;
    let out_frames = (in_frames as f64 / ratio).round() as usize;
    let mut output = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let src = i as f64 * ratio;
        let idx = (src as usize).min(in_frames - 1);
        let frac = (src - idx as f64) as f32;
        let next = (idx + 1).min(in_frames - 1);

        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            output.push(a * (1.0 - frac) + b * frac);
        }
    }

    output
}

/// `type/subtype; key=value; ...`
struct MimeType {
    essence: String,
    params: Vec<(String, String)>,
}

impl MimeType {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.split(';');
        let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let params = parts
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                Some((k.trim().to_ascii_lowercase(), v.trim().to_string()))
            })
            .collect();
        Self { essence, params }
    }

    fn numeric_param<T>(&self, name: &str) -> Result<Option<T>, DecodeError>
    where
        T: std::str::FromStr + PartialEq + Default,
    {
        let Some((_, value)) = self.params.iter().find(|(k, _)| k == name) else {
            return Ok(None);
        };
        match value.parse::<T>() {
            Ok(v) if v != T::default() => Ok(Some(v)),
            _ => Err(DecodeError::BadParameter {
                name: name.to_string(),
                value: value.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_fragment(mime: &str, samples: &[i16]) -> EncodedFragment {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        EncodedFragment {
            mime_type: mime.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    #[test]
    fn test_pcm_at_output_rate() {
        let fragment = pcm_fragment("audio/pcm;rate=24000", &[0, 16384, -16384, i16::MIN]);
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.samples(), &[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(chunk.format(), AudioFormat::PLAYBACK);
    }

    #[test]
    fn test_pcm_rate_defaults_to_24k() {
        let fragment = pcm_fragment("audio/pcm", &[0; 240]);
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.frames(), 240);
        assert!((chunk.duration() - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_pcm_is_resampled() {
        let fragment = pcm_fragment("audio/pcm;rate=16000", &[0; 1600]);
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.frames(), 2400);
        assert!((chunk.duration() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_stereo_pcm_is_downmixed() {
        let fragment = pcm_fragment("audio/pcm; rate=24000; channels=2", &[16384, 0, -16384, -16384]);
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.samples(), &[0.25, -0.5]);
    }

    #[test]
    fn test_empty_payload_is_noop() {
        let fragment = EncodedFragment {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: String::new(),
        };
        assert!(decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_payloads() {
        let bad_base64 = EncodedFragment {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: "not base64!!".to_string(),
        };
        assert!(matches!(
            decode_fragment(&bad_base64, AudioFormat::PLAYBACK),
            Err(DecodeError::Base64(_))
        ));

        let odd = EncodedFragment {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
        };
        assert!(matches!(
            decode_fragment(&odd, AudioFormat::PLAYBACK),
            Err(DecodeError::Truncated { len: 3, channels: 1 })
        ));

        let zero_rate = pcm_fragment("audio/pcm;rate=0", &[0, 0]);
        assert!(matches!(
            decode_fragment(&zero_rate, AudioFormat::PLAYBACK),
            Err(DecodeError::BadParameter { .. })
        ));

        let mp3 = pcm_fragment("audio/mpeg", &[0, 0]);
        assert!(matches!(
            decode_fragment(&mp3, AudioFormat::PLAYBACK),
            Err(DecodeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_wav_payload() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..4800 {
                writer.write_sample(8192i16).unwrap();
                writer.write_sample(8192i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let bytes = cursor.into_inner();
        let fragment = EncodedFragment {
            mime_type: "audio/wav".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.frames(), 2400);
        assert!(chunk.samples().iter().all(|&s| (s - 0.25).abs() < 1e-6));

        // untyped payloads are recognised by their header
        let untyped = EncodedFragment {
            mime_type: "application/octet-stream".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let chunk = decode_fragment(&untyped, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.frames(), 2400);
    }

    #[test]
    fn test_pcm_starting_with_riff_stays_pcm() {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0u8; 44]);
        let fragment = EncodedFragment {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let chunk = decode_fragment(&fragment, AudioFormat::PLAYBACK)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.frames(), 24);
        assert_eq!(chunk.samples()[0], i16::from_le_bytes(*b"RI") as f32 / 32768.0);
    }

    #[test]
    fn test_map_channels() {
        assert_eq!(map_channels(&[0.5, -0.5], 1, 2), vec![0.5, 0.5, -0.5, -0.5]);
        assert_eq!(map_channels(&[1.0, 0.0, 0.0, 1.0], 2, 1), vec![0.5, 0.5]);
        assert_eq!(
            map_channels(&[0.5, 0.5, 0.5, 0.25, 0.25, 0.25], 3, 2),
            vec![0.5, 0.5, 0.25, 0.25]
        );
    }

    #[test]
    fn test_resample() {
        let samples = vec![0.0, 1.0, 0.0, -1.0];
        let resampled = resample(&samples, 1, 4, 2);
        assert_eq!(resampled, vec![0.0, 0.0]);

        let upsampled = resample(&[0.0, 1.0], 1, 1, 2);
        assert_eq!(upsampled, vec![0.0, 0.5, 1.0, 1.0]);
    }
}
