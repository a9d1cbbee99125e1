//! Multipart upload reading shared by the audio endpoints.

use actix_multipart::{Field, Multipart};
use futures_util::stream::StreamExt;

use crate::audio::loader::{is_riff_wave, RIFF_HEADER_LEN};
use crate::audio::RawAudio;
use crate::error::{AppError, AppResult};

/// Content types the classifier-only endpoint accepts.
pub const WAV_CONTENT_TYPES: &[&str] = &["audio/wav", "audio/x-wav", "audio/wave"];

pub fn is_audio(content_type: &str) -> bool {
    content_type.starts_with("audio/")
}

pub fn is_wav(content_type: &str) -> bool {
    WAV_CONTENT_TYPES.contains(&content_type)
}

/// What an upload endpoint accepts and how it reports a refusal.
#[derive(Clone, Copy)]
pub struct UploadPolicy {
    pub field_name: &'static str,
    pub accept: fn(&str) -> bool,
    /// Also take a body that opens with a RIFF/WAVE header, whatever its declared type
    pub sniff_wav: bool,
    /// Builds the error message from the received content type
    pub rejection: fn(&str) -> String,
}

impl UploadPolicy {
    fn reject(&self, content_type: &str) -> AppError {
        let received = if content_type.is_empty() { "unknown" } else { content_type };
        AppError::Input((self.rejection)(received))
    }
}

/// Read the file field named by `policy` into memory.
///
/// ## Validation:
/// - The field's content type must satisfy `policy.accept`; it is checked
///   before any bytes are buffered
/// - With `sniff_wav`, a refused type is given a second chance on the first
///   bytes of the body
/// - The body may not exceed `max_bytes`
/// - Other fields are drained and ignored
pub async fn read_audio_field(
    mut payload: Multipart,
    policy: &UploadPolicy,
    max_bytes: usize,
) -> AppResult<RawAudio> {
    let field_name = policy.field_name;
    let mut audio: Option<RawAudio> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field = item.map_err(|e| AppError::Input(format!("Multipart error: {}", e)))?;

        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map(|s| s.to_string());
        if name.as_deref() != Some(field_name) || audio.is_some() {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::Input(format!("Chunk error: {}", e)))?;
            }
            continue;
        }

        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(|s| s.to_string());
        let content_type = field
            .content_type()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_default();

        let declared_ok = (policy.accept)(&content_type);
        if !declared_ok && !policy.sniff_wav {
            return Err(policy.reject(&content_type));
        }
        let mut sniffing = !declared_ok;

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::Input(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::Input(format!(
                    "File too large (max: {} bytes)",
                    max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);

            if sniffing && bytes.len() >= RIFF_HEADER_LEN {
                if !is_riff_wave(&bytes) {
                    return Err(policy.reject(&content_type));
                }
                sniffing = false;
            }
        }

        if sniffing {
            return Err(policy.reject(&content_type));
        }
        if !declared_ok {
            tracing::debug!("Accepted {} upload with a RIFF/WAVE header", content_type);
        }

        if bytes.is_empty() {
            return Err(AppError::Input("Uploaded audio file is empty".to_string()));
        }

        tracing::debug!(
            "Received upload '{}' ({}, {} bytes)",
            file_name.as_deref().unwrap_or("unnamed"),
            content_type,
            bytes.len()
        );
        audio = Some(RawAudio::new(bytes, content_type, file_name));
    }

    audio.ok_or_else(|| AppError::Input(format!("No '{}' file provided", field_name)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const BOUNDARY: &str = "----triage-test-boundary";

    /// Encode one file field as a multipart/form-data body.
    pub(crate) fn multipart_body(field: &str, file_name: &str, content_type: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    pub(crate) fn multipart_content_type() -> String {
        format!("multipart/form-data; boundary={}", BOUNDARY)
    }

    #[test]
    fn test_policy_rejection_names_received_type() {
        let policy = UploadPolicy {
            field_name: "audio",
            accept: is_audio,
            sniff_wav: true,
            rejection: |received| format!("received {}", received),
        };
        assert_eq!(policy.reject("text/plain"), AppError::Input("received text/plain".to_string()));
        assert_eq!(policy.reject(""), AppError::Input("received unknown".to_string()));
    }

    #[test]
    fn test_content_type_predicates() {
        assert!(is_audio("audio/mpeg"));
        assert!(!is_audio("video/mp4"));
        assert!(is_wav("audio/x-wav"));
        assert!(!is_wav("audio/mpeg"));
    }
}
