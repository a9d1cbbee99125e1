use rubato::{FftFixedIn, Resampler};
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Input frames handed to the resampler per call
const CHUNK_FRAMES: usize = 1024;

/// Resample a complete mono buffer from `from_rate` to `to_rate`.
///
/// The whole buffer is pushed through in fixed-size chunks, the tail is flushed
/// with zeros, and the resampler's own delay is cut from the front, so the output
/// is time-aligned with the input and exactly `round(len * to / from)` long.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> AppResult<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(AppError::Configuration(format!(
            "Cannot resample between {} Hz and {} Hz",
            from_rate, to_rate
        )));
    }
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;

    let mut resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_FRAMES, 2, 1)
        .map_err(|e| AppError::Configuration(format!("Failed to create resampler: {}", e)))?;
    let delay = resampler.output_delay();

    debug!(
        "Resampling {} samples {} Hz -> {} Hz (delay {} frames)",
        samples.len(),
        from_rate,
        to_rate,
        delay
    );

    let mut output = Vec::with_capacity(expected + delay + CHUNK_FRAMES);

    let mut chunks = samples.chunks_exact(CHUNK_FRAMES);
    for chunk in &mut chunks {
        let input = vec![chunk.to_vec()];
        let frames = resampler.process(&input, None).map_err(resample_error)?;
        output.extend_from_slice(&frames[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let input = vec![remainder.to_vec()];
        let frames = resampler.process_partial(Some(input.as_slice()), None).map_err(resample_error)?;
        output.extend_from_slice(&frames[0]);
    }

    // Flush until the delayed tail has come out
    while output.len() < expected + delay {
        let frames = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(resample_error)?;
        if frames[0].is_empty() {
            break;
        }
        output.extend_from_slice(&frames[0]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

fn resample_error(e: rubato::ResampleError) -> AppError {
    AppError::Internal(format!("Resampling failed: {}", e))
}
