use chrono::Utc;

pub fn setup_tracing(verbosity_level: u8) {
    let filter = match verbosity_level {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        2 => tracing::level_filters::LevelFilter::TRACE,
        _ => tracing::level_filters::LevelFilter::TRACE,
    };

    tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_max_level(filter)
        .init();
}

/// Current wall-clock time as fractional unix seconds, the timestamp
/// format carried in fabric message metadata.
pub fn unix_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Root-mean-square of a PCM16 chunk scaled into [0, 1].
pub fn normalized_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let sample = sample as f64;
            sample * sample
        })
        .sum();
    let rms = (sum_of_squares / samples.len() as f64).sqrt();
    (rms / i16::MAX as f64).clamp(0.0, 1.0) as f32
}
