//! Minimal latency harness for the audio codec path: reports wall-clock cost
//! of resample + mulaw encode + chunk over a synthetic caller-audio buffer,
//! as a cheap regression check independent of any live call or model.

use std::time::Instant;
use voice_agent::audio::codec::{chunk, pcm16_to_mulaw, resample, Encoding};

fn main() {
    voice_agent::init_tracing();

    let samples = 1_000usize;
    let payload_ms = 2_000u32;
    let from_hz = 16_000u32;
    let to_hz = 8_000u32;
    let chunk_ms = 20u32;

    let pcm16: Vec<i16> = (0..(from_hz * payload_ms / 1000))
        .map(|i| ((i as f64 * 0.05).sin() * 8_000.0) as i16)
        .collect();

    let mut total_nanos: u128 = 0;
    for _ in 0..samples {
        let start = Instant::now();
        let resampled = resample(&pcm16, from_hz, to_hz);
        let mulaw = pcm16_to_mulaw(&resampled);
        let _frames = chunk(&mulaw, Encoding::Mulaw, to_hz, chunk_ms).expect("chunk");
        total_nanos += start.elapsed().as_nanos();
    }

    let avg_micros = total_nanos as f64 / samples as f64 / 1_000.0;
    tracing::info!(avg_micros, samples, from_hz, to_hz, "codec round trip complete");
    println!(
        "codec round trip over {payload_ms}ms @ {from_hz}->{to_hz}Hz: {samples} samples, avg {avg_micros:.1}us"
    );
}
