use super::PCM16_SAMPLE_WIDTH;

fn samples(pcm: &[u8]) -> impl Iterator<Item = i16> + '_ {
    pcm.chunks_exact(PCM16_SAMPLE_WIDTH)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
}

/// Linear-interpolation resampler for mono PCM16.
///
/// Good enough for speech headed to an 8kHz phone line; no anti-alias filter
/// is applied when downsampling.
pub fn resample_pcm16(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return pcm.to_vec();
    }

    let input: Vec<i16> = samples(pcm).collect();
    if input.is_empty() {
        return Vec::new();
    }

    let out_len = (input.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = input.len() - 1;

    let mut out = Vec::with_capacity(out_len * PCM16_SAMPLE_WIDTH);
    for i in 0..out_len {
        let position = i as f64 * step;
        let index = (position as usize).min(last);
        let next = (index + 1).min(last);
        let frac = position - index as f64;

        let a = f64::from(input[index]);
        let b = f64::from(input[next]);
        let value = (a + (b - a) * frac).round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Average interleaved channels down to mono PCM16.
pub fn downmix_to_mono(pcm: &[u8], channels: u16) -> Vec<u8> {
    let channels = usize::from(channels);
    if channels <= 1 {
        return pcm.to_vec();
    }

    let frame_width = channels * PCM16_SAMPLE_WIDTH;
    pcm.chunks_exact(frame_width)
        .flat_map(|frame| {
            let sum: i32 = samples(frame).map(i32::from).sum();
            ((sum / channels as i32) as i16).to_le_bytes()
        })
        .collect()
}
