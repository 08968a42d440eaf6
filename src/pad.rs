use crate::config::PadType;

fn pad_sequence(mut sequence: Vec<f32>, len: usize) -> Vec<f32> {
    sequence.resize(len, 0.0);
    sequence
}

fn repeat_sequence(sequence: Vec<f32>, len: usize) -> Vec<f32> {
    if sequence.is_empty() {
        return vec![0.0; len];
    }

    sequence.iter().copied().cycle().take(len).collect()
}

/// Brings a cycle to exactly `len` samples.
pub fn pad_or_trim(mut sequence: Vec<f32>, len: usize, padding: PadType) -> Vec<f32> {
    if sequence.len() >= len {
        sequence.truncate(len);
        return sequence;
    }

    match padding {
        PadType::Zero => pad_sequence(sequence, len),
        PadType::Repeat => repeat_sequence(sequence, len),
    }
}
