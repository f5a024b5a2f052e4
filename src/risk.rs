use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{GradeRecord, SampleOrigin, TrainingSample};

/// Ground-truth label: 1 when the average is at or below the threshold.
pub fn risk_label(average: f64, threshold: f64) -> u8 {
    u8::from(average <= threshold)
}

/// One real sample per student, labelled on the rounded average the
/// classifier is trained on.
pub fn label_records(records: &[GradeRecord], threshold: f64) -> Vec<TrainingSample> {
    records
        .iter()
        .enumerate()
        .map(|(student, record)| {
            let average = record.rounded_average();
            TrainingSample {
                average,
                risk_label: risk_label(average, threshold),
                origin: SampleOrigin::Real { student },
            }
        })
        .collect()
}

/// Appends `replication_factor` noisy copies of every real sample.
///
/// Copies are grouped by pass, each pass walking the students in order.
/// Noisy averages are not clamped back into the grade range.
pub fn augment(
    real: &[TrainingSample],
    replication_factor: usize,
    noise_std_dev: f64,
    seed: u64,
) -> Result<Vec<TrainingSample>> {
    if noise_std_dev.is_nan() || noise_std_dev < 0.0 {
        return Err(PipelineError::Internal(format!(
            "noise deviation must be non-negative, got {noise_std_dev}"
        )));
    }
    let noise = Normal::new(0.0, noise_std_dev).map_err(|err| {
        PipelineError::Internal(format!("invalid noise deviation {noise_std_dev}: {err}"))
    })?;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut pool = Vec::with_capacity(real.len() * (replication_factor + 1));
    pool.extend_from_slice(real);

    for pass in 0..replication_factor {
        for (student, sample) in real.iter().enumerate() {
            pool.push(TrainingSample {
                average: sample.average + noise.sample(&mut rng),
                risk_label: sample.risk_label,
                origin: SampleOrigin::Synthetic { student, pass },
            });
        }
    }

    debug!(
        real = real.len(),
        synthetic = pool.len() - real.len(),
        "training pool augmented"
    );
    Ok(pool)
}
