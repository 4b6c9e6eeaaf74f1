use super::FitError;
use crate::config::format_param;
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Rejection draws before the truncated proposal gives up.
const MAX_PROPOSAL_ATTEMPTS: u32 = 10_000;

/// Diagonal inflation applied after every covariance update.
pub const COVARIANCE_FLOOR: f64 = 0.001;

/// Fold the evaluated parameter vector into the running mean and covariance.
///
/// The scale factor multiplies every updated covariance entry rather than
/// only the proposal, unlike textbook adaptive Metropolis; fitted chains
/// depend on this exact update. The means move first and the covariance
/// update reads the moved means.
pub fn update_moments(means: &mut DVector<f64>, cov: &mut DMatrix<f64>, theta: &[f64], step: u64) {
    let n = means.len();
    debug_assert_eq!(theta.len(), n);
    let weight = (step + 1) as f64;
    for i in 0..n {
        means[i] += (theta[i] - means[i]) / weight;
    }
    let scale = 2.85 / (n as f64).sqrt();
    for i in 0..n {
        for j in 0..n {
            let outer = (theta[i] - means[i]) * (theta[j] - means[j]);
            cov[(i, j)] = (cov[(i, j)] + (outer - cov[(i, j)]) / weight) * scale;
        }
    }
    for i in 0..n {
        cov[(i, i)] += COVARIANCE_FLOOR;
    }
}

/// Draw from a multivariate normal restricted to the `[lower, upper]` box by
/// rejection.
pub fn truncated_mvn<R: Rng + ?Sized>(
    means: &DVector<f64>,
    cov: &DMatrix<f64>,
    lower: &[f64],
    upper: &[f64],
    rng: &mut R,
) -> Result<DVector<f64>, FitError> {
    let n = means.len();
    let chol = Cholesky::new(cov.clone()).ok_or(FitError::ProposalCovariance)?;
    let l = chol.l();
    for _ in 0..MAX_PROPOSAL_ATTEMPTS {
        let z = DVector::from_fn(n, |_, _| StandardNormal.sample(rng));
        let x = means + &l * z;
        let inside = (0..n).all(|i| x[i] >= lower[i] && x[i] <= upper[i]);
        if inside {
            return Ok(x);
        }
    }
    Err(FitError::ProposalExhausted)
}

/// Six-significant-digit exponential encoding of a parameter vector.
pub fn encode_step(values: &[f64]) -> String {
    values
        .iter()
        .map(|&v| format_param(v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_step(text: &str) -> Result<Vec<f64>, FitError> {
    text.split(',')
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| FitError::MalformedState("parameter vector"))
        })
        .collect()
}
