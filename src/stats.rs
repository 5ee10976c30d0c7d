//! Convergence diagnostics over chains x draws arrays: split R-hat, effective sample size and
//! quantiles.
//!
//! The estimators follow the multi-chain definitions of Stan: chains are split in half before
//! comparing them, autocovariances come from an FFT, and the autocorrelation sum is truncated
//! with Geyer's initial monotone sequence.

use ndarray::prelude::*;
use num_traits::Float;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Split every chain into its first and second half (dropping the middle draw of an odd-length
/// chain). Rows are chains, columns draws.
pub fn split_chains(draws: ArrayView2<f64>) -> Array2<f64> {
    let (m, n) = draws.dim();
    let half = n / 2;
    let mut out = Array2::zeros((2 * m, half));
    for (c, chain) in draws.outer_iter().enumerate() {
        out.row_mut(2 * c).assign(&chain.slice(s![..half]));
        out.row_mut(2 * c + 1).assign(&chain.slice(s![n - half..]));
    }
    out
}

/// Gelman-Rubin potential scale reduction of the given chains. `NaN` when fewer than two
/// chains or two draws are available, or when the chains are constant.
pub fn rhat(chains: ArrayView2<f64>) -> f64 {
    let (m, n) = chains.dim();
    if m < 2 || n < 2 {
        return f64::NAN;
    }
    let nf = n as f64;
    let means = chains.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(m));
    let within = chains
        .outer_iter()
        .zip(means.iter())
        .map(|(chain, mean)| chain.mapv(|x| (x - mean).powi(2)).sum() / (nf - 1.0))
        .sum::<f64>()
        / m as f64;
    let grand = means.mean().unwrap_or(0.0);
    let between = nf * means.mapv(|x| (x - grand).powi(2)).sum() / (m as f64 - 1.0);
    if within <= 0.0 {
        return f64::NAN;
    }
    let var_plus = within * (nf - 1.0) / nf + between / nf;
    (var_plus / within).sqrt()
}

/// R-hat on split chains; with a single chain this compares its two halves.
pub fn split_rhat(draws: ArrayView2<f64>) -> f64 {
    rhat(split_chains(draws).view())
}

/// Biased autocovariance `1/n Σ_t (x_t - x̄)(x_{t+k} - x̄)` for every lag, via FFT.
pub fn autocovariance(x: &[f64]) -> Vec<f64> {
    let n = x.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = x.iter().sum::<f64>() / n as f64;
    let len = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(len)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(len).process(&mut buf);
    buf.iter_mut()
        .for_each(|c| *c = Complex::new(c.norm_sqr(), 0.0));
    planner.plan_fft_inverse(len).process(&mut buf);

    let norm = len as f64 * n as f64;
    buf[..n].iter().map(|c| c.re / norm).collect()
}

/// Effective sample size of the given chains (no splitting).
pub fn ess_chains(chains: ArrayView2<f64>) -> f64 {
    let (m, n) = chains.dim();
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let nf = n as f64;
    let acov: Vec<Vec<f64>> = chains
        .outer_iter()
        .map(|c| autocovariance(&c.to_vec()))
        .collect();
    let means = chains.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(m));
    let mean_var = acov.iter().map(|a| a[0]).sum::<f64>() / m as f64 * nf / (nf - 1.0);
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        let grand = means.mean().unwrap_or(0.0);
        var_plus += means.mapv(|x| (x - grand).powi(2)).sum() / (m as f64 - 1.0);
    }
    if var_plus <= 0.0 || !var_plus.is_finite() {
        return f64::NAN;
    }

    let mean_acov = |lag: usize| acov.iter().map(|a| a[lag]).sum::<f64>() / m as f64;
    let rho = |lag: usize| 1.0 - (mean_var - mean_acov(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n + 1];
    rho_hat[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[1] = rho_odd;

    // Geyer's initial positive sequence over pairs of lags.
    let mut t = 1;
    while t + 5 < n && rho_even + rho_odd > 0.0 {
        rho_even = rho(t + 1);
        rho_odd = rho(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1;
    while t + 3 <= max_t {
        let prev = rho_hat[t - 1] + rho_hat[t];
        if rho_hat[t + 1] + rho_hat[t + 2] > prev {
            rho_hat[t + 1] = prev / 2.0;
            rho_hat[t + 2] = rho_hat[t + 1];
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    total / tau.max(1.0 / total.log10())
}

/// Effective sample size on split chains.
pub fn ess(draws: ArrayView2<f64>) -> f64 {
    ess_chains(split_chains(draws).view())
}

/// Linearly interpolated quantile (type 7) of ascending `sorted` values.
pub fn quantile<T: Float>(sorted: &[T], q: T) -> T {
    match sorted.len() {
        0 => T::nan(),
        1 => sorted[0],
        n => {
            let h = T::from(n - 1).unwrap_or_else(T::zero) * q.max(T::zero()).min(T::one());
            let lo = h.floor();
            let i = lo.to_usize().unwrap_or(0).min(n - 2);
            let frac = h - T::from(i).unwrap_or(lo);
            sorted[i] + frac * (sorted[i + 1] - sorted[i])
        }
    }
}

/// Ascending copy, NaNs last.
pub fn sorted<T: Float>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut v: Vec<T> = values.into_iter().collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Greater));
    v
}
