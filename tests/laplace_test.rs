//! Laplace fits of the causal-power model checked against an independent Newton solver, and
//! a degenerate model whose log-density has no maximum.

use burn::tensor::backend::Backend;
use nested_mcmc::approximation::Approximator;
use nested_mcmc::causal::{power_pc, BetaPrior, CausalPowerModel, ContingencyData};
use nested_mcmc::context::{Context, Model};
use nested_mcmc::distributions::{HalfCauchy, Normal};
use nested_mcmc::error::{InferenceError, Result};
use nested_mcmc::laplace::Laplace;
use nested_mcmc::DefaultBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table() -> ContingencyData {
        ContingencyData::new(
            vec![0.0, 1.0, 1.0],
            vec![2.0, 9.0, 6.0],
            vec![10.0, 10.0, 8.0],
        )
        .unwrap()
    }

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Unconstrained log-joint of the causal-power model, up to a constant, and its gradient.
    fn log_joint(z: [f64; 2], a: f64, b: f64, data: &ContingencyData) -> (f64, [f64; 2]) {
        let (wc, wb) = (sigmoid(z[0]), sigmoid(z[1]));
        let mut f = a * wc.ln() + b * (1.0 - wc).ln() + a * wb.ln() + b * (1.0 - wb).ln();
        let mut d_wc = a / wc - b / (1.0 - wc);
        let mut d_wb = a / wb - b / (1.0 - wb);
        for ((&c, &k), &n) in data.cause().iter().zip(data.effect()).zip(data.trials()) {
            let p = power_pc(c, wc, wb);
            f += k * p.ln() + (n - k) * (1.0 - p).ln();
            let d_p = k / p - (n - k) / (1.0 - p);
            d_wc += d_p * c * (1.0 - wb);
            d_wb += d_p * (1.0 - c * wc);
        }
        (f, [d_wc * wc * (1.0 - wc), d_wb * wb * (1.0 - wb)])
    }

    fn hessian(z: [f64; 2], a: f64, b: f64, data: &ContingencyData) -> [[f64; 2]; 2] {
        let h = 1e-6;
        let mut out = [[0.0; 2]; 2];
        for j in 0..2 {
            let mut up = z;
            let mut down = z;
            up[j] += h;
            down[j] -= h;
            let (_, gu) = log_joint(up, a, b, data);
            let (_, gd) = log_joint(down, a, b, data);
            for i in 0..2 {
                out[i][j] = (gu[i] - gd[i]) / (2.0 * h);
            }
        }
        let off = 0.5 * (out[0][1] + out[1][0]);
        out[0][1] = off;
        out[1][0] = off;
        out
    }

    /// Damped Newton ascent from the origin.
    fn newton_mode(a: f64, b: f64, data: &ContingencyData) -> [f64; 2] {
        let mut z = [0.0, 0.0];
        for _ in 0..200 {
            let (f, g) = log_joint(z, a, b, data);
            if g[0].abs().max(g[1].abs()) < 1e-12 {
                break;
            }
            let h = hessian(z, a, b, data);
            let det = h[0][0] * h[1][1] - h[0][1] * h[1][0];
            let mut step = if h[0][0] < 0.0 && det > 0.0 {
                [
                    -(h[1][1] * g[0] - h[0][1] * g[1]) / det,
                    -(h[0][0] * g[1] - h[1][0] * g[0]) / det,
                ]
            } else {
                [0.1 * g[0], 0.1 * g[1]]
            };
            for _ in 0..50 {
                let candidate = [z[0] + step[0], z[1] + step[1]];
                if log_joint(candidate, a, b, data).0 >= f {
                    z = candidate;
                    break;
                }
                step = [0.5 * step[0], 0.5 * step[1]];
            }
        }
        z
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn mode_matches_newton(a in 0.5f64..20.0, b in 0.5f64..20.0) {
            let data = table();
            let fit = Laplace::<DefaultBackend>::default()
                .fit(&CausalPowerModel, &BetaPrior::new(a, b).unwrap(), &data)
                .unwrap();
            let mode = newton_mode(a, b, &data);
            for i in 0..2 {
                prop_assert!(
                    (fit.mean()[i] - mode[i]).abs() < 1e-4,
                    "coordinate {}: laplace {} vs newton {}", i, fit.mean()[i], mode[i]
                );
            }
        }
    }

    #[test]
    fn covariance_is_inverse_curvature() {
        let data = table();
        let (a, b) = (2.0, 5.0);
        let fit = Laplace::<DefaultBackend>::default()
            .fit(&CausalPowerModel, &BetaPrior::new(a, b).unwrap(), &data)
            .unwrap();
        let h = hessian(newton_mode(a, b, &data), a, b, &data);
        let det = h[0][0] * h[1][1] - h[0][1] * h[1][0];
        let expected = [[-h[1][1] / det, h[0][1] / det], [h[1][0] / det, -h[0][0] / det]];
        let cov = fit.covariance();
        for i in 0..2 {
            for j in 0..2 {
                let rel = (cov[(i, j)] - expected[i][j]).abs() / expected[i][i].abs();
                assert!(rel < 1e-3, "cov[{i}][{j}] = {} vs {}", cov[(i, j)], expected[i][j]);
            }
        }
    }

    /// Identical observations with a free scale: the log-density grows without bound as the
    /// scale shrinks towards zero at `mu = y`.
    struct ZeroSpread;

    impl Model for ZeroSpread {
        type Params = ();
        type Data = Vec<f64>;

        fn run<B: Backend>(&self, _: &(), ys: &Vec<f64>, ctx: &mut Context<B>) -> Result<()> {
            let n = ys.len();
            let mu = ctx.sample("mu", &Normal::new(0.0, 10.0)?, None)?;
            let sigma = ctx.sample("sigma", &HalfCauchy::new(1.0)?, None)?;
            let resid = (ctx.constant(ys) - mu.expand([n])) / sigma.clone().expand([n]);
            ctx.factor(
                "y",
                resid.powi_scalar(2).mul_scalar(-0.5) - sigma.log().expand([n]),
            )
        }
    }

    #[test]
    fn degenerate_posterior_does_not_converge() {
        let err = Laplace::<DefaultBackend>::new(300, 1e-8)
            .fit(&ZeroSpread, &(), &vec![1.0; 10])
            .unwrap_err();
        assert!(
            matches!(err, InferenceError::NonConvergence { .. }),
            "unexpected error: {err}"
        );
        assert!(err.is_recoverable());
    }
}
