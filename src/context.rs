/*!
Model execution context.

A [`Model`] is an ordinary Rust type whose [`Model::run`] declares random variables against a
[`Context`]. The context is created fresh for one execution and consumed by
[`Context::finish`]; there is no process-wide trace or handler stack.

A context runs in one of two modes:

- **prior**: latent variables are drawn from their priors with an explicit [`SmallRng`]
  stream, unobserved discrete variables are drawn too (prior predictive). Used to discover the
  parameter layout, to simulate data, and to pick initial points.
- **substitute**: latent variables are read, in declaration order, from an unconstrained
  position tensor. Each is mapped through the transform of its support and the log-joint picks
  up the log-Jacobian. Used by every density evaluation.

# Examples

```rust
use burn::backend::NdArray;
use burn::tensor::backend::Backend;
use nested_mcmc::context::{Context, Model};
use nested_mcmc::distributions::{Beta, Binomial};
use nested_mcmc::error::Result;
use rand::{rngs::SmallRng, SeedableRng};

struct Coin;

impl Model for Coin {
    type Params = ();
    type Data = Vec<f64>;

    fn run<B: Backend>(&self, _: &(), flips: &Vec<f64>, ctx: &mut Context<B>) -> Result<()> {
        let theta = ctx.sample("theta", &Beta::new(1.0, 1.0)?, None)?;
        ctx.plate("flips", flips.len(), |ctx| {
            let p = theta.clone().expand([flips.len()]);
            let ones = vec![1.0; flips.len()];
            ctx.sample("heads", &Binomial::new(&ones, p)?, Some(flips.as_slice()))?;
            Ok(())
        })
    }
}

let mut ctx = Context::<NdArray<f64>>::prior(SmallRng::seed_from_u64(3));
Coin.run(&(), &vec![1.0, 0.0, 1.0], &mut ctx).unwrap();
let execution = ctx.finish().unwrap();
assert_eq!(execution.layout.dim(), 1);
assert_eq!(execution.trace.len(), 2);
```
*/

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::SmallRng;
use std::collections::HashMap;

use crate::distributions::Distribution;
use crate::error::{InferenceError, Result};
use crate::host;
use crate::transforms::{Support, Transform};

/// A parametric probabilistic model.
///
/// `run` must declare the same latent variables, in the same order and with the same lengths,
/// every time it is called with the same parameters and data. Its only source of randomness is
/// the context.
pub trait Model: Sync {
    /// Hyperparameters the model is conditioned on.
    type Params: Sync;
    /// Read-only observed data.
    type Data: Sync;

    fn run<B: Backend>(
        &self,
        params: &Self::Params,
        data: &Self::Data,
        ctx: &mut Context<B>,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Latent,
    Observed,
    Factor,
}

/// One recorded variable of an execution.
#[derive(Debug, Clone)]
pub struct Site<B: Backend> {
    pub name: String,
    pub kind: SiteKind,
    /// Constrained value (the log-weight for factors).
    pub value: Tensor<B, 1>,
    /// Summed log-density contributed by the site, including any log-Jacobian.
    pub log_prob: f64,
    pub support: Support,
    pub plate: Option<String>,
}

/// Ordered record of every variable declared in one execution.
#[derive(Debug, Clone)]
pub struct Trace<B: Backend> {
    sites: Vec<Site<B>>,
    index: HashMap<String, usize>,
}

impl<B: Backend> Default for Trace<B> {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<B: Backend> Trace<B> {
    fn push(&mut self, site: Site<B>) -> Result<()> {
        if self.index.contains_key(&site.name) {
            return Err(InferenceError::malformed(format!(
                "variable `{}` declared twice",
                site.name
            )));
        }
        self.index.insert(site.name.clone(), self.sites.len());
        self.sites.push(site);
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Site<B>> {
        self.index.get(name).map(|&i| &self.sites[i])
    }

    /// Host copy of a site's value.
    pub fn value(&self, name: &str) -> Result<Vec<f64>> {
        let site = self
            .get(name)
            .ok_or_else(|| InferenceError::malformed(format!("no variable named `{name}`")))?;
        host::to_vec(site.value.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Site<B>> {
        self.sites.iter()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn log_joint(&self) -> f64 {
        self.sites.iter().map(|s| s.log_prob).sum()
    }
}

/// Where one latent variable lives in the unconstrained position vector.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentSlot {
    pub name: String,
    pub offset: usize,
    pub len: usize,
    pub transform: Transform,
}

/// Layout of all latent variables of a model, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamLayout {
    slots: Vec<LatentSlot>,
}

impl ParamLayout {
    pub(crate) fn push(&mut self, name: &str, len: usize, transform: Transform) -> usize {
        let offset = self.dim();
        self.slots.push(LatentSlot {
            name: name.to_string(),
            offset,
            len,
            transform,
        });
        offset
    }

    pub fn dim(&self) -> usize {
        self.slots.last().map_or(0, |s| s.offset + s.len)
    }

    pub fn slots(&self) -> &[LatentSlot] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&LatentSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// One name per scalar coordinate: `wc` for scalars, `theta[0]`, `theta[1]`, ... otherwise.
    pub fn coordinate_names(&self) -> Vec<String> {
        self.slots
            .iter()
            .flat_map(|s| {
                (0..s.len).map(move |i| {
                    if s.len == 1 {
                        s.name.clone()
                    } else {
                        format!("{}[{i}]", s.name)
                    }
                })
            })
            .collect()
    }

    /// Transform of every scalar coordinate.
    pub fn transforms(&self) -> Vec<Transform> {
        self.slots
            .iter()
            .flat_map(|s| std::iter::repeat(s.transform).take(s.len))
            .collect()
    }

    pub fn constrain(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.transforms())
            .map(|(&z, t)| t.constrain(z))
            .collect()
    }

    pub fn unconstrain(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.dim() {
            return Err(InferenceError::malformed(format!(
                "expected {} constrained values, got {}",
                self.dim(),
                x.len()
            )));
        }
        let names = self.coordinate_names();
        x.iter()
            .zip(self.transforms())
            .zip(&names)
            .map(|((&x, t), name)| {
                t.unconstrain(x).ok_or_else(|| {
                    InferenceError::domain(name, format!("{x} is outside the support"))
                })
            })
            .collect()
    }

    /// Summed `ln |dx/dz|` at `z`.
    pub fn log_abs_det_jacobian(&self, z: &[f64]) -> f64 {
        z.iter()
            .zip(self.transforms())
            .map(|(&z, t)| t.log_abs_det_jacobian(z))
            .sum()
    }
}

enum Mode<B: Backend> {
    Prior { rng: SmallRng },
    Substitute { position: Tensor<B, 1> },
}

struct PlateFrame {
    name: String,
    size: usize,
}

/// Builder for one model execution.
pub struct Context<B: Backend> {
    mode: Mode<B>,
    device: B::Device,
    trace: Trace<B>,
    layout: ParamLayout,
    log_joint: Option<Tensor<B, 1>>,
    plate: Option<PlateFrame>,
}

/// Everything one execution produced.
#[derive(Debug, Clone)]
pub struct Execution<B: Backend> {
    /// Log-joint density, shape `[1]`. In substitute mode it is a function of the position
    /// tensor, so it can be differentiated.
    pub log_joint: Tensor<B, 1>,
    pub trace: Trace<B>,
    pub layout: ParamLayout,
}

impl<B: Backend> Context<B> {
    fn with_mode(mode: Mode<B>, device: B::Device) -> Self {
        Self {
            mode,
            device,
            trace: Trace::default(),
            layout: ParamLayout::default(),
            log_joint: None,
            plate: None,
        }
    }

    /// Execute against the prior, drawing latent values from `rng`.
    pub fn prior(rng: SmallRng) -> Self {
        Self::with_mode(Mode::Prior { rng }, B::Device::default())
    }

    /// Execute at an unconstrained position of shape `[dim]`.
    pub fn substitute(position: Tensor<B, 1>) -> Self {
        let device = position.device();
        Self::with_mode(Mode::Substitute { position }, device)
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// A constant tensor on this context's device.
    pub fn constant(&self, values: &[f64]) -> Tensor<B, 1> {
        host::tensor::<B>(values, &self.device)
    }

    /// Declare a random variable.
    ///
    /// With `observed`, the distribution's log-density at the observed values is added to the
    /// log-joint and the site is recorded as observed. Without, the variable is latent: drawn
    /// from the prior or read from the position, depending on the mode. Returns the
    /// constrained value.
    pub fn sample<D: Distribution<B>>(
        &mut self,
        name: &str,
        dist: &D,
        observed: Option<&[f64]>,
    ) -> Result<Tensor<B, 1>> {
        if self.trace.contains(name) {
            return Err(InferenceError::malformed(format!(
                "variable `{name}` declared twice"
            )));
        }
        let len = dist.batch_len();
        self.check_plate(name, len)?;
        let support = dist.support();

        if let Some(values) = observed {
            if values.len() != len {
                return Err(InferenceError::malformed(format!(
                    "`{name}` expects {len} observed values, got {}",
                    values.len()
                )));
            }
            if let Some(bad) = values.iter().find(|v| !support.contains(**v)) {
                return Err(InferenceError::malformed(format!(
                    "observed value {bad} of `{name}` is outside its support"
                )));
            }
            let value = self.constant(values);
            let lp = dist.log_prob(value.clone())?.sum();
            return self.record(name, SiteKind::Observed, value, lp, support);
        }

        let (value, lp) = match &mut self.mode {
            Mode::Prior { rng } => {
                let draw = dist.sample(rng)?;
                let value = host::tensor::<B>(&draw, &self.device);
                if let Some(transform) = Transform::for_support(support) {
                    self.layout.push(name, len, transform);
                }
                let lp = dist.log_prob(value.clone())?.sum();
                (value, lp)
            }
            Mode::Substitute { position } => {
                let transform = Transform::for_support(support).ok_or_else(|| {
                    InferenceError::malformed(format!(
                        "`{name}` has discrete support and cannot be latent"
                    ))
                })?;
                let offset = self.layout.push(name, len, transform);
                let [dim] = position.dims();
                if offset + len > dim {
                    return Err(InferenceError::malformed(format!(
                        "model declares more than the {dim} unconstrained values supplied"
                    )));
                }
                let z = position.clone().slice([offset..offset + len]);
                let value = transform.constrain_tensor(z.clone());
                let lp = dist.log_prob(value.clone())?.sum()
                    + transform.log_abs_det_jacobian_tensor(z).sum();
                (value, lp)
            }
        };
        self.record(name, SiteKind::Latent, value, lp, support)
    }

    /// Shorthand for [`Context::sample`] with observed values.
    pub fn observe<D: Distribution<B>>(
        &mut self,
        name: &str,
        dist: &D,
        values: &[f64],
    ) -> Result<Tensor<B, 1>> {
        self.sample(name, dist, Some(values))
    }

    /// Add an arbitrary log-weight (shape `[n]`, summed) to the log-joint.
    pub fn factor(&mut self, name: &str, log_weight: Tensor<B, 1>) -> Result<()> {
        let [len] = log_weight.dims();
        self.check_plate(name, len)?;
        let lp = log_weight.clone().sum();
        self.record(name, SiteKind::Factor, log_weight, lp, Support::Real)?;
        Ok(())
    }

    /// Run `body` inside a plate of `size` conditionally independent elements. Every site
    /// declared inside must have batch length `size`; its log-density is summed over the
    /// elements.
    pub fn plate<T>(
        &mut self,
        name: &str,
        size: usize,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if self.plate.is_some() {
            return Err(InferenceError::malformed(format!(
                "plate `{name}` is nested inside another plate"
            )));
        }
        self.plate = Some(PlateFrame {
            name: name.to_string(),
            size,
        });
        let out = body(self);
        self.plate = None;
        out
    }

    fn check_plate(&self, name: &str, len: usize) -> Result<()> {
        match &self.plate {
            Some(plate) if plate.size != len => Err(InferenceError::malformed(format!(
                "`{name}` has batch length {len} inside plate `{}` of size {}",
                plate.name, plate.size
            ))),
            _ => Ok(()),
        }
    }

    fn record(
        &mut self,
        name: &str,
        kind: SiteKind,
        value: Tensor<B, 1>,
        lp: Tensor<B, 1>,
        support: Support,
    ) -> Result<Tensor<B, 1>> {
        let lp_host = host::scalar(lp.clone());
        if !lp_host.is_finite() {
            return Err(InferenceError::domain(
                name,
                format!("log-density is {lp_host}"),
            ));
        }
        self.trace.push(Site {
            name: name.to_string(),
            kind,
            value: value.clone(),
            log_prob: lp_host,
            support,
            plate: self.plate.as_ref().map(|p| p.name.clone()),
        })?;
        self.log_joint = Some(match self.log_joint.take() {
            Some(acc) => acc + lp,
            None => lp,
        });
        Ok(value)
    }

    /// Close the execution.
    pub fn finish(self) -> Result<Execution<B>> {
        if let Mode::Substitute { position } = &self.mode {
            let [dim] = position.dims();
            if dim != self.layout.dim() {
                return Err(InferenceError::malformed(format!(
                    "position has {dim} values but the model declares {}",
                    self.layout.dim()
                )));
            }
        }
        let log_joint = match self.log_joint {
            Some(lp) => lp,
            None => Tensor::<B, 1>::zeros([1], &self.device),
        };
        Ok(Execution {
            log_joint,
            trace: self.trace,
            layout: self.layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{Beta, Binomial, Normal};
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use rand::SeedableRng;

    type Nd = NdArray<f64>;

    /// theta ~ Beta(2, 2); counts ~ Binomial(trials, theta) in a plate.
    struct Rate;

    impl Model for Rate {
        type Params = (f64, f64);
        type Data = (Vec<f64>, Vec<f64>);

        fn run<B: Backend>(
            &self,
            &(a, b): &(f64, f64),
            (counts, trials): &(Vec<f64>, Vec<f64>),
            ctx: &mut Context<B>,
        ) -> Result<()> {
            let theta = ctx.sample("theta", &Beta::new(a, b)?, None)?;
            ctx.plate("rows", counts.len(), |ctx| {
                let p = theta.clone().expand([counts.len()]);
                ctx.observe("counts", &Binomial::new(trials, p)?, counts)?;
                Ok(())
            })
        }
    }

    fn data() -> (Vec<f64>, Vec<f64>) {
        (vec![3.0, 6.0], vec![10.0, 10.0])
    }

    #[test]
    fn prior_mode_is_deterministic_per_stream() {
        let run = |seed| {
            let mut ctx = Context::<Nd>::prior(SmallRng::seed_from_u64(seed));
            Rate.run(&(2.0, 2.0), &data(), &mut ctx).unwrap();
            ctx.finish().unwrap()
        };
        let (a, b, c) = (run(7), run(7), run(8));
        assert_eq!(a.trace.value("theta").unwrap(), b.trace.value("theta").unwrap());
        assert_ne!(a.trace.value("theta").unwrap(), c.trace.value("theta").unwrap());
        assert_eq!(a.layout.coordinate_names(), vec!["theta".to_string()]);
        assert_eq!(a.trace.get("counts").unwrap().kind, SiteKind::Observed);
        assert_eq!(a.trace.get("counts").unwrap().plate.as_deref(), Some("rows"));
    }

    #[test]
    fn substitute_mode_adds_jacobian_and_plate_sum() {
        let z = 0.4f64;
        let mut ctx = Context::<Nd>::substitute(host::tensor::<Nd>(&[z], &Default::default()));
        Rate.run(&(2.0, 2.0), &data(), &mut ctx).unwrap();
        let exec = ctx.finish().unwrap();

        let theta = crate::math::expit(z);
        let beta = Beta::new(2.0, 2.0).unwrap();
        let expected = beta.ln_pdf(theta)
            + Transform::Logit.log_abs_det_jacobian(z)
            + crate::math::ln_choose(10.0, 3.0)
            + 3.0 * theta.ln()
            + 7.0 * (1.0 - theta).ln()
            + crate::math::ln_choose(10.0, 6.0)
            + 6.0 * theta.ln()
            + 4.0 * (1.0 - theta).ln();
        assert_abs_diff_eq!(host::scalar(exec.log_joint), expected, epsilon = 1e-10);
        assert_abs_diff_eq!(exec.trace.log_joint(), expected, epsilon = 1e-10);
    }

    #[test]
    fn duplicate_names_are_malformed() {
        struct Twice;
        impl Model for Twice {
            type Params = ();
            type Data = ();
            fn run<B: Backend>(&self, _: &(), _: &(), ctx: &mut Context<B>) -> Result<()> {
                ctx.sample("x", &Normal::new(0.0, 1.0)?, None)?;
                ctx.sample("x", &Normal::new(0.0, 1.0)?, None)?;
                Ok(())
            }
        }
        let mut ctx = Context::<Nd>::prior(SmallRng::seed_from_u64(0));
        let err = Twice.run(&(), &(), &mut ctx).unwrap_err();
        assert!(matches!(err, InferenceError::MalformedModel(_)));
    }

    #[test]
    fn plate_shape_mismatch_is_malformed() {
        struct Mismatch;
        impl Model for Mismatch {
            type Params = ();
            type Data = Vec<f64>;
            fn run<B: Backend>(&self, _: &(), ys: &Vec<f64>, ctx: &mut Context<B>) -> Result<()> {
                ctx.plate("obs", ys.len() + 1, |ctx| {
                    let normal = Normal::new(0.0, 1.0)?.expand(ys.len());
                    ctx.observe("y", &normal, ys)?;
                    Ok(())
                })
            }
        }
        let mut ctx = Context::<Nd>::prior(SmallRng::seed_from_u64(0));
        let err = Mismatch.run(&(), &vec![0.1, 0.2], &mut ctx).unwrap_err();
        assert!(matches!(err, InferenceError::MalformedModel(_)));
    }

    #[test]
    fn position_length_must_match_layout() {
        let position = host::tensor::<Nd>(&[0.1, 0.2], &Default::default());
        let mut ctx = Context::<Nd>::substitute(position);
        Rate.run(&(2.0, 2.0), &data(), &mut ctx).unwrap();
        assert!(matches!(
            ctx.finish(),
            Err(InferenceError::MalformedModel(_))
        ));
    }

    #[test]
    fn layout_round_trip() {
        let mut layout = ParamLayout::default();
        layout.push("p", 2, Transform::Logit);
        layout.push("s", 1, Transform::Log);
        assert_eq!(layout.dim(), 3);
        assert_eq!(layout.coordinate_names(), vec!["p[0]", "p[1]", "s"]);
        let x = vec![0.3, 0.8, 2.5];
        let z = layout.unconstrain(&x).unwrap();
        for (a, b) in layout.constrain(&z).iter().zip(&x) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert!(layout.unconstrain(&[0.3, 1.0, 2.5]).is_err());
    }
}
