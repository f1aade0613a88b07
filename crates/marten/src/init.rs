use marten_core::{Error, HostArray, RandomState, Result, Shape};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

// Initializers — closed, serializable descriptions of parameter filling
//
// An initializer is evaluated per parameter buffer into a host array which
// is then pushed through the handler's interop boundary. Evaluation is
// seeded per buffer so a network initialization is reproducible end-to-end.
//
// `Array` must match the buffer shape exactly; when it does not and a
// fallback is supplied, the fallback is evaluated instead; that is the only
// fallback trigger, since the other initializers accept any shape.

/// How to fill one parameter buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Initializer {
    Gaussian { mean: f64, std: f64 },
    Uniform { low: f64, high: f64 },
    Constant { value: f64 },
    Array { value: HostArray },
}

impl Initializer {
    pub fn gaussian(std: f64) -> Self {
        Initializer::Gaussian { mean: 0.0, std }
    }

    pub fn uniform(low: f64, high: f64) -> Self {
        Initializer::Uniform { low, high }
    }

    pub fn constant(value: f64) -> Self {
        Initializer::Constant { value }
    }

    pub fn array(value: HostArray) -> Self {
        Initializer::Array { value }
    }

    /// Produce a host array of exactly `shape`.
    pub fn evaluate(
        &self,
        shape: &Shape,
        fallback: Option<&Initializer>,
        seed: u64,
    ) -> Result<HostArray> {
        match self.try_evaluate(shape, seed) {
            Ok(arr) => Ok(arr),
            Err(err) => match fallback {
                Some(fb) => fb.evaluate(shape, None, seed),
                None => Err(err),
            },
        }
    }

    fn try_evaluate(&self, shape: &Shape, seed: u64) -> Result<HostArray> {
        match self {
            Initializer::Gaussian { mean, std } => {
                let mut rnd = RandomState::new(seed);
                let data = (0..shape.elem_count())
                    .map(|_| {
                        let draw: f64 = rnd.rng().sample(StandardNormal);
                        mean + std * draw
                    })
                    .collect();
                HostArray::new(shape.clone(), data)
            }
            Initializer::Uniform { low, high } => {
                let mut rnd = RandomState::new(seed);
                let data = (0..shape.elem_count())
                    .map(|_| rnd.rng().gen_range(*low..*high))
                    .collect();
                HostArray::new(shape.clone(), data)
            }
            Initializer::Constant { value } => Ok(HostArray::full(shape.clone(), *value)),
            Initializer::Array { value } => {
                if value.dims() != shape.dims() {
                    return Err(Error::network(format!(
                        "array initializer shape {} does not match parameter shape {}",
                        value.shape(),
                        shape
                    )));
                }
                Ok(value.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let arr = Initializer::constant(2.5)
            .evaluate(&Shape::from((2, 3)), None, 0)
            .unwrap();
        assert_eq!(arr.dims(), &[2, 3]);
        assert!(arr.data().iter().all(|&x| x == 2.5));
    }

    #[test]
    fn test_gaussian_seeded_reproducible() {
        let shape = Shape::from((4, 4));
        let a = Initializer::gaussian(0.1).evaluate(&shape, None, 7).unwrap();
        let b = Initializer::gaussian(0.1).evaluate(&shape, None, 7).unwrap();
        let c = Initializer::gaussian(0.1).evaluate(&shape, None, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_uniform_bounds() {
        let arr = Initializer::uniform(-0.5, 0.5)
            .evaluate(&Shape::from(1000), None, 3)
            .unwrap();
        assert!(arr.data().iter().all(|&x| (-0.5..0.5).contains(&x)));
    }

    #[test]
    fn test_array_shape_mismatch_uses_fallback() {
        let wrong = HostArray::zeros((2, 2));
        let init = Initializer::array(wrong);
        let shape = Shape::from((3, 3));
        assert!(init.evaluate(&shape, None, 0).is_err());
        let arr = init
            .evaluate(&shape, Some(&Initializer::constant(1.0)), 0)
            .unwrap();
        assert_eq!(arr.dims(), &[3, 3]);
        assert!(arr.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_serde_roundtrip() {
        let init = Initializer::gaussian(0.25);
        let json = serde_json::to_string(&init).unwrap();
        let back: Initializer = serde_json::from_str(&json).unwrap();
        assert_eq!(init, back);
    }
}
