use marten_core::{Error, Handler, Result, TensorView};

// Activation selection
//
// Layers pick their activation by name at construction and re-resolve the
// concrete function pair whenever the handler is rebound. The pair is plain
// function pointers so a resolved layer carries no per-call dispatch beyond
// one indirect call.
//
// `linear` is an identity copy forward and an identity copy of the delta
// backward; it flows through the same code path as the real activations.

/// The closed set of activation functions layers can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    Sigmoid,
    Rel,
    Linear,
}

impl Activation {
    pub fn from_name(layer: &str, name: &str) -> Result<Self> {
        match name {
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "rel" => Ok(Activation::Rel),
            "linear" => Ok(Activation::Linear),
            other => Err(Error::layer(
                layer,
                format!(
                    "unknown activation function '{}', choices are tanh/sigmoid/rel/linear",
                    other
                ),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Rel => "rel",
            Activation::Linear => "linear",
        }
    }
}

/// Forward activation: f(handler, mem, x, y).
pub type ActFn<H> = fn(&H, &mut <H as Handler>::Mem, &TensorView, &TensorView) -> Result<()>;

/// Derivative: df(handler, mem, x, y, dy, dx).
pub type ActDerivFn<H> =
    fn(&H, &mut <H as Handler>::Mem, &TensorView, &TensorView, &TensorView, &TensorView) -> Result<()>;

/// A resolved forward/derivative function pair for one handler type.
pub struct ActFuncs<H: Handler> {
    pub f: ActFn<H>,
    pub df: ActDerivFn<H>,
}

impl<H: Handler> Clone for ActFuncs<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H: Handler> Copy for ActFuncs<H> {}

impl<H: Handler> std::fmt::Debug for ActFuncs<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ActFuncs")
    }
}

fn sigmoid_fwd<H: Handler>(h: &H, mem: &mut H::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
    h.sigmoid(mem, x, y)
}

fn sigmoid_drv<H: Handler>(
    h: &H,
    mem: &mut H::Mem,
    x: &TensorView,
    y: &TensorView,
    dy: &TensorView,
    dx: &TensorView,
) -> Result<()> {
    h.sigmoid_deriv(mem, x, y, dy, dx)
}

fn tanh_fwd<H: Handler>(h: &H, mem: &mut H::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
    h.tanh(mem, x, y)
}

fn tanh_drv<H: Handler>(
    h: &H,
    mem: &mut H::Mem,
    x: &TensorView,
    y: &TensorView,
    dy: &TensorView,
    dx: &TensorView,
) -> Result<()> {
    h.tanh_deriv(mem, x, y, dy, dx)
}

fn rel_fwd<H: Handler>(h: &H, mem: &mut H::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
    h.rel(mem, x, y)
}

fn rel_drv<H: Handler>(
    h: &H,
    mem: &mut H::Mem,
    x: &TensorView,
    y: &TensorView,
    dy: &TensorView,
    dx: &TensorView,
) -> Result<()> {
    h.rel_deriv(mem, x, y, dy, dx)
}

fn linear_fwd<H: Handler>(h: &H, mem: &mut H::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
    h.copy_to(mem, y, x)
}

fn linear_drv<H: Handler>(
    h: &H,
    mem: &mut H::Mem,
    _x: &TensorView,
    _y: &TensorView,
    dy: &TensorView,
    dx: &TensorView,
) -> Result<()> {
    h.copy_to(mem, dx, dy)
}

/// Resolve the function pair for an activation against a handler type.
pub fn resolve<H: Handler>(act: Activation) -> ActFuncs<H> {
    match act {
        Activation::Sigmoid => ActFuncs {
            f: sigmoid_fwd::<H>,
            df: sigmoid_drv::<H>,
        },
        Activation::Tanh => ActFuncs {
            f: tanh_fwd::<H>,
            df: tanh_drv::<H>,
        },
        Activation::Rel => ActFuncs {
            f: rel_fwd::<H>,
            df: rel_drv::<H>,
        },
        Activation::Linear => ActFuncs {
            f: linear_fwd::<H>,
            df: linear_drv::<H>,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::HostHandler;

    #[test]
    fn test_from_name() {
        assert_eq!(Activation::from_name("l", "tanh").unwrap(), Activation::Tanh);
        assert!(Activation::from_name("l", "softplus").is_err());
    }

    #[test]
    fn test_linear_is_identity_copy() {
        let h = HostHandler::seeded(0);
        let funcs = resolve::<HostHandler>(Activation::Linear);
        let mut mem = vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0];
        let x = TensorView::new(0, 3);
        let y = TensorView::new(3, 3);
        (funcs.f)(&h, &mut mem, &x, &y).unwrap();
        assert_eq!(&mem[3..], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_resolved_pair_matches_handler_ops() {
        let h = HostHandler::seeded(0);
        let funcs = resolve::<HostHandler>(Activation::Sigmoid);
        let mut mem = vec![0.0; 4];
        let x = TensorView::new(0, 2);
        let y = TensorView::new(2, 2);
        (funcs.f)(&h, &mut mem, &x, &y).unwrap();
        assert!((mem[2] - 0.5).abs() < 1e-6);
    }
}
