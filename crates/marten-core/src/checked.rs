use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::host_array::HostArray;
use crate::shape::Shape;
use crate::view::TensorView;

// CheckedHandler — conformance-checking wrapper
//
// The production backends assume pre-validated shapes and perform no checks
// of their own. This wrapper asserts every shape/rank contract of the
// Handler interface and reports a ShapeMismatch error before delegating to
// the wrapped backend. Intended for tests and for diagnosing a misbehaving
// layer; not for the training hot path.

/// Wraps any backend with per-operation shape validation.
#[derive(Debug, Clone)]
pub struct CheckedHandler<H: Handler> {
    inner: H,
}

impl<H: Handler> CheckedHandler<H> {
    pub fn new(inner: H) -> Self {
        CheckedHandler { inner }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

fn same_shape(op: &'static str, expected: &TensorView, got: &TensorView) -> Result<()> {
    if expected.shape() != got.shape() {
        return Err(Error::ShapeMismatch {
            op,
            expected: expected.shape().clone(),
            got: got.shape().clone(),
        });
    }
    Ok(())
}

fn rank(op: &'static str, v: &TensorView, expected: usize) -> Result<()> {
    if v.rank() != expected {
        return Err(Error::RankMismatch {
            op,
            expected,
            got: v.rank(),
        });
    }
    Ok(())
}

/// v must be (1, N), (M, 1), or a plain (N,) row against an (M, N) matrix.
fn broadcast_vector(op: &'static str, m: &TensorView, v: &TensorView) -> Result<()> {
    rank(op, m, 2)?;
    let (rows, cols) = (m.dims()[0], m.dims()[1]);
    let ok = match v.dims() {
        [n] => *n == cols,
        [1, n] => *n == cols,
        [r, 1] => *r == rows,
        _ => false,
    };
    if !ok {
        return Err(Error::ShapeMismatch {
            op,
            expected: Shape::from((1, cols)),
            got: v.shape().clone(),
        });
    }
    Ok(())
}

fn matmul_dims(
    op: &'static str,
    a: &TensorView,
    b: &TensorView,
    out: &TensorView,
    transa: bool,
    transb: bool,
) -> Result<()> {
    rank(op, a, 2)?;
    rank(op, b, 2)?;
    rank(op, out, 2)?;
    let (ar, ac) = (a.dims()[0], a.dims()[1]);
    let (br, bc) = (b.dims()[0], b.dims()[1]);
    let (m, k) = if transa { (ac, ar) } else { (ar, ac) };
    let (k2, n) = if transb { (bc, br) } else { (br, bc) };
    if k != k2 {
        return Err(Error::ShapeMismatch {
            op,
            expected: Shape::from((k, n)),
            got: Shape::from((k2, n)),
        });
    }
    if out.dims() != [m, n] {
        return Err(Error::ShapeMismatch {
            op,
            expected: Shape::from((m, n)),
            got: out.shape().clone(),
        });
    }
    Ok(())
}

fn pool_out_dims(
    op: &'static str,
    inputs: &TensorView,
    out: &TensorView,
    window: (usize, usize),
    padding: usize,
    stride: (usize, usize),
) -> Result<()> {
    rank(op, inputs, 4)?;
    rank(op, out, 4)?;
    let id = inputs.dims();
    let oh = (id[2] + 2 * padding - window.0) / stride.0 + 1;
    let ow = (id[3] + 2 * padding - window.1) / stride.1 + 1;
    let expected = Shape::from((id[0], id[1], oh, ow));
    if out.dims() != expected.dims() {
        return Err(Error::ShapeMismatch {
            op,
            expected,
            got: out.shape().clone(),
        });
    }
    Ok(())
}

impl<H: Handler> Handler for CheckedHandler<H> {
    type Mem = H::Mem;

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn allocate(&self, size: usize) -> Result<Self::Mem> {
        self.inner.allocate(size)
    }

    fn zeros(&self, size: usize) -> Result<Self::Mem> {
        self.inner.zeros(size)
    }

    fn ones(&self, size: usize) -> Result<Self::Mem> {
        self.inner.ones(size)
    }

    fn copy_to(&self, mem: &mut Self::Mem, dest: &TensorView, src: &TensorView) -> Result<()> {
        same_shape("copy_to", dest, src)?;
        self.inner.copy_to(mem, dest, src)
    }

    fn fill(&self, mem: &mut Self::Mem, dest: &TensorView, val: f64) -> Result<()> {
        self.inner.fill(mem, dest, val)
    }

    fn create_from_host(&self, arr: &HostArray) -> Result<Self::Mem> {
        self.inner.create_from_host(arr)
    }

    fn get_host_copy(&self, mem: &Self::Mem, src: &TensorView) -> Result<HostArray> {
        self.inner.get_host_copy(mem, src)
    }

    fn set_from_host(
        &self,
        mem: &mut Self::Mem,
        dest: &TensorView,
        arr: &HostArray,
    ) -> Result<()> {
        if dest.shape() != &arr.shape() {
            return Err(Error::ShapeMismatch {
                op: "set_from_host",
                expected: dest.shape().clone(),
                got: arr.shape(),
            });
        }
        self.inner.set_from_host(mem, dest, arr)
    }

    fn is_fully_finite(&self, mem: &Self::Mem, a: &TensorView) -> Result<bool> {
        self.inner.is_fully_finite(mem, a)
    }

    fn add_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        broadcast_vector("add_mv", m, v)?;
        same_shape("add_mv", m, out)?;
        self.inner.add_mv(mem, m, v, out)
    }

    fn subtract_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        broadcast_vector("subtract_mv", m, v)?;
        same_shape("subtract_mv", m, out)?;
        self.inner.subtract_mv(mem, m, v, out)
    }

    fn mult_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        broadcast_vector("mult_mv", m, v)?;
        same_shape("mult_mv", m, out)?;
        self.inner.mult_mv(mem, m, v, out)
    }

    fn divide_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        broadcast_vector("divide_mv", m, v)?;
        same_shape("divide_mv", m, out)?;
        self.inner.divide_mv(mem, m, v, out)
    }

    fn add_st(&self, mem: &mut Self::Mem, s: f64, t: &TensorView, out: &TensorView) -> Result<()> {
        same_shape("add_st", t, out)?;
        self.inner.add_st(mem, s, t, out)
    }

    fn mult_st(
        &self,
        mem: &mut Self::Mem,
        s: f64,
        t: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("mult_st", t, out)?;
        self.inner.mult_st(mem, s, t, out)
    }

    fn mult_add_st(
        &self,
        mem: &mut Self::Mem,
        s: f64,
        t: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("mult_add_st", t, out)?;
        self.inner.mult_add_st(mem, s, t, out)
    }

    fn add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("add_tt", a, b)?;
        same_shape("add_tt", a, out)?;
        self.inner.add_tt(mem, a, b, out)
    }

    fn subtract_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("subtract_tt", a, b)?;
        same_shape("subtract_tt", a, out)?;
        self.inner.subtract_tt(mem, a, b, out)
    }

    fn mult_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("mult_tt", a, b)?;
        same_shape("mult_tt", a, out)?;
        self.inner.mult_tt(mem, a, b, out)
    }

    fn divide_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("divide_tt", a, b)?;
        same_shape("divide_tt", a, out)?;
        self.inner.divide_tt(mem, a, b, out)
    }

    fn mult_add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("mult_add_tt", a, b)?;
        same_shape("mult_add_tt", a, out)?;
        self.inner.mult_add_tt(mem, a, b, out)
    }

    fn dot_mm(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        transa: bool,
        transb: bool,
    ) -> Result<()> {
        matmul_dims("dot_mm", a, b, out, transa, transb)?;
        self.inner.dot_mm(mem, a, b, out, transa, transb)
    }

    fn dot_add_mm(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        transa: bool,
        transb: bool,
    ) -> Result<()> {
        matmul_dims("dot_add_mm", a, b, out, transa, transb)?;
        self.inner.dot_add_mm(mem, a, b, out, transa, transb)
    }

    fn log_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        same_shape("log_t", a, out)?;
        self.inner.log_t(mem, a, out)
    }

    fn sqrt_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        same_shape("sqrt_t", a, out)?;
        self.inner.sqrt_t(mem, a, out)
    }

    fn sign_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        same_shape("sign_t", a, out)?;
        self.inner.sign_t(mem, a, out)
    }

    fn clip_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        low: f64,
        high: f64,
        out: &TensorView,
    ) -> Result<()> {
        same_shape("clip_t", a, out)?;
        self.inner.clip_t(mem, a, low, high, out)
    }

    fn sum_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        axis: Option<usize>,
        out: &TensorView,
    ) -> Result<()> {
        match axis {
            None => {
                if out.len() != 1 {
                    return Err(Error::ShapeMismatch {
                        op: "sum_t",
                        expected: Shape::from(1),
                        got: out.shape().clone(),
                    });
                }
            }
            Some(ax) => {
                rank("sum_t", a, 2)?;
                if ax > 1 {
                    return Err(Error::RankMismatch {
                        op: "sum_t",
                        expected: 2,
                        got: ax,
                    });
                }
                let kept = a.dims()[1 - ax];
                if out.len() != kept {
                    return Err(Error::ShapeMismatch {
                        op: "sum_t",
                        expected: Shape::from(kept),
                        got: out.shape().clone(),
                    });
                }
            }
        }
        self.inner.sum_t(mem, a, axis, out)
    }

    fn index_m_by_v(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        rank("index_m_by_v", m, 2)?;
        if v.len() != m.dims()[0] || out.len() != v.len() {
            return Err(Error::ShapeMismatch {
                op: "index_m_by_v",
                expected: Shape::from((m.dims()[0], 1)),
                got: v.shape().clone(),
            });
        }
        self.inner.index_m_by_v(mem, m, v, out)
    }

    fn binarize_v(&self, mem: &mut Self::Mem, v: &TensorView, out: &TensorView) -> Result<()> {
        rank("binarize_v", out, 2)?;
        if out.dims()[0] != v.len() {
            return Err(Error::ShapeMismatch {
                op: "binarize_v",
                expected: Shape::from((v.len(), out.dims()[1])),
                got: out.shape().clone(),
            });
        }
        self.inner.binarize_v(mem, v, out)
    }

    fn broadcast_features_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        if a.rank() != out.rank()
            || a.dims().last() != Some(&1)
            || a.dims()[..a.rank() - 1] != out.dims()[..out.rank() - 1]
        {
            return Err(Error::ShapeMismatch {
                op: "broadcast_features_t",
                expected: a.shape().clone(),
                got: out.shape().clone(),
            });
        }
        self.inner.broadcast_features_t(mem, a, out)
    }

    fn fill_gaussian(
        &self,
        mem: &mut Self::Mem,
        mean: f64,
        std: f64,
        out: &TensorView,
    ) -> Result<()> {
        self.inner.fill_gaussian(mem, mean, std, out)
    }

    fn generate_probability_mask(
        &self,
        mem: &mut Self::Mem,
        mask: &TensorView,
        probability: f64,
    ) -> Result<()> {
        self.inner.generate_probability_mask(mem, mask, probability)
    }

    fn conv2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        weights: &TensorView,
        bias: &TensorView,
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
    ) -> Result<()> {
        rank("conv2d_forward_batch", inputs, 4)?;
        rank("conv2d_forward_batch", weights, 4)?;
        let id = inputs.dims();
        let wd = weights.dims();
        if wd[1] != id[1] || bias.len() != wd[0] {
            return Err(Error::ShapeMismatch {
                op: "conv2d_forward_batch",
                expected: Shape::from((wd[0], id[1], wd[2], wd[3])),
                got: weights.shape().clone(),
            });
        }
        rank("conv2d_forward_batch", outputs, 4)?;
        // Output channel count follows the filter count, not the input's.
        let oh = (id[2] + 2 * padding - wd[2]) / stride.0 + 1;
        let ow = (id[3] + 2 * padding - wd[3]) / stride.1 + 1;
        if outputs.dims() != [id[0], wd[0], oh, ow] {
            return Err(Error::ShapeMismatch {
                op: "conv2d_forward_batch",
                expected: Shape::from((id[0], wd[0], oh, ow)),
                got: outputs.shape().clone(),
            });
        }
        self.inner
            .conv2d_forward_batch(mem, inputs, weights, bias, outputs, padding, stride)
    }

    fn conv2d_backward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        weights: &TensorView,
        padding: usize,
        stride: (usize, usize),
        in_deltas: &TensorView,
        out_deltas: &TensorView,
        weight_deltas: &TensorView,
        bias_deltas: &TensorView,
    ) -> Result<()> {
        same_shape("conv2d_backward_batch", inputs, in_deltas)?;
        same_shape("conv2d_backward_batch", weights, weight_deltas)?;
        if bias_deltas.len() != weights.dims()[0] {
            return Err(Error::ShapeMismatch {
                op: "conv2d_backward_batch",
                expected: Shape::from(weights.dims()[0]),
                got: bias_deltas.shape().clone(),
            });
        }
        self.inner.conv2d_backward_batch(
            mem,
            inputs,
            weights,
            padding,
            stride,
            in_deltas,
            out_deltas,
            weight_deltas,
            bias_deltas,
        )
    }

    fn maxpool2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
        argmax: &TensorView,
    ) -> Result<()> {
        pool_out_dims("maxpool2d_forward_batch", inputs, outputs, window, padding, stride)?;
        same_shape("maxpool2d_forward_batch", outputs, argmax)?;
        self.inner
            .maxpool2d_forward_batch(mem, inputs, window, outputs, padding, stride, argmax)
    }

    fn maxpool2d_backward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
        argmax: &TensorView,
        in_deltas: &TensorView,
        out_deltas: &TensorView,
    ) -> Result<()> {
        pool_out_dims("maxpool2d_backward_batch", inputs, outputs, window, padding, stride)?;
        same_shape("maxpool2d_backward_batch", outputs, out_deltas)?;
        same_shape("maxpool2d_backward_batch", outputs, argmax)?;
        same_shape("maxpool2d_backward_batch", inputs, in_deltas)?;
        self.inner.maxpool2d_backward_batch(
            mem, inputs, window, outputs, padding, stride, argmax, in_deltas, out_deltas,
        )
    }

    fn avgpool2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
    ) -> Result<()> {
        pool_out_dims("avgpool2d_forward_batch", inputs, outputs, window, padding, stride)?;
        self.inner
            .avgpool2d_forward_batch(mem, inputs, window, outputs, padding, stride)
    }

    fn avgpool2d_backward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
        in_deltas: &TensorView,
        out_deltas: &TensorView,
    ) -> Result<()> {
        pool_out_dims("avgpool2d_backward_batch", inputs, outputs, window, padding, stride)?;
        same_shape("avgpool2d_backward_batch", outputs, out_deltas)?;
        same_shape("avgpool2d_backward_batch", inputs, in_deltas)?;
        self.inner
            .avgpool2d_backward_batch(mem, inputs, window, outputs, padding, stride, in_deltas, out_deltas)
    }

    fn sigmoid(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        same_shape("sigmoid", x, y)?;
        self.inner.sigmoid(mem, x, y)
    }

    fn sigmoid_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        same_shape("sigmoid_deriv", y, dy)?;
        same_shape("sigmoid_deriv", y, dx)?;
        self.inner.sigmoid_deriv(mem, x, y, dy, dx)
    }

    fn tanh(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        same_shape("tanh", x, y)?;
        self.inner.tanh(mem, x, y)
    }

    fn tanh_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        same_shape("tanh_deriv", y, dy)?;
        same_shape("tanh_deriv", y, dx)?;
        self.inner.tanh_deriv(mem, x, y, dy, dx)
    }

    fn rel(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        same_shape("rel", x, y)?;
        self.inner.rel(mem, x, y)
    }

    fn rel_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        same_shape("rel_deriv", y, dy)?;
        same_shape("rel_deriv", y, dx)?;
        self.inner.rel_deriv(mem, x, y, dy, dx)
    }

    fn softmax_m(&self, mem: &mut Self::Mem, m: &TensorView, out: &TensorView) -> Result<()> {
        rank("softmax_m", m, 2)?;
        same_shape("softmax_m", m, out)?;
        self.inner.softmax_m(mem, m, out)
    }
}
