use crate::error::Result;
use crate::host_array::HostArray;
use crate::view::TensorView;
use std::fmt;

// Handler — the backend-agnostic numeric operation contract
//
// Every numeric primitive a layer may call is a method on this trait, so
// layers are portable across backends: a reference host implementation, a
// SIMD build, or a device backend all satisfy the same contract with
// identical shape and numeric semantics.
//
// Storage is shapeless (`Handler::Mem`); shape travels separately in
// `TensorView` windows, so one arena allocation can back many buffers and a
// view can reinterpret or time-slice its region freely.
//
// Naming scheme, shared with every backend: a suffix indicates the operand
// shapes an operation expects:
//   `s` scalar, `v` vector (2-D with one dimension of size 1),
//   `m` matrix (2-D), `t` tensor (arbitrary rank).
//
// Operations perform NO shape checking; callers are responsible for valid
// operands. The `CheckedHandler` wrapper asserts every contract below and is
// the intended tool for tests and diagnosis. Output views are always
// caller-supplied, never allocated implicitly; `*_add_*` variants accumulate
// into the existing output contents, all others overwrite.

/// The numeric-backend abstraction implementing all array operations.
pub trait Handler: Clone + fmt::Debug + 'static {
    /// Shapeless storage managed by this backend (host memory, device
    /// memory, ...). One `Mem` backs a whole arena.
    type Mem: fmt::Debug;

    /// Stable identifier recorded in network descriptions.
    fn name(&self) -> &'static str;

    //  Allocation

    /// Allocate storage for `size` elements with arbitrary contents.
    fn allocate(&self, size: usize) -> Result<Self::Mem>;

    /// Allocate storage for `size` elements filled with zeros.
    fn zeros(&self, size: usize) -> Result<Self::Mem>;

    /// Allocate storage for `size` elements filled with ones.
    fn ones(&self, size: usize) -> Result<Self::Mem>;

    //  Copy, fill, host interop

    /// Copy `src` over `dest` within one arena. Both views must have the
    /// same shape. Exact aliasing (dest == src) is a no-op; partial overlap
    /// is forbidden.
    fn copy_to(&self, mem: &mut Self::Mem, dest: &TensorView, src: &TensorView) -> Result<()>;

    /// Fill a view with a scalar value.
    fn fill(&self, mem: &mut Self::Mem, dest: &TensorView, val: f64) -> Result<()>;

    /// Allocate fresh storage holding the contents of a host array.
    fn create_from_host(&self, arr: &HostArray) -> Result<Self::Mem>;

    /// Copy a view out into a host array, preserving shape and row-major
    /// element order exactly.
    fn get_host_copy(&self, mem: &Self::Mem, src: &TensorView) -> Result<HostArray>;

    /// Overwrite a view from a host array of the same element count.
    fn set_from_host(&self, mem: &mut Self::Mem, dest: &TensorView, arr: &HostArray)
        -> Result<()>;

    //  Debug helpers

    /// True iff the view contains no NaN or infinity.
    fn is_fully_finite(&self, mem: &Self::Mem, a: &TensorView) -> Result<bool>;

    //  Broadcasting arithmetic: (M, N) matrix with (1, N) or (M, 1) vector

    /// out = m + v, broadcasting the vector across rows or columns.
    fn add_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = m - v with broadcasting.
    fn subtract_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = m * v with broadcasting.
    fn mult_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = m / v with broadcasting.
    fn divide_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    //  Scalar-tensor arithmetic

    /// out = s + t, elementwise over a tensor of arbitrary rank.
    fn add_st(&self, mem: &mut Self::Mem, s: f64, t: &TensorView, out: &TensorView) -> Result<()>;

    /// out = s * t.
    fn mult_st(&self, mem: &mut Self::Mem, s: f64, t: &TensorView, out: &TensorView)
        -> Result<()>;

    /// out += s * t (accumulating).
    fn mult_add_st(
        &self,
        mem: &mut Self::Mem,
        s: f64,
        t: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    //  Elementwise tensor arithmetic (identical shapes throughout)

    /// out = a + b.
    fn add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = a - b.
    fn subtract_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = a * b.
    fn mult_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out = a / b.
    fn divide_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// out += a * b (accumulating).
    fn mult_add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    //  Matrix product (rank-2 only; transposition is logical, not physical)

    /// out = op(a) @ op(b), overwriting out.
    fn dot_mm(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        transa: bool,
        transb: bool,
    ) -> Result<()>;

    /// out += op(a) @ op(b), accumulating into out.
    fn dot_add_mm(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        transa: bool,
        transb: bool,
    ) -> Result<()>;

    //  Elementwise unary math

    /// out = ln(a).
    fn log_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()>;

    /// out = sqrt(a).
    fn sqrt_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()>;

    /// out = sign(a): 1.0 for positive, 0.0 for zero, -1.0 for negative.
    fn sign_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()>;

    /// out = clamp(a, low, high).
    fn clip_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        low: f64,
        high: f64,
        out: &TensorView,
    ) -> Result<()>;

    //  Reduction

    /// Sum along `axis`, or over the entire view when `axis` is `None`.
    /// With an axis, only 2-D views are supported and the output shape is
    /// the input shape with that axis removed; a full reduction writes a
    /// single element.
    fn sum_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        axis: Option<usize>,
        out: &TensorView,
    ) -> Result<()>;

    //  Indexing / one-hot

    /// Per-row gather: out[i, 0] = m[i, v[i, 0]].
    fn index_m_by_v(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    /// Expand a column of class indices into one-hot rows:
    /// out[i, v[i, 0]] = 1, all other entries 0. The caller must size out's
    /// column count to exceed the maximum index.
    fn binarize_v(
        &self,
        mem: &mut Self::Mem,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    //  Broadcast along the trailing axis

    /// Replicate a unit-sized rightmost axis to fill out's larger rightmost
    /// axis; all other axes must match.
    fn broadcast_features_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        out: &TensorView,
    ) -> Result<()>;

    //  Random fill

    /// Fill with draws from N(mean, std).
    fn fill_gaussian(
        &self,
        mem: &mut Self::Mem,
        mean: f64,
        std: f64,
        out: &TensorView,
    ) -> Result<()>;

    /// Fill with Bernoulli(probability) zero/one draws.
    fn generate_probability_mask(
        &self,
        mem: &mut Self::Mem,
        mask: &TensorView,
        probability: f64,
    ) -> Result<()>;

    //  Spatial operations on [batch, channel, height, width] image batches

    /// Cross-correlation with bias, stride, and zero padding.
    /// inputs [N,C,H,W], weights [K,C,kh,kw], bias [K], outputs [N,K,oh,ow].
    #[allow(clippy::too_many_arguments)]
    fn conv2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        weights: &TensorView,
        bias: &TensorView,
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
    ) -> Result<()>;

    /// Gradients for `conv2d_forward_batch`, accumulating into in_deltas,
    /// weight_deltas, and bias_deltas with the exact windowing arithmetic of
    /// the forward pass.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Max-pooling; `argmax` receives the flat spatial input index of each
    /// window maximum and is consumed by the backward counterpart.
    #[allow(clippy::too_many_arguments)]
    fn maxpool2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
        argmax: &TensorView,
    ) -> Result<()>;

    /// Routes each output delta to the recorded argmax position,
    /// accumulating into in_deltas.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Average-pooling over the same windowing as max-pooling (no argmax).
    #[allow(clippy::too_many_arguments)]
    fn avgpool2d_forward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
    ) -> Result<()>;

    /// Spreads each output delta uniformly over its window, accumulating
    /// into in_deltas.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    //  Activation functions, each a matched forward/derivative pair.
    //
    //  Derivatives compute dx = dy * f'(x) expressed in terms of the output
    //  y wherever the activation allows, so raw pre-activations need not be
    //  retained. The x argument is accepted for a uniform signature.

    /// y = 1 / (1 + exp(-x)).
    fn sigmoid(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()>;

    /// dx = dy * y * (1 - y).
    fn sigmoid_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()>;

    /// y = tanh(x).
    fn tanh(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()>;

    /// dx = dy * (1 - y^2).
    fn tanh_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()>;

    /// Rectified linear: y = max(0, x).
    fn rel(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()>;

    /// dx = dy where y > 0, else 0.
    fn rel_deriv(
        &self,
        mem: &mut Self::Mem,
        x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()>;

    /// Row-wise softmax over the last dimension of a matrix.
    fn softmax_m(&self, mem: &mut Self::Mem, m: &TensorView, out: &TensorView) -> Result<()>;
}
