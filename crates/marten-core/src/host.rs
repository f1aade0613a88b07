use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::host_array::HostArray;
use crate::random::RandomState;
use crate::view::TensorView;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::cell::RefCell;

// HostHandler — reference CPU backend
//
// Stores everything in a flat Vec<f64> and implements each operation with
// plain index arithmetic. Elementwise operations index directly into the
// arena so that exact output/input aliasing (the in-place call pattern used
// by the layers) stays well-defined; the matrix/convolution hot paths split
// disjoint read and write slices out of the arena and parallelize over
// output rows with rayon.
//
// No operation checks shapes. Wrap in `CheckedHandler` to validate.

/// The reference host (CPU) backend.
#[derive(Debug, Clone)]
pub struct HostHandler {
    rng: RefCell<RandomState>,
}

impl HostHandler {
    /// A handler seeded from the operating system.
    pub fn new() -> Self {
        HostHandler {
            rng: RefCell::new(RandomState::from_entropy()),
        }
    }

    /// A handler with a fixed seed for reproducible random fills.
    pub fn seeded(seed: u64) -> Self {
        HostHandler {
            rng: RefCell::new(RandomState::new(seed)),
        }
    }

    fn gemm(
        &self,
        mem: &mut [f64],
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        transa: bool,
        transb: bool,
        accumulate: bool,
    ) -> Result<()> {
        let (ar, ac) = (a.dims()[0], a.dims()[1]);
        let (br, bc) = (b.dims()[0], b.dims()[1]);
        let m = if transa { ac } else { ar };
        let k = if transa { ar } else { ac };
        let n = if transb { br } else { bc };
        debug_assert_eq!(out.len(), m * n);

        let ([av, bv], ov) = split_rw(mem, [a, b], out);
        ov.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for (j, slot) in row.iter_mut().enumerate() {
                let mut acc = 0.0f64;
                for l in 0..k {
                    let x = if transa { av[l * ac + i] } else { av[i * ac + l] };
                    let y = if transb { bv[j * bc + l] } else { bv[l * bc + j] };
                    acc += x * y;
                }
                if accumulate {
                    *slot += acc;
                } else {
                    *slot = acc;
                }
            }
        });
        Ok(())
    }

    fn unary(
        &self,
        mem: &mut [f64],
        a: &TensorView,
        out: &TensorView,
        f: impl Fn(f64) -> f64,
    ) -> Result<()> {
        let (ao, oo) = (a.offset(), out.offset());
        for i in 0..out.len() {
            mem[oo + i] = f(mem[ao + i]);
        }
        Ok(())
    }

    fn binary(
        &self,
        mem: &mut [f64],
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        let (ao, bo, oo) = (a.offset(), b.offset(), out.offset());
        for i in 0..out.len() {
            mem[oo + i] = f(mem[ao + i], mem[bo + i]);
        }
        Ok(())
    }

    fn broadcast_mv(
        &self,
        mem: &mut [f64],
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<()> {
        let (rows, cols) = (m.dims()[0], m.dims()[1]);
        let vd = v.dims();
        let row_vector = match vd.len() {
            2 => vd[0] == 1,
            _ => true,
        };
        let (mo, vo, oo) = (m.offset(), v.offset(), out.offset());
        for r in 0..rows {
            for c in 0..cols {
                let vv = if row_vector { mem[vo + c] } else { mem[vo + r] };
                mem[oo + r * cols + c] = f(mem[mo + r * cols + c], vv);
            }
        }
        Ok(())
    }
}

impl Default for HostHandler {
    fn default() -> Self {
        HostHandler::new()
    }
}

/// Split mutable access to `out` alongside shared access to `reads`, all
/// windows into the same arena. The caller guarantees `out` is disjoint from
/// every read region (asserted in debug builds); read regions may alias each
/// other freely.
fn split_rw<'a, const N: usize>(
    mem: &'a mut [f64],
    reads: [&TensorView; N],
    out: &TensorView,
) -> ([&'a [f64]; N], &'a mut [f64]) {
    let len = mem.len();
    debug_assert!(out.end() <= len);
    for r in &reads {
        debug_assert!(r.end() <= len);
        debug_assert!(
            r.end() <= out.offset() || out.end() <= r.offset(),
            "output region overlaps a read region"
        );
    }
    let ptr = mem.as_mut_ptr();
    let rs = reads.map(|r| unsafe { std::slice::from_raw_parts(ptr.add(r.offset()), r.len()) });
    let o = unsafe { std::slice::from_raw_parts_mut(ptr.add(out.offset()), out.len()) };
    (rs, o)
}

impl Handler for HostHandler {
    type Mem = Vec<f64>;

    fn name(&self) -> &'static str {
        "host"
    }

    fn allocate(&self, size: usize) -> Result<Self::Mem> {
        Ok(vec![0.0; size])
    }

    fn zeros(&self, size: usize) -> Result<Self::Mem> {
        Ok(vec![0.0; size])
    }

    fn ones(&self, size: usize) -> Result<Self::Mem> {
        Ok(vec![1.0; size])
    }

    fn copy_to(&self, mem: &mut Self::Mem, dest: &TensorView, src: &TensorView) -> Result<()> {
        let (d, s) = (dest.offset(), src.offset());
        if d == s {
            return Ok(());
        }
        for i in 0..dest.len() {
            mem[d + i] = mem[s + i];
        }
        Ok(())
    }

    fn fill(&self, mem: &mut Self::Mem, dest: &TensorView, val: f64) -> Result<()> {
        mem[dest.range()].fill(val);
        Ok(())
    }

    fn create_from_host(&self, arr: &HostArray) -> Result<Self::Mem> {
        Ok(arr.data().to_vec())
    }

    fn get_host_copy(&self, mem: &Self::Mem, src: &TensorView) -> Result<HostArray> {
        HostArray::new(src.shape().clone(), mem[src.range()].to_vec())
    }

    fn set_from_host(
        &self,
        mem: &mut Self::Mem,
        dest: &TensorView,
        arr: &HostArray,
    ) -> Result<()> {
        if arr.len() != dest.len() {
            return Err(Error::msg(format!(
                "cannot set view of {} elements from host array of {}",
                dest.len(),
                arr.len()
            )));
        }
        mem[dest.range()].copy_from_slice(arr.data());
        Ok(())
    }

    fn is_fully_finite(&self, mem: &Self::Mem, a: &TensorView) -> Result<bool> {
        Ok(mem[a.range()].iter().all(|x| x.is_finite()))
    }

    fn add_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.broadcast_mv(mem, m, v, out, |a, b| a + b)
    }

    fn subtract_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.broadcast_mv(mem, m, v, out, |a, b| a - b)
    }

    fn mult_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.broadcast_mv(mem, m, v, out, |a, b| a * b)
    }

    fn divide_mv(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.broadcast_mv(mem, m, v, out, |a, b| a / b)
    }

    fn add_st(&self, mem: &mut Self::Mem, s: f64, t: &TensorView, out: &TensorView) -> Result<()> {
        self.unary(mem, t, out, |x| s + x)
    }

    fn mult_st(
        &self,
        mem: &mut Self::Mem,
        s: f64,
        t: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.unary(mem, t, out, |x| s * x)
    }

    fn mult_add_st(
        &self,
        mem: &mut Self::Mem,
        s: f64,
        t: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        let (to, oo) = (t.offset(), out.offset());
        for i in 0..out.len() {
            mem[oo + i] += s * mem[to + i];
        }
        Ok(())
    }

    fn add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.binary(mem, a, b, out, |x, y| x + y)
    }

    fn subtract_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.binary(mem, a, b, out, |x, y| x - y)
    }

    fn mult_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.binary(mem, a, b, out, |x, y| x * y)
    }

    fn divide_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        self.binary(mem, a, b, out, |x, y| x / y)
    }

    fn mult_add_tt(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        b: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        let (ao, bo, oo) = (a.offset(), b.offset(), out.offset());
        for i in 0..out.len() {
            mem[oo + i] += mem[ao + i] * mem[bo + i];
        }
        Ok(())
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
        self.gemm(mem, a, b, out, transa, transb, false)
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
        self.gemm(mem, a, b, out, transa, transb, true)
    }

    fn log_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        self.unary(mem, a, out, |x| x.ln())
    }

    fn sqrt_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        self.unary(mem, a, out, |x| x.sqrt())
    }

    fn sign_t(&self, mem: &mut Self::Mem, a: &TensorView, out: &TensorView) -> Result<()> {
        self.unary(mem, a, out, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        })
    }

    fn clip_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        low: f64,
        high: f64,
        out: &TensorView,
    ) -> Result<()> {
        self.unary(mem, a, out, |x| x.clamp(low, high))
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
                let total: f64 = mem[a.range()].iter().sum();
                mem[out.offset()] = total;
            }
            Some(0) => {
                let (rows, cols) = (a.dims()[0], a.dims()[1]);
                let (ao, oo) = (a.offset(), out.offset());
                for c in 0..cols {
                    let mut acc = 0.0;
                    for r in 0..rows {
                        acc += mem[ao + r * cols + c];
                    }
                    mem[oo + c] = acc;
                }
            }
            Some(1) => {
                let (rows, cols) = (a.dims()[0], a.dims()[1]);
                let (ao, oo) = (a.offset(), out.offset());
                for r in 0..rows {
                    let mut acc = 0.0;
                    for c in 0..cols {
                        acc += mem[ao + r * cols + c];
                    }
                    mem[oo + r] = acc;
                }
            }
            Some(ax) => {
                return Err(Error::msg(format!(
                    "sum_t supports axes 0 and 1 on matrices, got axis {}",
                    ax
                )))
            }
        }
        Ok(())
    }

    fn index_m_by_v(
        &self,
        mem: &mut Self::Mem,
        m: &TensorView,
        v: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        let cols = m.dims()[1];
        let (mo, vo, oo) = (m.offset(), v.offset(), out.offset());
        for i in 0..v.len() {
            let col = mem[vo + i] as usize;
            mem[oo + i] = mem[mo + i * cols + col];
        }
        Ok(())
    }

    fn binarize_v(&self, mem: &mut Self::Mem, v: &TensorView, out: &TensorView) -> Result<()> {
        let cols = out.dims()[1];
        let (vo, oo) = (v.offset(), out.offset());
        mem[out.range()].fill(0.0);
        for i in 0..v.len() {
            let col = mem[vo + i] as usize;
            mem[oo + i * cols + col] = 1.0;
        }
        Ok(())
    }

    fn broadcast_features_t(
        &self,
        mem: &mut Self::Mem,
        a: &TensorView,
        out: &TensorView,
    ) -> Result<()> {
        let repeat = *out.dims().last().unwrap_or(&1);
        let (ao, oo) = (a.offset(), out.offset());
        for i in 0..a.len() {
            for j in 0..repeat {
                mem[oo + i * repeat + j] = mem[ao + i];
            }
        }
        Ok(())
    }

    fn fill_gaussian(
        &self,
        mem: &mut Self::Mem,
        mean: f64,
        std: f64,
        out: &TensorView,
    ) -> Result<()> {
        let mut rng = self.rng.borrow_mut();
        for slot in &mut mem[out.range()] {
            let draw: f64 = rng.rng().sample(StandardNormal);
            *slot = mean + std * draw;
        }
        Ok(())
    }

    fn generate_probability_mask(
        &self,
        mem: &mut Self::Mem,
        mask: &TensorView,
        probability: f64,
    ) -> Result<()> {
        let mut rng = self.rng.borrow_mut();
        for slot in &mut mem[mask.range()] {
            *slot = if rng.rng().gen::<f64>() < probability {
                1.0
            } else {
                0.0
            };
        }
        Ok(())
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
        let id = inputs.dims();
        let (ci, h, w) = (id[1], id[2], id[3]);
        let wd = weights.dims();
        let (k, kh, kw) = (wd[0], wd[2], wd[3]);
        let od = outputs.dims();
        let (oh, ow) = (od[2], od[3]);
        let (sh, sw) = stride;
        let p = padding as isize;

        let ([iv, wv, bv], ov) = split_rw(mem, [inputs, weights, bias], outputs);
        ov.par_chunks_mut(k * oh * ow)
            .enumerate()
            .for_each(|(n, img)| {
                for kk in 0..k {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let mut acc = bv[kk];
                            for c in 0..ci {
                                for ky in 0..kh {
                                    for kx in 0..kw {
                                        let iy = (oy * sh + ky) as isize - p;
                                        let ix = (ox * sw + kx) as isize - p;
                                        if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize
                                        {
                                            continue;
                                        }
                                        let iidx = ((n * ci + c) * h + iy as usize) * w
                                            + ix as usize;
                                        let widx = ((kk * ci + c) * kh + ky) * kw + kx;
                                        acc += iv[iidx] * wv[widx];
                                    }
                                }
                            }
                            img[(kk * oh + oy) * ow + ox] = acc;
                        }
                    }
                }
            });
        Ok(())
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
        let id = inputs.dims();
        let (nb, ci, h, w) = (id[0], id[1], id[2], id[3]);
        let wd = weights.dims();
        let (k, kh, kw) = (wd[0], wd[2], wd[3]);
        let od = out_deltas.dims();
        let (oh, ow) = (od[2], od[3]);
        let (sh, sw) = stride;
        let p = padding as isize;
        let (io, wo, dio, doo, dwo, dbo) = (
            inputs.offset(),
            weights.offset(),
            in_deltas.offset(),
            out_deltas.offset(),
            weight_deltas.offset(),
            bias_deltas.offset(),
        );

        for n in 0..nb {
            for kk in 0..k {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let d = mem[doo + ((n * k + kk) * oh + oy) * ow + ox];
                        mem[dbo + kk] += d;
                        for c in 0..ci {
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let iy = (oy * sh + ky) as isize - p;
                                    let ix = (ox * sw + kx) as isize - p;
                                    if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                        continue;
                                    }
                                    let iidx = ((n * ci + c) * h + iy as usize) * w + ix as usize;
                                    let widx = ((kk * ci + c) * kh + ky) * kw + kx;
                                    mem[dwo + widx] += d * mem[io + iidx];
                                    mem[dio + iidx] += d * mem[wo + widx];
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
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
        let id = inputs.dims();
        let (nb, c, h, w) = (id[0], id[1], id[2], id[3]);
        let od = outputs.dims();
        let (oh, ow) = (od[2], od[3]);
        let (kh, kw) = window;
        let (sh, sw) = stride;
        let p = padding as isize;
        let (io, oo, ao) = (inputs.offset(), outputs.offset(), argmax.offset());

        for n in 0..nb {
            for cc in 0..c {
                let plane = io + (n * c + cc) * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut best = f64::NEG_INFINITY;
                        let mut best_idx = 0usize;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * sh + ky) as isize - p;
                                let ix = (ox * sw + kx) as isize - p;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                let flat = iy as usize * w + ix as usize;
                                let val = mem[plane + flat];
                                if val > best {
                                    best = val;
                                    best_idx = flat;
                                }
                            }
                        }
                        let out_idx = ((n * c + cc) * oh + oy) * ow + ox;
                        mem[oo + out_idx] = best;
                        mem[ao + out_idx] = best_idx as f64;
                    }
                }
            }
        }
        Ok(())
    }

    fn maxpool2d_backward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        _window: (usize, usize),
        _outputs: &TensorView,
        _padding: usize,
        _stride: (usize, usize),
        argmax: &TensorView,
        in_deltas: &TensorView,
        out_deltas: &TensorView,
    ) -> Result<()> {
        let id = inputs.dims();
        let (nb, c, h, w) = (id[0], id[1], id[2], id[3]);
        let od = out_deltas.dims();
        let (oh, ow) = (od[2], od[3]);
        let (ao, dio, doo) = (argmax.offset(), in_deltas.offset(), out_deltas.offset());

        for n in 0..nb {
            for cc in 0..c {
                let plane = dio + (n * c + cc) * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let out_idx = ((n * c + cc) * oh + oy) * ow + ox;
                        let flat = mem[ao + out_idx] as usize;
                        mem[plane + flat] += mem[doo + out_idx];
                    }
                }
            }
        }
        Ok(())
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
        let id = inputs.dims();
        let (nb, c, h, w) = (id[0], id[1], id[2], id[3]);
        let od = outputs.dims();
        let (oh, ow) = (od[2], od[3]);
        let (kh, kw) = window;
        let (sh, sw) = stride;
        let p = padding as isize;
        let area = (kh * kw) as f64;
        let (io, oo) = (inputs.offset(), outputs.offset());

        for n in 0..nb {
            for cc in 0..c {
                let plane = io + (n * c + cc) * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = 0.0;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * sh + ky) as isize - p;
                                let ix = (ox * sw + kx) as isize - p;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                acc += mem[plane + iy as usize * w + ix as usize];
                            }
                        }
                        mem[oo + ((n * c + cc) * oh + oy) * ow + ox] = acc / area;
                    }
                }
            }
        }
        Ok(())
    }

    fn avgpool2d_backward_batch(
        &self,
        mem: &mut Self::Mem,
        inputs: &TensorView,
        window: (usize, usize),
        _outputs: &TensorView,
        padding: usize,
        stride: (usize, usize),
        in_deltas: &TensorView,
        out_deltas: &TensorView,
    ) -> Result<()> {
        let id = inputs.dims();
        let (nb, c, h, w) = (id[0], id[1], id[2], id[3]);
        let od = out_deltas.dims();
        let (oh, ow) = (od[2], od[3]);
        let (kh, kw) = window;
        let (sh, sw) = stride;
        let p = padding as isize;
        let area = (kh * kw) as f64;
        let (dio, doo) = (in_deltas.offset(), out_deltas.offset());

        for n in 0..nb {
            for cc in 0..c {
                let plane = dio + (n * c + cc) * h * w;
                for oy in 0..oh {
                    for ox in 0..ow {
                        let d = mem[doo + ((n * c + cc) * oh + oy) * ow + ox] / area;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (oy * sh + ky) as isize - p;
                                let ix = (ox * sw + kx) as isize - p;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                mem[plane + iy as usize * w + ix as usize] += d;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn sigmoid(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        self.unary(mem, x, y, |v| 1.0 / (1.0 + (-v).exp()))
    }

    fn sigmoid_deriv(
        &self,
        mem: &mut Self::Mem,
        _x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        self.binary(mem, dy, y, dx, |d, v| d * v * (1.0 - v))
    }

    fn tanh(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        self.unary(mem, x, y, |v| v.tanh())
    }

    fn tanh_deriv(
        &self,
        mem: &mut Self::Mem,
        _x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        self.binary(mem, dy, y, dx, |d, v| d * (1.0 - v * v))
    }

    fn rel(&self, mem: &mut Self::Mem, x: &TensorView, y: &TensorView) -> Result<()> {
        self.unary(mem, x, y, |v| v.max(0.0))
    }

    fn rel_deriv(
        &self,
        mem: &mut Self::Mem,
        _x: &TensorView,
        y: &TensorView,
        dy: &TensorView,
        dx: &TensorView,
    ) -> Result<()> {
        self.binary(mem, dy, y, dx, |d, v| if v > 0.0 { d } else { 0.0 })
    }

    fn softmax_m(&self, mem: &mut Self::Mem, m: &TensorView, out: &TensorView) -> Result<()> {
        let (rows, cols) = (m.dims()[0], m.dims()[1]);
        let (mo, oo) = (m.offset(), out.offset());
        for r in 0..rows {
            let mut max = f64::NEG_INFINITY;
            for c in 0..cols {
                max = max.max(mem[mo + r * cols + c]);
            }
            let mut total = 0.0;
            for c in 0..cols {
                let e = (mem[mo + r * cols + c] - max).exp();
                mem[oo + r * cols + c] = e;
                total += e;
            }
            for c in 0..cols {
                mem[oo + r * cols + c] /= total;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mem_of(data: &[f64]) -> Vec<f64> {
        data.to_vec()
    }

    #[test]
    fn test_dot_mm() {
        let h = HostHandler::seeded(0);
        // a = [[1, 2], [3, 4]], b = [[5, 6], [7, 8]], out at offset 8.
        let mut mem = mem_of(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 0.0, 0.0, 0.0, 0.0]);
        let a = TensorView::new(0, (2, 2));
        let b = TensorView::new(4, (2, 2));
        let out = TensorView::new(8, (2, 2));
        h.dot_mm(&mut mem, &a, &b, &out, false, false).unwrap();
        assert_eq!(&mem[8..], &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_dot_mm_transposed_operands() {
        let h = HostHandler::seeded(0);
        // a = [[1, 2, 3], [4, 5, 6]] (2x3), b = [[1, 0], [0, 1], [1, 1]] (3x2)
        let mut mem = mem_of(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, //
            1.0, 0.0, 0.0, 1.0, 1.0, 1.0, //
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]);
        let a = TensorView::new(0, (2, 3));
        let b = TensorView::new(6, (3, 2));
        // a^T @ b^T: (3x2) @ (2x3) = 3x3
        let out = TensorView::new(12, (3, 3));
        h.dot_mm(&mut mem, &a, &b, &out, true, true).unwrap();
        // a^T = [[1,4],[2,5],[3,6]], b^T = [[1,0,1],[0,1,1]]
        assert_eq!(
            &mem[12..],
            &[1.0, 4.0, 5.0, 2.0, 5.0, 7.0, 3.0, 6.0, 9.0]
        );
    }

    #[test]
    fn test_dot_add_mm_accumulates_to_double() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 0.0, 0.0, 0.0, 0.0]);
        let a = TensorView::new(0, (2, 2));
        let b = TensorView::new(4, (2, 2));
        let out = TensorView::new(8, (2, 2));
        h.dot_mm(&mut mem, &a, &b, &out, false, false).unwrap();
        let single: Vec<f64> = mem[8..].to_vec();

        h.fill(&mut mem, &out, 0.0).unwrap();
        h.dot_add_mm(&mut mem, &a, &b, &out, false, false).unwrap();
        h.dot_add_mm(&mut mem, &a, &b, &out, false, false).unwrap();
        for (i, &s) in single.iter().enumerate() {
            assert_relative_eq!(mem[8 + i], 2.0 * s);
        }
    }

    #[test]
    fn test_add_mv_row_and_column() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 0.0, 0.0, 0.0, 0.0]);
        let m = TensorView::new(0, (2, 2));
        let v_row = TensorView::new(4, (1, 2));
        let out = TensorView::new(6, (2, 2));
        h.add_mv(&mut mem, &m, &v_row, &out).unwrap();
        assert_eq!(&mem[6..], &[11.0, 22.0, 13.0, 24.0]);

        let v_col = TensorView::new(4, (2, 1));
        h.add_mv(&mut mem, &m, &v_col, &out).unwrap();
        assert_eq!(&mem[6..], &[11.0, 12.0, 23.0, 24.0]);
    }

    #[test]
    fn test_add_mv_in_place_aliasing() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0, 4.0, 10.0, 20.0]);
        let m = TensorView::new(0, (2, 2));
        let v = TensorView::new(4, (1, 2));
        // out aliases m exactly, the in-place pattern layers rely on.
        h.add_mv(&mut mem, &m, &v, &m).unwrap();
        assert_eq!(&mem[..4], &[11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_mult_add_tt_accumulates() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[2.0, 3.0, 4.0, 5.0, 1.0, 1.0]);
        let a = TensorView::new(0, 2);
        let b = TensorView::new(2, 2);
        let out = TensorView::new(4, 2);
        h.mult_add_tt(&mut mem, &a, &b, &out).unwrap();
        assert_eq!(&mem[4..], &[9.0, 16.0]);
    }

    #[test]
    fn test_binarize_v() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[0.0, 2.0, 1.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0]);
        let v = TensorView::new(0, (3, 1));
        let out = TensorView::new(3, (3, 3));
        h.binarize_v(&mut mem, &v, &out).unwrap();
        assert_eq!(
            &mem[3..],
            &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_index_m_by_v() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0, // m (2x3)
            2.0, 0.0, // v
            0.0, 0.0, // out
        ]);
        let m = TensorView::new(0, (2, 3));
        let v = TensorView::new(6, (2, 1));
        let out = TensorView::new(8, (2, 1));
        h.index_m_by_v(&mut mem, &m, &v, &out).unwrap();
        assert_eq!(&mem[8..], &[3.0, 4.0]);
    }

    #[test]
    fn test_sum_t_axes() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let a = TensorView::new(0, (2, 3));
        let cols = TensorView::new(6, 3);
        h.sum_t(&mut mem, &a, Some(0), &cols).unwrap();
        assert_eq!(&mem[6..9], &[5.0, 7.0, 9.0]);
        let rows = TensorView::new(9, 2);
        h.sum_t(&mut mem, &a, Some(1), &rows).unwrap();
        assert_eq!(&mem[9..11], &[6.0, 15.0]);
        let full = TensorView::new(6, 1);
        h.sum_t(&mut mem, &a, None, &full).unwrap();
        assert_eq!(mem[6], 21.0);
    }

    #[test]
    fn test_broadcast_features_t() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        let a = TensorView::new(0, (1, 2, 1));
        let out = TensorView::new(2, (1, 2, 2));
        h.broadcast_features_t(&mut mem, &a, &out).unwrap();
        assert_eq!(&mem[2..], &[1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_maxpool_forward_and_backward_roundtrip() {
        let h = HostHandler::seeded(0);
        // Deterministic 1-channel 4x4 input, 2x2 window, stride 2.
        #[rustfmt::skip]
        let input = [
            1.0,  2.0,  5.0,  4.0,
            3.0,  0.0,  1.0,  2.0,
            7.0,  6.0,  0.0,  1.0,
            4.0,  8.0,  2.0,  3.0,
        ];
        let mut mem = vec![0.0; 16 + 4 + 4 + 16 + 4];
        mem[..16].copy_from_slice(&input);
        let inputs = TensorView::new(0, (1, 1, 4, 4));
        let outputs = TensorView::new(16, (1, 1, 2, 2));
        let argmax = TensorView::new(20, (1, 1, 2, 2));
        let in_deltas = TensorView::new(24, (1, 1, 4, 4));
        let out_deltas = TensorView::new(40, (1, 1, 2, 2));

        h.maxpool2d_forward_batch(&mut mem, &inputs, (2, 2), &outputs, 0, (2, 2), &argmax)
            .unwrap();
        assert_eq!(&mem[16..20], &[3.0, 5.0, 8.0, 3.0]);

        h.fill(&mut mem, &out_deltas, 1.0).unwrap();
        h.maxpool2d_backward_batch(
            &mut mem,
            &inputs,
            (2, 2),
            &outputs,
            0,
            (2, 2),
            &argmax,
            &in_deltas,
            &out_deltas,
        )
        .unwrap();
        // Each delta lands exactly on the argmax position, zero elsewhere.
        #[rustfmt::skip]
        let expected = [
            0.0, 0.0, 1.0, 0.0,
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
        ];
        assert_eq!(&mem[24..40], &expected);
    }

    #[test]
    fn test_avgpool_forward() {
        let h = HostHandler::seeded(0);
        let mut mem = vec![0.0; 16 + 4];
        for i in 0..16 {
            mem[i] = i as f64;
        }
        let inputs = TensorView::new(0, (1, 1, 4, 4));
        let outputs = TensorView::new(16, (1, 1, 2, 2));
        h.avgpool2d_forward_batch(&mut mem, &inputs, (2, 2), &outputs, 0, (2, 2))
            .unwrap();
        assert_eq!(&mem[16..], &[2.5, 4.5, 10.5, 12.5]);
    }

    #[test]
    fn test_conv2d_forward_identity_kernel() {
        let h = HostHandler::seeded(0);
        // 1x1x3x3 input, single 1x1x1x1 identity kernel with bias 1.
        let mut mem = vec![0.0; 9 + 1 + 1 + 9];
        for i in 0..9 {
            mem[i] = i as f64;
        }
        mem[9] = 1.0; // weight
        mem[10] = 1.0; // bias
        let inputs = TensorView::new(0, (1, 1, 3, 3));
        let weights = TensorView::new(9, (1, 1, 1, 1));
        let bias = TensorView::new(10, 1);
        let outputs = TensorView::new(11, (1, 1, 3, 3));
        h.conv2d_forward_batch(&mut mem, &inputs, &weights, &bias, &outputs, 0, (1, 1))
            .unwrap();
        for i in 0..9 {
            assert_relative_eq!(mem[11 + i], i as f64 + 1.0);
        }
    }

    #[test]
    fn test_conv2d_backward_shapes_and_bias() {
        let h = HostHandler::seeded(0);
        // 1x1x2x2 input, 1x1x2x2 kernel, valid conv -> 1x1x1x1 output.
        let mut mem = vec![0.0; 4 + 4 + 4 + 1 + 4 + 1];
        mem[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        mem[4..8].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let inputs = TensorView::new(0, (1, 1, 2, 2));
        let weights = TensorView::new(4, (1, 1, 2, 2));
        let in_deltas = TensorView::new(8, (1, 1, 2, 2));
        let out_deltas = TensorView::new(12, (1, 1, 1, 1));
        let weight_deltas = TensorView::new(13, (1, 1, 2, 2));
        let bias_deltas = TensorView::new(17, 1);
        mem[12] = 2.0; // upstream delta
        h.conv2d_backward_batch(
            &mut mem,
            &inputs,
            &weights,
            0,
            (1, 1),
            &in_deltas,
            &out_deltas,
            &weight_deltas,
            &bias_deltas,
        )
        .unwrap();
        assert_eq!(&mem[8..12], &[2.0, 2.0, 2.0, 2.0]); // d * weights
        assert_eq!(&mem[13..17], &[2.0, 4.0, 6.0, 8.0]); // d * inputs
        assert_eq!(mem[17], 2.0);
    }

    #[test]
    fn test_activations_and_derivs() {
        let h = HostHandler::seeded(0);
        let mut mem = vec![0.0; 12];
        mem[0] = 0.0;
        mem[1] = 1.0;
        mem[2] = -1.0;
        let x = TensorView::new(0, 3);
        let y = TensorView::new(3, 3);
        let dy = TensorView::new(6, 3);
        let dx = TensorView::new(9, 3);

        h.sigmoid(&mut mem, &x, &y).unwrap();
        assert_relative_eq!(mem[3], 0.5);
        h.fill(&mut mem, &dy, 1.0).unwrap();
        h.sigmoid_deriv(&mut mem, &x, &y, &dy, &dx).unwrap();
        assert_relative_eq!(mem[9], 0.25); // y(1-y) at y=0.5

        h.tanh(&mut mem, &x, &y).unwrap();
        assert_relative_eq!(mem[4], (1.0f64).tanh());
        h.tanh_deriv(&mut mem, &x, &y, &dy, &dx).unwrap();
        assert_relative_eq!(mem[9], 1.0); // 1 - tanh(0)^2

        h.rel(&mut mem, &x, &y).unwrap();
        assert_eq!(&mem[3..6], &[0.0, 1.0, 0.0]);
        h.rel_deriv(&mut mem, &x, &y, &dy, &dx).unwrap();
        assert_eq!(&mem[9..12], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_unary_math() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[4.0, -2.0, 0.0, 0.0, 0.0, 0.0]);
        let a = TensorView::new(0, 3);
        let out = TensorView::new(3, 3);
        h.sign_t(&mut mem, &a, &out).unwrap();
        assert_eq!(&mem[3..], &[1.0, -1.0, 0.0]);
        h.clip_t(&mut mem, &a, -1.0, 1.0, &out).unwrap();
        assert_eq!(&mem[3..], &[1.0, -1.0, 0.0]);
        h.sqrt_t(&mut mem, &a, &out).unwrap();
        assert_relative_eq!(mem[3], 2.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let m = TensorView::new(0, (2, 3));
        let out = TensorView::new(6, (2, 3));
        h.softmax_m(&mut mem, &m, &out).unwrap();
        for r in 0..2 {
            let total: f64 = mem[6 + r * 3..6 + (r + 1) * 3].iter().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        }
        assert!(mem[6] < mem[7] && mem[7] < mem[8]);
    }

    #[test]
    fn test_is_fully_finite() {
        let h = HostHandler::seeded(0);
        let mut mem = mem_of(&[1.0, 2.0, 3.0]);
        let v = TensorView::new(0, 3);
        assert!(h.is_fully_finite(&mem, &v).unwrap());
        mem[1] = f64::NAN;
        assert!(!h.is_fully_finite(&mem, &v).unwrap());
        mem[1] = f64::INFINITY;
        assert!(!h.is_fully_finite(&mem, &v).unwrap());
    }

    #[test]
    fn test_host_roundtrip_preserves_order() {
        let h = HostHandler::seeded(0);
        let arr = HostArray::new((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut mem = h.create_from_host(&arr).unwrap();
        let v = TensorView::new(0, (2, 3));
        let back = h.get_host_copy(&mem, &v).unwrap();
        assert_eq!(back, arr);

        let other = HostArray::new((2, 3), vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]).unwrap();
        h.set_from_host(&mut mem, &v, &other).unwrap();
        assert_eq!(mem, other.data());
    }

    #[test]
    fn test_probability_mask_extremes() {
        let h = HostHandler::seeded(1);
        let mut mem = vec![0.5; 64];
        let v = TensorView::new(0, 64);
        h.generate_probability_mask(&mut mem, &v, 1.0).unwrap();
        assert!(mem.iter().all(|&x| x == 1.0));
        h.generate_probability_mask(&mut mem, &v, 0.0).unwrap();
        assert!(mem.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_fill_gaussian_seeded_reproducible() {
        let h1 = HostHandler::seeded(7);
        let h2 = HostHandler::seeded(7);
        let mut m1 = vec![0.0; 16];
        let mut m2 = vec![0.0; 16];
        let v = TensorView::new(0, 16);
        h1.fill_gaussian(&mut m1, 0.0, 1.0, &v).unwrap();
        h2.fill_gaussian(&mut m2, 0.0, 1.0, &v).unwrap();
        assert_eq!(m1, m2);
    }
}
