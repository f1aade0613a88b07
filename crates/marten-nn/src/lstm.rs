use crate::activation::{self, ActFuncs, Activation};
use crate::layer::{
    kwarg_str, kwarg_usize, validate_connections, validate_in_shapes, validate_kwargs, Kwargs,
    Layer, LayerBuffers, ShapeList,
};
use crate::wiring::Connection;
use marten_core::{BufferStructure, Handler, Result, StructureTemplate};

// Lstm — four-gate LSTM with cell recurrence
//
// Per step t, with block input Z, input gate I, forget gate F, output gate O
// and cell state C (a/b = pre-/post-activation):
//
//   Za[t] = Wz·x[t] + Rz·y[t-1] + bz      Zb[t] = act(Za[t])
//   Ia[t] = Wi·x[t] + Ri·y[t-1] + bi      Ib[t] = sigmoid(Ia[t])
//   Fa[t] = Wf·x[t] + Rf·y[t-1] + bf      Fb[t] = sigmoid(Fa[t])
//   Ca[t] = Ib[t]*Zb[t] + Fb[t]*Ca[t-1]
//   Oa[t] = Wo·x[t] + Ro·y[t-1] + bo      Ob[t] = sigmoid(Oa[t])
//   y[t]  = Ob[t] * act(Ca[t])
//
// The cell recurrence is the gradient path that carries across time through
// both the forget gate and the previous cell value; the backward pass
// mirrors the forward exactly in reverse and accumulates every per-gate
// weight/bias gradient over time. All per-gate buffers carry a context slot
// so t-1 and t+1 indexing needs no special case at either sequence end.

const GATE_INTERNALS: [&str; 10] = ["Za", "Zb", "Ia", "Ib", "Fa", "Fb", "Oa", "Ob", "Ca", "Cb"];
const GATE_DELTAS: [&str; 10] = [
    "dZa", "dZb", "dIa", "dIb", "dFa", "dFb", "dOa", "dOb", "dCa", "dCb",
];

/// A four-gate LSTM layer over `[Time, Batch, Feature]` input.
#[derive(Debug, Clone)]
pub struct LstmLayer<H: Handler> {
    name: String,
    size: usize,
    act: Activation,
    funcs: ActFuncs<H>,
    in_shapes: ShapeList,
    out_shapes: ShapeList,
    parameter_shapes: ShapeList,
    internal_shapes: ShapeList,
}

impl<H: Handler> LstmLayer<H> {
    pub const KIND: &'static str = "Lstm";

    pub fn new(
        name: &str,
        in_shapes: ShapeList,
        incoming: &[&Connection],
        outgoing: &[&Connection],
        kwargs: &Kwargs,
    ) -> Result<Self> {
        validate_kwargs(name, kwargs, &["size", "activation_function"])?;
        validate_in_shapes(
            name,
            &in_shapes,
            &[("default", StructureTemplate::time_batch_feature())],
        )?;

        let in_size = in_shapes[0].1.feature_size();
        let size = kwarg_usize(name, kwargs, "size")?.unwrap_or(in_size);
        let act = match kwarg_str(name, kwargs, "activation_function")? {
            Some(s) => Activation::from_name(name, s)?,
            None => Activation::Tanh,
        };

        let out_shapes = vec![(
            "default".to_string(),
            BufferStructure::time_batch(vec![size]).with_context(),
        )];

        let mut parameter_shapes = ShapeList::new();
        for gate in ["Wz", "Wi", "Wf", "Wo"] {
            parameter_shapes.push((gate.to_string(), BufferStructure::fixed(vec![size, in_size])));
        }
        for gate in ["Rz", "Ri", "Rf", "Ro"] {
            parameter_shapes.push((gate.to_string(), BufferStructure::fixed(vec![size, size])));
        }
        for gate in ["bz", "bi", "bf", "bo"] {
            parameter_shapes.push((gate.to_string(), BufferStructure::fixed(vec![size])));
        }

        let mut internal_shapes = ShapeList::new();
        for name in GATE_INTERNALS {
            internal_shapes.push((
                name.to_string(),
                BufferStructure::time_batch(vec![size]).with_context(),
            ));
        }
        for name in GATE_DELTAS {
            internal_shapes.push((
                name.to_string(),
                BufferStructure::time_batch(vec![size])
                    .with_context()
                    .backward_only(),
            ));
        }
        internal_shapes.push((
            "dy".to_string(),
            BufferStructure::time_batch(vec![size])
                .with_context()
                .backward_only(),
        ));
        internal_shapes.push((
            "db_tmp".to_string(),
            BufferStructure::fixed(vec![size]).backward_only(),
        ));

        let layer = LstmLayer {
            name: name.to_string(),
            size,
            act,
            funcs: activation::resolve::<H>(act),
            in_shapes,
            out_shapes,
            parameter_shapes,
            internal_shapes,
        };
        validate_connections(
            name,
            incoming,
            outgoing,
            &layer.in_shapes,
            &layer.out_shapes,
            &layer.parameter_shapes,
            &layer.internal_shapes,
        )?;
        Ok(layer)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl<H: Handler> Layer<H> for LstmLayer<H> {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_shapes(&self) -> &ShapeList {
        &self.in_shapes
    }

    fn out_shapes(&self) -> &ShapeList {
        &self.out_shapes
    }

    fn parameter_shapes(&self) -> &ShapeList {
        &self.parameter_shapes
    }

    fn internal_shapes(&self) -> &ShapeList {
        &self.internal_shapes
    }

    fn set_handler(&mut self, _handler: &H) -> Result<()> {
        self.funcs = activation::resolve::<H>(self.act);
        Ok(())
    }

    fn forward_pass(
        &self,
        h: &H,
        mem: &mut H::Mem,
        b: &LayerBuffers,
        _training_pass: bool,
    ) -> Result<()> {
        let (wz, wi, wf, wo) = (b.param("Wz")?, b.param("Wi")?, b.param("Wf")?, b.param("Wo")?);
        let (rz, ri, rf, ro) = (b.param("Rz")?, b.param("Ri")?, b.param("Rf")?, b.param("Ro")?);
        let bz = b.param("bz")?.reshape((1, self.size))?;
        let bi = b.param("bi")?.reshape((1, self.size))?;
        let bf = b.param("bf")?.reshape((1, self.size))?;
        let bo = b.param("bo")?.reshape((1, self.size))?;
        let x = b.input("default")?;
        let y = b.output("default")?;
        let (za, zb) = (b.internal("Za")?, b.internal("Zb")?);
        let (ia, ib) = (b.internal("Ia")?, b.internal("Ib")?);
        let (fa, fb) = (b.internal("Fa")?, b.internal("Fb")?);
        let (oa, ob) = (b.internal("Oa")?, b.internal("Ob")?);
        let (ca, cb) = (b.internal("Ca")?, b.internal("Cb")?);

        let time = x.dims()[0] as isize;
        for t in 0..time {
            // Block input
            h.dot_mm(mem, &x.step(t)?, wz, &za.step(t)?, false, true)?;
            h.dot_add_mm(mem, &y.step(t - 1)?, rz, &za.step(t)?, false, false)?;
            h.add_mv(mem, &za.step(t)?, &bz, &za.step(t)?)?;
            (self.funcs.f)(h, mem, &za.step(t)?, &zb.step(t)?)?;

            // Input gate
            h.dot_mm(mem, &x.step(t)?, wi, &ia.step(t)?, false, true)?;
            h.dot_add_mm(mem, &y.step(t - 1)?, ri, &ia.step(t)?, false, false)?;
            h.add_mv(mem, &ia.step(t)?, &bi, &ia.step(t)?)?;
            h.sigmoid(mem, &ia.step(t)?, &ib.step(t)?)?;

            // Forget gate
            h.dot_mm(mem, &x.step(t)?, wf, &fa.step(t)?, false, true)?;
            h.dot_add_mm(mem, &y.step(t - 1)?, rf, &fa.step(t)?, false, false)?;
            h.add_mv(mem, &fa.step(t)?, &bf, &fa.step(t)?)?;
            h.sigmoid(mem, &fa.step(t)?, &fb.step(t)?)?;

            // Cell
            h.mult_tt(mem, &ib.step(t)?, &zb.step(t)?, &ca.step(t)?)?;
            h.mult_add_tt(mem, &fb.step(t)?, &ca.step(t - 1)?, &ca.step(t)?)?;

            // Output gate
            h.dot_mm(mem, &x.step(t)?, wo, &oa.step(t)?, false, true)?;
            h.dot_add_mm(mem, &y.step(t - 1)?, ro, &oa.step(t)?, false, false)?;
            h.add_mv(mem, &oa.step(t)?, &bo, &oa.step(t)?)?;
            h.sigmoid(mem, &oa.step(t)?, &ob.step(t)?)?;

            // Block output
            (self.funcs.f)(h, mem, &ca.step(t)?, &cb.step(t)?)?;
            h.mult_tt(mem, &ob.step(t)?, &cb.step(t)?, &y.step(t)?)?;
        }
        Ok(())
    }

    fn backward_pass(&self, h: &H, mem: &mut H::Mem, b: &LayerBuffers) -> Result<()> {
        let (wz, wi, wf, wo) = (b.param("Wz")?, b.param("Wi")?, b.param("Wf")?, b.param("Wo")?);
        let (rz, ri, rf, ro) = (b.param("Rz")?, b.param("Ri")?, b.param("Rf")?, b.param("Ro")?);
        let (dwz, dwi, dwf, dwo) = (
            b.gradient("Wz")?,
            b.gradient("Wi")?,
            b.gradient("Wf")?,
            b.gradient("Wo")?,
        );
        let (drz, dri, drf, dro) = (
            b.gradient("Rz")?,
            b.gradient("Ri")?,
            b.gradient("Rf")?,
            b.gradient("Ro")?,
        );
        let (dbz, dbi, dbf, dbo) = (
            b.gradient("bz")?,
            b.gradient("bi")?,
            b.gradient("bf")?,
            b.gradient("bo")?,
        );
        let x = b.input("default")?;
        let dx = b.input_delta("default")?;
        let y = b.output("default")?;
        let deltas = b.output_delta("default")?;
        let (za, zb) = (b.internal("Za")?, b.internal("Zb")?);
        let (ia, ib) = (b.internal("Ia")?, b.internal("Ib")?);
        let (fa, fb) = (b.internal("Fa")?, b.internal("Fb")?);
        let (oa, ob) = (b.internal("Oa")?, b.internal("Ob")?);
        let (ca, cb) = (b.internal("Ca")?, b.internal("Cb")?);
        let (dza, dzb) = (b.internal("dZa")?, b.internal("dZb")?);
        let (dia, dib) = (b.internal("dIa")?, b.internal("dIb")?);
        let (dfa, dfb) = (b.internal("dFa")?, b.internal("dFb")?);
        let (doa, dob) = (b.internal("dOa")?, b.internal("dOb")?);
        let (dca, dcb) = (b.internal("dCa")?, b.internal("dCb")?);
        let dy = b.internal("dy")?;
        let db_tmp = b.internal("db_tmp")?;

        let time = x.dims()[0] as isize;
        for t in (0..time).rev() {
            // Cumulate recurrent deltas into dy[t]. The t+1 rows are the
            // pre-zeroed context slots at the last step.
            h.copy_to(mem, &dy.step(t)?, &deltas.step(t)?)?;
            h.dot_add_mm(mem, &dia.step(t + 1)?, ri, &dy.step(t)?, false, true)?;
            h.dot_add_mm(mem, &dfa.step(t + 1)?, rf, &dy.step(t)?, false, true)?;
            h.dot_add_mm(mem, &doa.step(t + 1)?, ro, &dy.step(t)?, false, true)?;
            h.dot_add_mm(mem, &dza.step(t + 1)?, rz, &dy.step(t)?, false, true)?;

            // Output gate
            h.mult_tt(mem, &dy.step(t)?, &cb.step(t)?, &dob.step(t)?)?;
            h.sigmoid_deriv(mem, &oa.step(t)?, &ob.step(t)?, &dob.step(t)?, &doa.step(t)?)?;

            // Cell
            h.mult_tt(mem, &dy.step(t)?, &ob.step(t)?, &dcb.step(t)?)?;
            (self.funcs.df)(h, mem, &ca.step(t)?, &cb.step(t)?, &dcb.step(t)?, &dca.step(t)?)?;
            h.mult_add_tt(mem, &dca.step(t + 1)?, &fb.step(t + 1)?, &dca.step(t)?)?;

            // Forget gate
            h.mult_tt(mem, &dca.step(t)?, &ca.step(t - 1)?, &dfb.step(t)?)?;
            h.sigmoid_deriv(mem, &fa.step(t)?, &fb.step(t)?, &dfb.step(t)?, &dfa.step(t)?)?;

            // Input gate
            h.mult_tt(mem, &dca.step(t)?, &zb.step(t)?, &dib.step(t)?)?;
            h.sigmoid_deriv(mem, &ia.step(t)?, &ib.step(t)?, &dib.step(t)?, &dia.step(t)?)?;

            // Block input
            h.mult_tt(mem, &dca.step(t)?, &ib.step(t)?, &dzb.step(t)?)?;
            (self.funcs.df)(h, mem, &za.step(t)?, &zb.step(t)?, &dzb.step(t)?, &dza.step(t)?)?;

            // Input deltas
            h.dot_add_mm(mem, &dia.step(t)?, wi, &dx.step(t)?, false, false)?;
            h.dot_add_mm(mem, &dfa.step(t)?, wf, &dx.step(t)?, false, false)?;
            h.dot_add_mm(mem, &doa.step(t)?, wo, &dx.step(t)?, false, false)?;
            h.dot_add_mm(mem, &dza.step(t)?, wz, &dx.step(t)?, false, false)?;

            // Gradients for the input weights
            h.dot_add_mm(mem, &dia.step(t)?, &x.step(t)?, dwi, true, false)?;
            h.dot_add_mm(mem, &dfa.step(t)?, &x.step(t)?, dwf, true, false)?;
            h.dot_add_mm(mem, &doa.step(t)?, &x.step(t)?, dwo, true, false)?;
            h.dot_add_mm(mem, &dza.step(t)?, &x.step(t)?, dwz, true, false)?;

            // Gradients for the recurrent weights
            h.dot_add_mm(mem, &y.step(t)?, &dia.step(t + 1)?, dri, true, false)?;
            h.dot_add_mm(mem, &y.step(t)?, &dfa.step(t + 1)?, drf, true, false)?;
            h.dot_add_mm(mem, &y.step(t)?, &doa.step(t + 1)?, dro, true, false)?;
            h.dot_add_mm(mem, &y.step(t)?, &dza.step(t + 1)?, drz, true, false)?;

            // Biases, summed over the batch axis then accumulated over time.
            h.sum_t(mem, &dia.step(t)?, Some(0), db_tmp)?;
            h.add_tt(mem, db_tmp, dbi, dbi)?;
            h.sum_t(mem, &dfa.step(t)?, Some(0), db_tmp)?;
            h.add_tt(mem, db_tmp, dbf, dbf)?;
            h.sum_t(mem, &doa.step(t)?, Some(0), db_tmp)?;
            h.add_tt(mem, db_tmp, dbo, dbo)?;
            h.sum_t(mem, &dza.step(t)?, Some(0), db_tmp)?;
            h.add_tt(mem, db_tmp, dbz, dbz)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::HostHandler;

    fn in_shapes(features: usize) -> ShapeList {
        vec![(
            "default".to_string(),
            BufferStructure::time_batch(vec![features]),
        )]
    }

    #[test]
    fn test_parameter_shapes_per_gate() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 3})).unwrap();
        let l = LstmLayer::<HostHandler>::new("lstm", in_shapes(4), &[], &[], &kwargs).unwrap();
        assert_eq!(l.parameter_shapes.len(), 12);
        for gate in ["Wz", "Wi", "Wf", "Wo"] {
            let s = crate::layer::get_shape(&l.parameter_shapes, gate).unwrap();
            assert_eq!(s.feature_dims(), &[3, 4]);
        }
        for gate in ["Rz", "Ri", "Rf", "Ro"] {
            let s = crate::layer::get_shape(&l.parameter_shapes, gate).unwrap();
            assert_eq!(s.feature_dims(), &[3, 3]);
        }
        for gate in ["bz", "bi", "bf", "bo"] {
            let s = crate::layer::get_shape(&l.parameter_shapes, gate).unwrap();
            assert_eq!(s.feature_dims(), &[3]);
        }
    }

    #[test]
    fn test_all_gate_buffers_carry_context() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 2})).unwrap();
        let l = LstmLayer::<HostHandler>::new("lstm", in_shapes(2), &[], &[], &kwargs).unwrap();
        for name in GATE_INTERNALS.iter().chain(GATE_DELTAS.iter()) {
            let s = crate::layer::get_shape(&l.internal_shapes, name).unwrap();
            assert_eq!(s.context_size(), 1, "{} should carry a context slot", name);
        }
    }

    #[test]
    fn test_construction_is_deterministic() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 3})).unwrap();
        let a = LstmLayer::<HostHandler>::new("lstm", in_shapes(4), &[], &[], &kwargs).unwrap();
        let b = LstmLayer::<HostHandler>::new("lstm", in_shapes(4), &[], &[], &kwargs).unwrap();
        assert_eq!(a.out_shapes, b.out_shapes);
        assert_eq!(a.parameter_shapes, b.parameter_shapes);
        assert_eq!(a.internal_shapes, b.internal_shapes);
    }
}
