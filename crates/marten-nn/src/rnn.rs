use crate::activation::{self, ActFuncs, Activation};
use crate::layer::{
    kwarg_str, kwarg_usize, validate_connections, validate_in_shapes, validate_kwargs, Kwargs,
    Layer, LayerBuffers, ShapeList,
};
use crate::wiring::Connection;
use marten_core::{BufferStructure, Handler, Result, StructureTemplate};

// Rnn — simple recurrent layer
//
//   H[t] = W·x[t] + R·y[t-1] + bias
//   y[t] = act(H[t])
//
// The input-weight contribution for all time steps is one flattened
// (Time*Batch, Feature) matrix product before the sequential loop; only the
// recurrent term is computed per step. The output and the pre-activation
// buffer carry a context slot so y[-1] reads the initial recurrent state.

/// A simple recurrent layer over `[Time, Batch, Feature]` input.
#[derive(Debug, Clone)]
pub struct RnnLayer<H: Handler> {
    name: String,
    size: usize,
    act: Activation,
    funcs: ActFuncs<H>,
    in_shapes: ShapeList,
    out_shapes: ShapeList,
    parameter_shapes: ShapeList,
    internal_shapes: ShapeList,
}

impl<H: Handler> RnnLayer<H> {
    pub const KIND: &'static str = "Rnn";

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
        let parameter_shapes = vec![
            ("W".to_string(), BufferStructure::fixed(vec![size, in_size])),
            ("R".to_string(), BufferStructure::fixed(vec![size, size])),
            ("bias".to_string(), BufferStructure::fixed(vec![size])),
        ];
        let internal_shapes = vec![
            (
                "Ha".to_string(),
                BufferStructure::time_batch(vec![size]).with_context(),
            ),
            (
                "dHa".to_string(),
                BufferStructure::time_batch(vec![size])
                    .with_context()
                    .backward_only(),
            ),
            (
                "dHb".to_string(),
                BufferStructure::time_batch(vec![size])
                    .with_context()
                    .backward_only(),
            ),
            (
                "db_tmp".to_string(),
                BufferStructure::fixed(vec![size]).backward_only(),
            ),
        ];

        let layer = RnnLayer {
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

impl<H: Handler> Layer<H> for RnnLayer<H> {
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
        let w = b.param("W")?;
        let r = b.param("R")?;
        let bias = b.param("bias")?;
        let x = b.input("default")?;
        let y = b.output("default")?;
        let ha = b.internal("Ha")?;

        let time = x.dims()[0];

        // Input contribution for every step at once.
        let flat_x = x.flatten_time()?;
        let flat_h = ha.steps(0, time)?.flatten_time()?;
        h.dot_mm(mem, &flat_x, w, &flat_h, false, true)?;
        h.add_mv(mem, &flat_h, &bias.reshape((1, self.size))?, &flat_h)?;

        // The recurrent term is inherently sequential.
        for t in 0..time as isize {
            h.dot_add_mm(mem, &y.step(t - 1)?, r, &ha.step(t)?, false, false)?;
            (self.funcs.f)(h, mem, &ha.step(t)?, &y.step(t)?)?;
        }
        Ok(())
    }

    fn backward_pass(&self, h: &H, mem: &mut H::Mem, b: &LayerBuffers) -> Result<()> {
        let w = b.param("W")?;
        let r = b.param("R")?;
        let dw = b.gradient("W")?;
        let dr = b.gradient("R")?;
        let dbias = b.gradient("bias")?;
        let x = b.input("default")?;
        let y = b.output("default")?;
        let dx = b.input_delta("default")?;
        let dy = b.output_delta("default")?;
        let ha = b.internal("Ha")?;
        let dha = b.internal("dHa")?;
        let dhb = b.internal("dHb")?;
        let db_tmp = b.internal("db_tmp")?;

        let time = x.dims()[0];
        let last = time as isize - 1;

        // Walk time backwards, folding the recurrent delta into dHb before
        // applying the activation derivative. The context row of dHa is
        // pre-zeroed, so the t+1 term vanishes at the last step.
        h.copy_to(mem, dhb, dy)?;
        (self.funcs.df)(h, mem, &ha.step(last)?, &y.step(last)?, &dhb.step(last)?, &dha.step(last)?)?;
        for t in (0..last).rev() {
            h.dot_add_mm(mem, &dha.step(t + 1)?, r, &dhb.step(t)?, false, true)?;
            (self.funcs.df)(h, mem, &ha.step(t)?, &y.step(t)?, &dhb.step(t)?, &dha.step(t)?)?;
        }

        // Input deltas and input-weight/bias gradients in one flattened pass.
        let flat_x = x.flatten_time()?;
        let flat_dx = dx.flatten_time()?;
        let flat_dha = dha.steps(0, time)?.flatten_time()?;
        h.dot_add_mm(mem, &flat_dha, w, &flat_dx, false, false)?;
        h.dot_add_mm(mem, &flat_dha, &flat_x, dw, true, false)?;
        h.sum_t(mem, &flat_dha, Some(0), db_tmp)?;
        h.add_tt(mem, dbias, db_tmp, dbias)?;

        // Recurrent-weight gradient needs y[t-1] per step: one flattened
        // product over steps 1.. plus the context-slot term for t = 0.
        let flat_y = y.steps(0, time - 1)?.flatten_time()?;
        let flat_dha_tail = dha.steps(1, time)?.flatten_time()?;
        h.dot_add_mm(mem, &flat_y, &flat_dha_tail, dr, true, false)?;
        h.dot_add_mm(mem, &y.step(-1)?, &dha.step(0)?, dr, true, false)
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
    fn test_shapes() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 3})).unwrap();
        let l = RnnLayer::<HostHandler>::new("rnn", in_shapes(4), &[], &[], &kwargs).unwrap();
        assert_eq!(l.size(), 3);
        let (_, out) = &l.out_shapes[0];
        assert_eq!(out.feature_dims(), &[3]);
        assert_eq!(out.context_size(), 1);
        let (_, w) = &l.parameter_shapes[0];
        assert_eq!(w.feature_dims(), &[3, 4]);
        let (_, r) = &l.parameter_shapes[1];
        assert_eq!(r.feature_dims(), &[3, 3]);
    }

    #[test]
    fn test_backward_internals_flagged() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 3})).unwrap();
        let l = RnnLayer::<HostHandler>::new("rnn", in_shapes(4), &[], &[], &kwargs).unwrap();
        let forward: Vec<&str> = l
            .internal_shapes
            .iter()
            .filter(|(_, s)| !s.is_backward_only())
            .map(|(n, _)| n.as_str())
            .collect();
        assert_eq!(forward, vec!["Ha"]);
    }

    #[test]
    fn test_construction_is_deterministic() {
        let kwargs: Kwargs =
            serde_json::from_value(serde_json::json!({"size": 3, "activation_function": "rel"}))
                .unwrap();
        let a = RnnLayer::<HostHandler>::new("rnn", in_shapes(4), &[], &[], &kwargs).unwrap();
        let b = RnnLayer::<HostHandler>::new("rnn", in_shapes(4), &[], &[], &kwargs).unwrap();
        assert_eq!(a.out_shapes, b.out_shapes);
        assert_eq!(a.parameter_shapes, b.parameter_shapes);
        assert_eq!(a.internal_shapes, b.internal_shapes);
    }

    #[test]
    fn test_rejects_bad_kwargs() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"hidden": 3})).unwrap();
        assert!(RnnLayer::<HostHandler>::new("rnn", in_shapes(4), &[], &[], &kwargs).is_err());
    }
}
