use crate::activation::{self, ActFuncs, Activation};
use crate::layer::{
    kwarg_str, kwarg_usize, validate_connections, validate_in_shapes, validate_kwargs, Kwargs,
    Layer, LayerBuffers, ShapeList,
};
use crate::wiring::Connection;
use marten_core::{BufferStructure, Handler, Result, StructureTemplate};

// FullyConnected — y = act(W·x + bias)
//
// The whole sequence is treated as one flattened (Time*Batch, Feature)
// matrix: there is no recurrence, so both passes are single matrix products
// plus the activation.

/// A fully connected (dense) layer over flattened time.
#[derive(Debug, Clone)]
pub struct FullyConnectedLayer<H: Handler> {
    name: String,
    size: usize,
    act: Activation,
    funcs: ActFuncs<H>,
    in_shapes: ShapeList,
    out_shapes: ShapeList,
    parameter_shapes: ShapeList,
    internal_shapes: ShapeList,
}

impl<H: Handler> FullyConnectedLayer<H> {
    pub const KIND: &'static str = "FullyConnected";

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
            None => Activation::Rel,
        };

        let out_shapes = vec![("default".to_string(), BufferStructure::time_batch(vec![size]))];
        let parameter_shapes = vec![
            ("W".to_string(), BufferStructure::fixed(vec![size, in_size])),
            ("bias".to_string(), BufferStructure::fixed(vec![size])),
        ];
        let internal_shapes = vec![
            ("Ha".to_string(), BufferStructure::time_batch(vec![size])),
            (
                "dHa".to_string(),
                BufferStructure::time_batch(vec![size]).backward_only(),
            ),
            (
                "db_tmp".to_string(),
                BufferStructure::fixed(vec![size]).backward_only(),
            ),
        ];

        let layer = FullyConnectedLayer {
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

impl<H: Handler> Layer<H> for FullyConnectedLayer<H> {
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
        let bias = b.param("bias")?;
        let x = b.input("default")?;
        let y = b.output("default")?;
        let ha = b.internal("Ha")?;

        let flat_x = x.flatten_time()?;
        let flat_ha = ha.flatten_time()?;
        h.dot_mm(mem, &flat_x, w, &flat_ha, false, true)?;
        h.add_mv(mem, &flat_ha, &bias.reshape((1, self.size))?, &flat_ha)?;
        (self.funcs.f)(h, mem, ha, y)
    }

    fn backward_pass(&self, h: &H, mem: &mut H::Mem, b: &LayerBuffers) -> Result<()> {
        let w = b.param("W")?;
        let dw = b.gradient("W")?;
        let dbias = b.gradient("bias")?;
        let x = b.input("default")?;
        let y = b.output("default")?;
        let dx = b.input_delta("default")?;
        let dy = b.output_delta("default")?;
        let ha = b.internal("Ha")?;
        let dha = b.internal("dHa")?;
        let db_tmp = b.internal("db_tmp")?;

        (self.funcs.df)(h, mem, ha, y, dy, dha)?;

        let flat_x = x.flatten_time()?;
        let flat_dx = dx.flatten_time()?;
        let flat_dha = dha.flatten_time()?;
        h.dot_add_mm(mem, &flat_dha, w, &flat_dx, false, false)?;
        h.dot_add_mm(mem, &flat_dha, &flat_x, dw, true, false)?;
        h.sum_t(mem, &flat_dha, Some(0), db_tmp)?;
        h.add_tt(mem, dbias, db_tmp, dbias)
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
        let kwargs: Kwargs =
            serde_json::from_value(serde_json::json!({"size": 5, "activation_function": "tanh"}))
                .unwrap();
        let l = FullyConnectedLayer::<HostHandler>::new("fc", in_shapes(3), &[], &[], &kwargs)
            .unwrap();
        assert_eq!(l.size(), 5);
        let (_, w) = &Layer::<HostHandler>::parameter_shapes(&l)[0];
        assert_eq!(w.feature_dims(), &[5, 3]);
    }

    #[test]
    fn test_size_defaults_to_input_features() {
        let l = FullyConnectedLayer::<HostHandler>::new("fc", in_shapes(3), &[], &[], &Kwargs::new())
            .unwrap();
        assert_eq!(l.size(), 3);
    }

    #[test]
    fn test_rejects_unknown_activation() {
        let kwargs: Kwargs =
            serde_json::from_value(serde_json::json!({"activation_function": "swish"})).unwrap();
        assert!(
            FullyConnectedLayer::<HostHandler>::new("fc", in_shapes(3), &[], &[], &kwargs).is_err()
        );
    }

    #[test]
    fn test_construction_is_deterministic() {
        let kwargs: Kwargs = serde_json::from_value(serde_json::json!({"size": 4})).unwrap();
        let a = FullyConnectedLayer::<HostHandler>::new("fc", in_shapes(3), &[], &[], &kwargs)
            .unwrap();
        let b = FullyConnectedLayer::<HostHandler>::new("fc", in_shapes(3), &[], &[], &kwargs)
            .unwrap();
        assert_eq!(a.out_shapes, b.out_shapes);
        assert_eq!(a.parameter_shapes, b.parameter_shapes);
        assert_eq!(a.internal_shapes, b.internal_shapes);
    }
}
