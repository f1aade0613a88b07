use crate::layer::{
    validate_connections, validate_in_shapes, validate_kwargs, Kwargs, Layer, LayerBuffers,
    ShapeList,
};
use crate::wiring::Connection;
use marten_core::{BufferStructure, Error, Handler, Result};

// Input layer — entry point for external data
//
// Declares one output per external data item; the network writes these
// outputs from host arrays before each forward pass. Both passes are no-ops.

/// The layer external data flows in through.
#[derive(Debug, Clone)]
pub struct InputLayer {
    name: String,
    in_shapes: ShapeList,
    out_shapes: ShapeList,
    parameter_shapes: ShapeList,
    internal_shapes: ShapeList,
}

impl InputLayer {
    pub const KIND: &'static str = "Input";

    /// Expected kwargs: `out_shapes`, an object mapping each external data
    /// name to its feature dimensions, e.g. `{"default": [4]}`. Every output
    /// is `[Time, Batch, features...]`.
    pub fn new(
        name: &str,
        in_shapes: ShapeList,
        incoming: &[&Connection],
        outgoing: &[&Connection],
        kwargs: &Kwargs,
    ) -> Result<Self> {
        validate_kwargs(name, kwargs, &["out_shapes"])?;
        validate_in_shapes(name, &in_shapes, &[])?;

        let spec = kwargs
            .get("out_shapes")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::layer(name, "kwarg 'out_shapes' must be an object"))?;
        let mut out_shapes = ShapeList::new();
        for (out_name, dims) in spec {
            let dims: Vec<usize> = dims
                .as_array()
                .and_then(|a| a.iter().map(|d| d.as_u64().map(|d| d as usize)).collect())
                .ok_or_else(|| {
                    Error::layer(
                        name,
                        format!("out_shapes entry '{}' must be an array of integers", out_name),
                    )
                })?;
            let structure = BufferStructure::time_batch(dims);
            structure.validate()?;
            out_shapes.push((out_name.clone(), structure));
        }
        if out_shapes.is_empty() {
            return Err(Error::layer(name, "out_shapes must declare at least one output"));
        }

        let layer = InputLayer {
            name: name.to_string(),
            in_shapes,
            out_shapes,
            parameter_shapes: ShapeList::new(),
            internal_shapes: ShapeList::new(),
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
}

impl<H: Handler> Layer<H> for InputLayer {
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

    fn is_input(&self) -> bool {
        true
    }

    fn forward_pass(
        &self,
        _handler: &H,
        _mem: &mut H::Mem,
        _buffers: &LayerBuffers,
        _training_pass: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn backward_pass(&self, _handler: &H, _mem: &mut H::Mem, _buffers: &LayerBuffers) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(json: serde_json::Value) -> Kwargs {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_declares_outputs_from_kwargs() {
        let l = InputLayer::new(
            "Input",
            ShapeList::new(),
            &[],
            &[],
            &kwargs(serde_json::json!({"out_shapes": {"default": [4], "targets": [3]}})),
        )
        .unwrap();
        assert_eq!(l.out_shapes.len(), 2);
        let (_, s) = &l.out_shapes[0];
        assert_eq!(s.feature_dims(), &[4]);
    }

    #[test]
    fn test_rejects_connected_inputs() {
        let shapes = vec![("default".to_string(), BufferStructure::time_batch(vec![3]))];
        let err = InputLayer::new(
            "Input",
            shapes,
            &[],
            &[],
            &kwargs(serde_json::json!({"out_shapes": {"default": [4]}})),
        )
        .unwrap_err();
        assert!(matches!(err, Error::LayerValidation { .. }));
    }

    #[test]
    fn test_rejects_missing_out_shapes() {
        assert!(InputLayer::new("Input", ShapeList::new(), &[], &[], &Kwargs::new()).is_err());
    }
}
