use crate::layer::{
    validate_connections, validate_in_shapes, validate_kwargs, Kwargs, Layer, LayerBuffers,
    ShapeList,
};
use crate::wiring::Connection;
use marten_core::{BufferStructure, Error, Handler, Result, StructureTemplate};

// SquaredError — terminal loss layer
//
//   loss[t, b] = 0.5 * Σ_f (x[t,b,f] - targets[t,b,f])²
//
// As the end of the chain it seeds the backward delta flow: the gradient of
// the total loss w.r.t. its input is the difference itself, accumulated into
// the input deltas (and negated into the target deltas).

/// Half squared difference between an input and externally supplied targets.
#[derive(Debug, Clone)]
pub struct SquaredErrorLayer {
    name: String,
    in_shapes: ShapeList,
    out_shapes: ShapeList,
    parameter_shapes: ShapeList,
    internal_shapes: ShapeList,
}

impl SquaredErrorLayer {
    pub const KIND: &'static str = "SquaredError";

    pub fn new(
        name: &str,
        in_shapes: ShapeList,
        incoming: &[&Connection],
        outgoing: &[&Connection],
        kwargs: &Kwargs,
    ) -> Result<Self> {
        validate_kwargs(name, kwargs, &[])?;
        validate_in_shapes(
            name,
            &in_shapes,
            &[
                ("default", StructureTemplate::time_batch_feature()),
                ("targets", StructureTemplate::time_batch_feature()),
            ],
        )?;
        let features = crate::layer::get_shape(&in_shapes, "default")
            .map(|s| s.feature_dims().to_vec())
            .ok_or_else(|| Error::layer(name, "missing 'default' input"))?;
        let target_features = crate::layer::get_shape(&in_shapes, "targets")
            .map(|s| s.feature_dims().to_vec())
            .ok_or_else(|| Error::layer(name, "missing 'targets' input"))?;
        if features != target_features {
            return Err(Error::layer(
                name,
                format!(
                    "'default' features {:?} and 'targets' features {:?} must match",
                    features, target_features
                ),
            ));
        }

        let out_shapes = vec![("default".to_string(), BufferStructure::time_batch(vec![1]))];
        let internal_shapes = vec![
            ("diff".to_string(), BufferStructure::time_batch(features.clone())),
            ("sqr".to_string(), BufferStructure::time_batch(features)),
        ];

        let layer = SquaredErrorLayer {
            name: name.to_string(),
            in_shapes,
            out_shapes,
            parameter_shapes: ShapeList::new(),
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
}

impl<H: Handler> Layer<H> for SquaredErrorLayer {
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

    fn is_loss(&self) -> bool {
        true
    }

    fn forward_pass(
        &self,
        h: &H,
        mem: &mut H::Mem,
        b: &LayerBuffers,
        _training_pass: bool,
    ) -> Result<()> {
        let x = b.input("default")?;
        let targets = b.input("targets")?;
        let loss = b.output("default")?;
        let diff = b.internal("diff")?;
        let sqr = b.internal("sqr")?;

        h.subtract_tt(mem, x, targets, diff)?;
        h.mult_tt(mem, diff, diff, sqr)?;
        // Row-wise feature sum over the flattened sequence.
        let flat_sqr = sqr.flatten_time()?;
        let flat_loss = loss.flatten_time()?;
        h.sum_t(mem, &flat_sqr, Some(1), &flat_loss)?;
        h.mult_st(mem, 0.5, loss, loss)
    }

    fn backward_pass(&self, h: &H, mem: &mut H::Mem, b: &LayerBuffers) -> Result<()> {
        let dx = b.input_delta("default")?;
        let dtargets = b.input_delta("targets")?;
        let diff = b.internal("diff")?;

        h.add_tt(mem, dx, diff, dx)?;
        h.mult_add_st(mem, -1.0, diff, dtargets)
    }
}
