use crate::wiring::{Category, Connection};
use marten_core::{BufferStructure, Error, Handler, Result, StructureTemplate, TensorView};
use std::collections::BTreeMap;

// Layer — the contract every layer implements
//
// A layer declares its buffer needs symbolically (shape lists) and
// implements forward/backward passes purely through Handler operations on
// views the buffer manager hands it. Layers hold no storage: all state lives
// in the shared arena, which is what lets the manager resize or swap the
// arena without coordinating with layers beyond the handler-rebind hook.
//
// Construction is three-phase and fail-fast:
//   (a) all supplied kwargs are a subset of the expected set,
//   (b) every declared input is present and matches its shape template,
//   (c) after shape setup, every wiring connection references an existing
//       input, output, parameter, or internal.
// Any failure aborts construction; no partial layer is left usable.

/// Ordered name → structure declarations for one buffer category.
pub type ShapeList = Vec<(String, BufferStructure)>;

/// Hyperparameters as passed through the architecture description.
pub type Kwargs = BTreeMap<String, serde_json::Value>;

/// Look up a declaration in a shape list.
pub fn get_shape<'a>(list: &'a ShapeList, name: &str) -> Option<&'a BufferStructure> {
    list.iter().find(|(n, _)| n == name).map(|(_, s)| s)
}

/// The resolved views for one layer during one pass: named, ordered
/// collections of concrete arena windows per buffer category. Valid only for
/// the duration of the pass that received them.
#[derive(Debug, Clone, Default)]
pub struct LayerBuffers {
    pub inputs: Vec<(String, TensorView)>,
    pub outputs: Vec<(String, TensorView)>,
    pub parameters: Vec<(String, TensorView)>,
    pub internals: Vec<(String, TensorView)>,
    pub gradients: Vec<(String, TensorView)>,
    pub input_deltas: Vec<(String, TensorView)>,
    pub output_deltas: Vec<(String, TensorView)>,
}

impl LayerBuffers {
    fn find<'a>(
        list: &'a [(String, TensorView)],
        category: &str,
        name: &str,
    ) -> Result<&'a TensorView> {
        list.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::msg(format!("no {} view named '{}'", category, name)))
    }

    pub fn input(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.inputs, "input", name)
    }

    pub fn output(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.outputs, "output", name)
    }

    pub fn param(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.parameters, "parameter", name)
    }

    pub fn internal(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.internals, "internal", name)
    }

    pub fn gradient(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.gradients, "gradient", name)
    }

    pub fn input_delta(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.input_deltas, "input delta", name)
    }

    pub fn output_delta(&self, name: &str) -> Result<&TensorView> {
        Self::find(&self.output_deltas, "output delta", name)
    }
}

/// A named unit with typed input/output/parameter/internal buffers and
/// forward/backward passes expressed in Handler operations.
pub trait Layer<H: Handler> {
    fn name(&self) -> &str;

    fn in_shapes(&self) -> &ShapeList;
    fn out_shapes(&self) -> &ShapeList;
    fn parameter_shapes(&self) -> &ShapeList;
    fn internal_shapes(&self) -> &ShapeList;

    /// Whether this layer produces a loss output summed by the network.
    fn is_loss(&self) -> bool {
        false
    }

    /// Whether this layer is the entry point for external data.
    fn is_input(&self) -> bool {
        false
    }

    /// Rebind the numeric backend. Layers with activation-function selection
    /// re-resolve their function pointers here, not at construction, so a
    /// layer can be migrated between handlers.
    fn set_handler(&mut self, _handler: &H) -> Result<()> {
        Ok(())
    }

    /// Read inputs/parameters, write outputs/internals. Must be safe to call
    /// repeatedly with different batch contents without re-validation.
    /// `training_pass = false` lets stochastic layers skip randomness.
    fn forward_pass(
        &self,
        handler: &H,
        mem: &mut H::Mem,
        buffers: &LayerBuffers,
        training_pass: bool,
    ) -> Result<()>;

    /// Read outputs, output deltas, and internals retained from the forward
    /// pass; write input deltas and accumulate into gradients, never
    /// overwrite them, as multiple time steps and downstream consumers
    /// contribute additively.
    fn backward_pass(&self, handler: &H, mem: &mut H::Mem, buffers: &LayerBuffers) -> Result<()>;
}

//  Construction validation helpers, shared by every layer implementation.

/// Phase (a): all supplied kwargs must be expected.
pub fn validate_kwargs(layer: &str, kwargs: &Kwargs, expected: &[&str]) -> Result<()> {
    let unexpected: Vec<&str> = kwargs
        .keys()
        .map(|k| k.as_str())
        .filter(|k| !expected.contains(k))
        .collect();
    if !unexpected.is_empty() {
        return Err(Error::layer(
            layer,
            format!(
                "unexpected kwargs {:?}, choices are {:?}",
                unexpected, expected
            ),
        ));
    }
    Ok(())
}

/// Phase (b): every declared input is present, nothing extra is connected,
/// and each input matches its template.
pub fn validate_in_shapes(
    layer: &str,
    in_shapes: &ShapeList,
    expected: &[(&str, StructureTemplate)],
) -> Result<()> {
    for (name, _) in in_shapes {
        if !expected.iter().any(|(n, _)| *n == name.as_str()) {
            return Err(Error::layer(
                layer,
                format!(
                    "layer has no input named '{}', choices are {:?}",
                    name,
                    expected.iter().map(|(n, _)| *n).collect::<Vec<_>>()
                ),
            ));
        }
    }
    for (name, template) in expected {
        match get_shape(in_shapes, name) {
            None => {
                return Err(Error::layer(
                    layer,
                    format!("all inputs need to be connected, missing '{}'", name),
                ))
            }
            Some(structure) => {
                if !template.matches(structure) {
                    return Err(Error::layer(
                        layer,
                        format!(
                            "input '{}' with shape {:?} does not match template {}",
                            name,
                            structure.feature_dims(),
                            template
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Phase (c): every wiring connection touching this layer must reference an
/// existing input, output, parameter, or internal.
pub fn validate_connections(
    layer: &str,
    incoming: &[&Connection],
    outgoing: &[&Connection],
    in_shapes: &ShapeList,
    out_shapes: &ShapeList,
    parameter_shapes: &ShapeList,
    internal_shapes: &ShapeList,
) -> Result<()> {
    for conn in incoming {
        if get_shape(in_shapes, &conn.sink_input).is_none() {
            return Err(Error::layer(
                layer,
                format!(
                    "invalid incoming connection ({}): no input named '{}'",
                    conn, conn.sink_input
                ),
            ));
        }
    }
    for conn in outgoing {
        let (list, category) = match conn.src.category {
            Category::Outputs => (out_shapes, "output"),
            Category::Parameters => (parameter_shapes, "parameter"),
            Category::Internals => (internal_shapes, "internal"),
        };
        if get_shape(list, &conn.src.name).is_none() {
            return Err(Error::layer(
                layer,
                format!(
                    "invalid outgoing connection ({}): no {} named '{}'",
                    conn, category, conn.src.name
                ),
            ));
        }
    }
    Ok(())
}

//  Kwarg extraction helpers.

pub fn kwarg_usize(layer: &str, kwargs: &Kwargs, key: &str) -> Result<Option<usize>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(v) => v.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
            Error::layer(layer, format!("kwarg '{}' must be an integer, got {}", key, v))
        }),
    }
}

pub fn kwarg_str<'a>(layer: &str, kwargs: &'a Kwargs, key: &str) -> Result<Option<&'a str>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(v) => v.as_str().map(Some).ok_or_else(|| {
            Error::layer(layer, format!("kwarg '{}' must be a string, got {}", key, v))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::BufferStructure;

    #[test]
    fn test_validate_kwargs_rejects_unknown() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("size".into(), serde_json::json!(4));
        assert!(validate_kwargs("l", &kwargs, &["size"]).is_ok());
        kwargs.insert("bogus".into(), serde_json::json!(1));
        let err = validate_kwargs("l", &kwargs, &["size"]).unwrap_err();
        assert!(matches!(err, Error::LayerValidation { .. }));
    }

    #[test]
    fn test_validate_in_shapes_missing_input() {
        let expected = [("default", StructureTemplate::time_batch_feature())];
        let err = validate_in_shapes("l", &vec![], &expected).unwrap_err();
        assert!(matches!(err, Error::LayerValidation { .. }));
    }

    #[test]
    fn test_validate_in_shapes_template_mismatch() {
        let expected = [("default", StructureTemplate::time_batch_feature())];
        let shapes = vec![("default".to_string(), BufferStructure::fixed(vec![3]))];
        assert!(validate_in_shapes("l", &shapes, &expected).is_err());
        let shapes = vec![("default".to_string(), BufferStructure::time_batch(vec![3]))];
        assert!(validate_in_shapes("l", &shapes, &expected).is_ok());
    }

    #[test]
    fn test_layer_buffers_lookup() {
        let b = LayerBuffers {
            inputs: vec![("default".into(), TensorView::new(0, (2, 2)))],
            ..Default::default()
        };
        assert!(b.input("default").is_ok());
        assert!(b.input("other").is_err());
        assert!(b.output("default").is_err());
    }
}
