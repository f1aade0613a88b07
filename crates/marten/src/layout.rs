use marten_core::{BufferStructure, Error, Handler, Result, Scaling};
use marten_nn::wiring::Category;
use marten_nn::{Connection, Layer};

// Layout — from wiring graph to one concrete memory plan
//
// Every distinct buffer is allocated exactly once. An output feeding a
// downstream input is a single allocation with two references (a "hub"):
// the producing layer's view and the consuming layer's view address the same
// region, which is how activations pass between layers without copying. The
// backward twins (output deltas / input deltas) share a hub the same way, so
// every consumer's delta contribution accumulates into one region.
//
// The arena is ordered [parameters | gradients | forward data | backward
// data]. Parameter and gradient offsets are fixed here, once; data hub
// offsets depend on the symbolic time/batch sizes and are re-derived by the
// buffer manager on every resize.
//
// Context-carrying buffers store their extra step as the trailing time row,
// so a consumer's view is simply the T-step prefix of the producer's
// (T+1)-step hub.

/// One shared memory region backing one or more buffer references.
#[derive(Debug, Clone)]
pub struct Hub {
    pub structure: BufferStructure,
    /// Backward hubs live in the trailing arena region zeroed before every
    /// backward pass.
    pub backward: bool,
}

/// One named buffer reference inside a layer plan.
#[derive(Debug, Clone)]
pub struct BufEntry {
    pub name: String,
    pub hub: usize,
    /// The shape this layer sees; may be the context-free prefix of the
    /// hub's structure.
    pub structure: BufferStructure,
}

/// A parameter (or its gradient twin) at a fixed offset in the parameter
/// region.
#[derive(Debug, Clone)]
pub struct ParamEntry {
    pub name: String,
    pub offset: usize,
    pub structure: BufferStructure,
}

/// The resolved buffer references of one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerPlan {
    pub name: String,
    pub inputs: Vec<BufEntry>,
    pub outputs: Vec<BufEntry>,
    pub internals: Vec<BufEntry>,
    pub input_deltas: Vec<BufEntry>,
    pub output_deltas: Vec<BufEntry>,
    pub parameters: Vec<ParamEntry>,
}

/// The complete memory plan for a network.
#[derive(Debug, Clone)]
pub struct Layout {
    pub hubs: Vec<Hub>,
    pub layers: Vec<LayerPlan>,
    /// Element count of the parameter region (the gradient region mirrors
    /// it exactly).
    pub param_size: usize,
}

impl Layout {
    /// Hub ids of forward, context-carrying buffers, in id order.
    pub fn context_hubs(&self) -> impl Iterator<Item = usize> + '_ {
        self.hubs
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.backward && h.structure.context_size() == 1)
            .map(|(i, _)| i)
    }
}

/// Turn instantiated layers plus the wiring graph into a memory plan.
pub fn create_layout<H: Handler>(
    layers: &[Box<dyn Layer<H>>],
    connections: &[Connection],
) -> Result<Layout> {
    let mut hubs: Vec<Hub> = Vec::new();
    let mut plans: Vec<LayerPlan> = Vec::new();
    // (layer, buffer) -> (forward hub, delta hub) for outputs,
    // (layer, buffer) -> forward hub for internals.
    let mut output_hubs: Vec<(String, String, usize, usize)> = Vec::new();
    let mut internal_hubs: Vec<(String, String, usize)> = Vec::new();

    let mut param_size = 0usize;

    for layer in layers {
        let mut plan = LayerPlan {
            name: layer.name().to_string(),
            ..Default::default()
        };

        for (name, structure) in layer.parameter_shapes() {
            structure.validate()?;
            if structure.scaling() != Scaling::Fixed {
                return Err(Error::network(format!(
                    "parameter {}.{} must have a fixed shape",
                    layer.name(),
                    name
                )));
            }
            plan.parameters.push(ParamEntry {
                name: name.clone(),
                offset: param_size,
                structure: structure.clone(),
            });
            param_size += structure.feature_size();
        }

        for (name, structure) in layer.out_shapes() {
            structure.validate()?;
            let fwd = hubs.len();
            hubs.push(Hub {
                structure: structure.clone(),
                backward: false,
            });
            let bwd = hubs.len();
            hubs.push(Hub {
                structure: structure.clone(),
                backward: true,
            });
            output_hubs.push((layer.name().to_string(), name.clone(), fwd, bwd));
            plan.outputs.push(BufEntry {
                name: name.clone(),
                hub: fwd,
                structure: structure.clone(),
            });
            plan.output_deltas.push(BufEntry {
                name: name.clone(),
                hub: bwd,
                structure: structure.clone(),
            });
        }

        for (name, structure) in layer.internal_shapes() {
            structure.validate()?;
            let id = hubs.len();
            hubs.push(Hub {
                structure: structure.clone(),
                backward: structure.is_backward_only(),
            });
            internal_hubs.push((layer.name().to_string(), name.clone(), id));
            plan.internals.push(BufEntry {
                name: name.clone(),
                hub: id,
                structure: structure.clone(),
            });
        }

        plans.push(plan);
    }

    // Second pass: resolve inputs onto the hubs their sources own.
    for (layer, plan) in layers.iter().zip(plans.iter_mut()) {
        for (input_name, structure) in layer.in_shapes() {
            structure.validate()?;
            let conn = connections
                .iter()
                .find(|c| c.sink_layer == layer.name() && c.sink_input == *input_name)
                .ok_or_else(|| {
                    Error::network(format!(
                        "input {}.{} has no incoming connection",
                        layer.name(),
                        input_name
                    ))
                })?;
            match conn.src.category {
                Category::Outputs => {
                    let (_, _, fwd, bwd) = output_hubs
                        .iter()
                        .find(|(l, n, _, _)| *l == conn.src_layer && *n == conn.src.name)
                        .ok_or_else(|| {
                            Error::network(format!("dangling connection ({})", conn))
                        })?;
                    plan.inputs.push(BufEntry {
                        name: input_name.clone(),
                        hub: *fwd,
                        structure: structure.clone(),
                    });
                    plan.input_deltas.push(BufEntry {
                        name: input_name.clone(),
                        hub: *bwd,
                        structure: structure.clone(),
                    });
                }
                Category::Internals => {
                    let (_, _, fwd) = internal_hubs
                        .iter()
                        .find(|(l, n, _)| *l == conn.src_layer && *n == conn.src.name)
                        .ok_or_else(|| {
                            Error::network(format!("dangling connection ({})", conn))
                        })?;
                    plan.inputs.push(BufEntry {
                        name: input_name.clone(),
                        hub: *fwd,
                        structure: structure.clone(),
                    });
                    // A monitoring tap gets its own delta sink; internal
                    // buffers have no backward twin to feed.
                    let bwd = hubs.len();
                    hubs.push(Hub {
                        structure: structure.clone(),
                        backward: true,
                    });
                    plan.input_deltas.push(BufEntry {
                        name: input_name.clone(),
                        hub: bwd,
                        structure: structure.clone(),
                    });
                }
                Category::Parameters => {
                    return Err(Error::network(format!(
                        "parameters cannot feed inputs ({})",
                        conn
                    )))
                }
            }
        }
    }

    Ok(Layout {
        hubs,
        layers: plans,
        param_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{instantiate_layers_from_architecture, Architecture};
    use marten_core::HostHandler;

    fn chain_arch() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_layer(
            "Input",
            "Input",
            serde_json::json!({"out_shapes": {"default": [4]}}),
        )
        .unwrap();
        arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 3})).unwrap();
        arch.add_layer("fc", "FullyConnected", serde_json::json!({"size": 2}))
            .unwrap();
        arch.connect("Input", "default", "rnn", "default").unwrap();
        arch.connect("rnn", "default", "fc", "default").unwrap();
        arch
    }

    #[test]
    fn test_wired_buffers_share_a_hub() {
        let (layers, conns) =
            instantiate_layers_from_architecture::<HostHandler>(&chain_arch()).unwrap();
        let layout = create_layout(&layers, &conns).unwrap();

        let rnn = layout.layers.iter().find(|p| p.name == "rnn").unwrap();
        let fc = layout.layers.iter().find(|p| p.name == "fc").unwrap();
        // fc's input is rnn's output, forward and backward.
        assert_eq!(rnn.outputs[0].hub, fc.inputs[0].hub);
        assert_eq!(rnn.output_deltas[0].hub, fc.input_deltas[0].hub);
        // The consumer sees the context-free prefix.
        assert_eq!(fc.inputs[0].structure.context_size(), 0);
        assert_eq!(layout.hubs[rnn.outputs[0].hub].structure.context_size(), 1);
    }

    #[test]
    fn test_param_offsets_are_disjoint_and_packed() {
        let (layers, conns) =
            instantiate_layers_from_architecture::<HostHandler>(&chain_arch()).unwrap();
        let layout = create_layout(&layers, &conns).unwrap();
        let mut expected = 0;
        for plan in &layout.layers {
            for p in &plan.parameters {
                assert_eq!(p.offset, expected);
                expected += p.structure.feature_size();
            }
        }
        // rnn: W 3x4 + R 3x3 + bias 3; fc: W 2x3 + bias 2.
        assert_eq!(layout.param_size, 12 + 9 + 3 + 6 + 2);
        assert_eq!(layout.param_size, expected);
    }

    #[test]
    fn test_backward_hubs_flagged() {
        let (layers, conns) =
            instantiate_layers_from_architecture::<HostHandler>(&chain_arch()).unwrap();
        let layout = create_layout(&layers, &conns).unwrap();
        let rnn = layout.layers.iter().find(|p| p.name == "rnn").unwrap();
        for e in &rnn.output_deltas {
            assert!(layout.hubs[e.hub].backward);
        }
        let dha = rnn.internals.iter().find(|e| e.name == "dHa").unwrap();
        assert!(layout.hubs[dha.hub].backward);
        let ha = rnn.internals.iter().find(|e| e.name == "Ha").unwrap();
        assert!(!layout.hubs[ha.hub].backward);
    }

    #[test]
    fn test_context_hubs_listed() {
        let (layers, conns) =
            instantiate_layers_from_architecture::<HostHandler>(&chain_arch()).unwrap();
        let layout = create_layout(&layers, &conns).unwrap();
        // rnn output y and internal Ha carry context; backward twins do not
        // count.
        let hubs: Vec<usize> = layout.context_hubs().collect();
        assert_eq!(hubs.len(), 2);
    }
}
