use marten_core::{BufferStructure, Error, Handler, Result};
use marten_nn::wiring::Category;
use marten_nn::{
    layer::get_shape, Connection, FullyConnectedLayer, InputLayer, Kwargs, Layer, LstmLayer,
    RnnLayer, SourceRef, SquaredErrorLayer,
};
use serde::{Deserialize, Serialize};

// Architecture — the JSON-serializable network description
//
// Maps layer names to their type, hyperparameters, and outgoing connection
// specs. The description is the unit of persistence: saving a network stores
// it verbatim, loading rebuilds an identical layout from it.
//
// Layer types are a closed set dispatched by match, not a runtime registry:
// adding a layer kind means adding an arm to `build_layer`.

/// One outgoing connection in a layer description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Source buffer: an output name, or `..internals.Name` for a tap.
    #[serde(default = "default_name")]
    pub output: String,
    pub to_layer: String,
    #[serde(default = "default_name")]
    pub to_input: String,
}

fn default_name() -> String {
    "default".to_string()
}

/// One layer in the description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    #[serde(default)]
    pub outgoing: Vec<ConnectionSpec>,
}

/// The full architecture: an ordered list of layer specs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Architecture {
    pub layers: Vec<LayerSpec>,
}

impl Architecture {
    pub fn new() -> Self {
        Architecture::default()
    }

    /// Append a layer spec; `kwargs` must be a JSON object.
    pub fn add_layer(
        &mut self,
        name: &str,
        kind: &str,
        kwargs: serde_json::Value,
    ) -> Result<&mut Self> {
        let kwargs: Kwargs = serde_json::from_value(kwargs)
            .map_err(|e| Error::network(format!("kwargs for '{}' must be an object: {}", name, e)))?;
        if self.layers.iter().any(|l| l.name == name) {
            return Err(Error::network(format!("duplicate layer name '{}'", name)));
        }
        self.layers.push(LayerSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            kwargs,
            outgoing: Vec::new(),
        });
        Ok(self)
    }

    /// Wire `src_layer.output -> sink_layer.sink_input`.
    pub fn connect(
        &mut self,
        src_layer: &str,
        output: &str,
        sink_layer: &str,
        sink_input: &str,
    ) -> Result<&mut Self> {
        let spec = self
            .layers
            .iter_mut()
            .find(|l| l.name == src_layer)
            .ok_or_else(|| Error::network(format!("no layer named '{}'", src_layer)))?;
        spec.outgoing.push(ConnectionSpec {
            output: output.to_string(),
            to_layer: sink_layer.to_string(),
            to_input: sink_input.to_string(),
        });
        Ok(self)
    }
}

/// Resolve the declared structure a connection source produces.
pub(crate) fn source_structure<H: Handler>(
    layer: &dyn Layer<H>,
    src: &SourceRef,
) -> Result<BufferStructure> {
    let list = match src.category {
        Category::Outputs => layer.out_shapes(),
        Category::Internals => layer.internal_shapes(),
        Category::Parameters => {
            return Err(Error::network(format!(
                "parameters cannot feed inputs ({}.{})",
                layer.name(),
                src
            )))
        }
    };
    get_shape(list, &src.name).cloned().ok_or_else(|| {
        Error::network(format!(
            "layer '{}' has no {} buffer named '{}'",
            layer.name(),
            match src.category {
                Category::Outputs => "output",
                Category::Internals => "internal",
                Category::Parameters => "parameter",
            },
            src.name
        ))
    })
}

/// Build Layer objects from an architecture description.
///
/// Layers are instantiated in topological wiring order (a layer's inputs are
/// always produced by already-resolved outputs); the returned connection
/// list uses the same resolved source references. All structural validation
/// happens here, once, by inspection alone.
#[allow(clippy::type_complexity)]
pub fn instantiate_layers_from_architecture<H: Handler>(
    arch: &Architecture,
) -> Result<(Vec<Box<dyn Layer<H>>>, Vec<Connection>)> {
    // Unique names, known sink layers.
    for (i, spec) in arch.layers.iter().enumerate() {
        if arch.layers[..i].iter().any(|l| l.name == spec.name) {
            return Err(Error::network(format!("duplicate layer name '{}'", spec.name)));
        }
    }
    let mut connections = Vec::new();
    for spec in &arch.layers {
        for conn in &spec.outgoing {
            if !arch.layers.iter().any(|l| l.name == conn.to_layer) {
                return Err(Error::network(format!(
                    "connection from '{}' targets unknown layer '{}'",
                    spec.name, conn.to_layer
                )));
            }
            connections.push(Connection {
                src_layer: spec.name.clone(),
                src: SourceRef::parse(&conn.output)?,
                sink_layer: conn.to_layer.clone(),
                sink_input: conn.to_input.clone(),
            });
        }
    }

    // An input may be fed by at most one source.
    for (i, conn) in connections.iter().enumerate() {
        if connections[..i]
            .iter()
            .any(|c| c.sink_layer == conn.sink_layer && c.sink_input == conn.sink_input)
        {
            return Err(Error::network(format!(
                "input {}.{} is fed by more than one connection",
                conn.sink_layer, conn.sink_input
            )));
        }
    }

    // Kahn's algorithm over the wiring graph, seeded in declaration order.
    let n = arch.layers.len();
    let index_of = |name: &str| arch.layers.iter().position(|l| l.name == name);
    let mut in_degree = vec![0usize; n];
    for conn in &connections {
        if let Some(sink) = index_of(&conn.sink_layer) {
            in_degree[sink] += 1;
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(&i) = queue.first() {
        queue.remove(0);
        order.push(i);
        for conn in &connections {
            if conn.src_layer == arch.layers[i].name {
                if let Some(sink) = index_of(&conn.sink_layer) {
                    in_degree[sink] -= 1;
                    if in_degree[sink] == 0 {
                        queue.push(sink);
                    }
                }
            }
        }
    }
    if order.len() != n {
        return Err(Error::network("wiring graph contains a cycle".to_string()));
    }

    // Construct layers in topological order, resolving in-shapes from the
    // feeding layers' out-shapes.
    let mut layers: Vec<Box<dyn Layer<H>>> = Vec::with_capacity(n);
    for &i in &order {
        let spec = &arch.layers[i];
        let mut in_shapes = Vec::new();
        for conn in connections.iter().filter(|c| c.sink_layer == spec.name) {
            let source = layers
                .iter()
                .find(|l| l.name() == conn.src_layer)
                .ok_or_else(|| {
                    Error::network(format!(
                        "connection ({}) from a layer that is not yet resolved",
                        conn
                    ))
                })?;
            let structure = source_structure(source.as_ref(), &conn.src)?;
            in_shapes.push((conn.sink_input.clone(), structure.without_context()));
        }
        let incoming: Vec<&Connection> = connections
            .iter()
            .filter(|c| c.sink_layer == spec.name)
            .collect();
        let outgoing: Vec<&Connection> = connections
            .iter()
            .filter(|c| c.src_layer == spec.name)
            .collect();
        layers.push(build_layer::<H>(spec, in_shapes, &incoming, &outgoing)?);
    }
    Ok((layers, connections))
}

/// The closed dispatch table of known layer kinds.
fn build_layer<H: Handler>(
    spec: &LayerSpec,
    in_shapes: Vec<(String, BufferStructure)>,
    incoming: &[&Connection],
    outgoing: &[&Connection],
) -> Result<Box<dyn Layer<H>>> {
    let name = spec.name.as_str();
    let kwargs = &spec.kwargs;
    match spec.kind.as_str() {
        "Input" => Ok(Box::new(InputLayer::new(
            name, in_shapes, incoming, outgoing, kwargs,
        )?)),
        "FullyConnected" => Ok(Box::new(FullyConnectedLayer::<H>::new(
            name, in_shapes, incoming, outgoing, kwargs,
        )?)),
        "Rnn" => Ok(Box::new(RnnLayer::<H>::new(
            name, in_shapes, incoming, outgoing, kwargs,
        )?)),
        "Lstm" => Ok(Box::new(LstmLayer::<H>::new(
            name, in_shapes, incoming, outgoing, kwargs,
        )?)),
        "SquaredError" => Ok(Box::new(SquaredErrorLayer::new(
            name, in_shapes, incoming, outgoing, kwargs,
        )?)),
        other => Err(Error::network(format!(
            "unknown layer type '{}' for layer '{}'",
            other, name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::HostHandler;

    fn two_layer_arch() -> Architecture {
        let mut arch = Architecture::new();
        arch.add_layer(
            "Input",
            "Input",
            serde_json::json!({"out_shapes": {"default": [4]}}),
        )
        .unwrap();
        arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 3})).unwrap();
        arch.connect("Input", "default", "rnn", "default").unwrap();
        arch
    }

    #[test]
    fn test_instantiation_resolves_in_shapes() {
        let (layers, conns) =
            instantiate_layers_from_architecture::<HostHandler>(&two_layer_arch()).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(conns.len(), 1);
        let rnn = &layers[1];
        assert_eq!(rnn.in_shapes()[0].1.feature_dims(), &[4]);
    }

    #[test]
    fn test_unknown_layer_type_rejected() {
        let mut arch = Architecture::new();
        arch.add_layer("x", "Convolution", serde_json::json!({})).unwrap();
        let err = instantiate_layers_from_architecture::<HostHandler>(&arch).err().unwrap();
        assert!(matches!(err, Error::NetworkValidation(_)));
    }

    #[test]
    fn test_unknown_sink_layer_rejected() {
        let mut arch = two_layer_arch();
        arch.connect("rnn", "default", "rnn", "default").unwrap(); // self-cycle
        assert!(instantiate_layers_from_architecture::<HostHandler>(&arch).is_err());
    }

    #[test]
    fn test_many_to_one_input_rejected() {
        let mut arch = Architecture::new();
        arch.add_layer(
            "Input",
            "Input",
            serde_json::json!({"out_shapes": {"a": [3], "b": [3]}}),
        )
        .unwrap();
        arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 2})).unwrap();
        arch.connect("Input", "a", "rnn", "default").unwrap();
        arch.connect("Input", "b", "rnn", "default").unwrap();
        let err = instantiate_layers_from_architecture::<HostHandler>(&arch).err().unwrap();
        assert!(matches!(err, Error::NetworkValidation(_)));
    }

    #[test]
    fn test_declaration_order_need_not_be_topological() {
        let mut arch = Architecture::new();
        arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 3})).unwrap();
        arch.add_layer(
            "Input",
            "Input",
            serde_json::json!({"out_shapes": {"default": [4]}}),
        )
        .unwrap();
        arch.connect("Input", "default", "rnn", "default").unwrap();
        let (layers, _) = instantiate_layers_from_architecture::<HostHandler>(&arch).unwrap();
        assert_eq!(layers[0].name(), "Input");
        assert_eq!(layers[1].name(), "rnn");
    }

    #[test]
    fn test_json_roundtrip() {
        let arch = two_layer_arch();
        let json = serde_json::to_string(&arch).unwrap();
        let back: Architecture = serde_json::from_str(&json).unwrap();
        assert_eq!(arch, back);
    }
}
