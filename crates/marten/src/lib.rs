//! # marten
//!
//! A neural-network execution engine built around explicit buffers: a
//! pluggable numeric backend (the [`Handler`](marten_core::Handler)
//! contract), layers that declare named shape-typed buffers, and a network
//! driver that lays every buffer out in one shared arena and drives
//! time-unrolled forward and backward passes through it.
//!
//! ```ignore
//! let mut arch = Architecture::new();
//! arch.add_layer("Input", "Input",
//!     serde_json::json!({"out_shapes": {"default": [4], "targets": [3]}}))?;
//! arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 3}))?;
//! arch.add_layer("loss", "SquaredError", serde_json::json!({}))?;
//! arch.connect("Input", "default", "rnn", "default")?;
//! arch.connect("rnn", "default", "loss", "default")?;
//! arch.connect("Input", "targets", "loss", "targets")?;
//!
//! let mut net = Network::from_architecture(arch, HostHandler::new())?;
//! net.initialize(ReferenceMap::new().default_rule(Initializer::gaussian(0.1)), Some(42))?;
//! net.provide_external_data(&[("default", inputs), ("targets", targets)])?;
//! net.forward_pass(true, None)?;
//! net.backward_pass()?;
//! ```

pub mod architecture;
pub mod buffers;
pub mod checkpoint;
pub mod init;
pub mod layout;
pub mod modifiers;
pub mod network;
pub mod rules;

pub use architecture::{instantiate_layers_from_architecture, Architecture, ConnectionSpec, LayerSpec};
pub use buffers::{BufferManager, Context};
pub use init::Initializer;
pub use layout::{create_layout, BufEntry, Hub, LayerPlan, Layout, ParamEntry};
pub use modifiers::ValueModifier;
pub use network::Network;
pub use rules::{resolve_optional, resolve_references, ReferenceMap, Resolved, RuleValue};

pub use marten_core::{
    BufferStructure, CheckedHandler, Error, Handler, HostArray, HostHandler, RandomState, Result,
    Shape, StructureTemplate, TensorView,
};
pub use marten_nn::{
    Connection, FullyConnectedLayer, InputLayer, Kwargs, Layer, LayerBuffers, LstmLayer, RnnLayer,
    SquaredErrorLayer,
};
