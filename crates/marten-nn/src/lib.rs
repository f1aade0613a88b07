//! # marten-nn
//!
//! Layer contract and layer implementations for the marten engine.
//!
//! Every layer declares named, shape-typed buffers (inputs, outputs,
//! parameters, internals) and implements forward/backward passes purely
//! through [`Handler`](marten_core::Handler) operations on
//! [`LayerBuffers`] views; layers never own storage of their own.
//!
//! Provided layers:
//! - [`InputLayer`] — entry point for external data
//! - [`FullyConnectedLayer`] — `y = act(W·x + bias)` over flattened time
//! - [`RnnLayer`] — simple recurrent layer
//! - [`LstmLayer`] — four-gate LSTM with cell recurrence
//! - [`SquaredErrorLayer`] — terminal loss seeding the backward delta chain

pub mod activation;
pub mod fully_connected;
pub mod input;
pub mod layer;
pub mod lstm;
pub mod rnn;
pub mod squared_error;
pub mod wiring;

pub use activation::{ActFuncs, Activation};
pub use fully_connected::FullyConnectedLayer;
pub use input::InputLayer;
pub use layer::{Kwargs, Layer, LayerBuffers, ShapeList};
pub use lstm::LstmLayer;
pub use rnn::RnnLayer;
pub use squared_error::SquaredErrorLayer;
pub use wiring::{Category, Connection, SourceRef};
