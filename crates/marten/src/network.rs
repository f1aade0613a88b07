use crate::architecture::{instantiate_layers_from_architecture, Architecture};
use crate::buffers::{BufferManager, Context};
use crate::checkpoint;
use crate::init::Initializer;
use crate::layout::create_layout;
use crate::modifiers::ValueModifier;
use crate::rules::{resolve_optional, resolve_references, ReferenceMap};
use marten_core::{Error, Handler, HostArray, Result};
use marten_nn::Layer;
use std::path::Path;

// Network — the orchestration unit
//
// Owns the ordered layers, the buffer manager, the architecture description
// and the bound handler, and drives the time-major forward pass and the
// reverse-order backward pass. It is also the unit of serialization:
// architecture + parameter values + handler identity + initializer/modifier
// descriptions.

type ModifierSet = Vec<(String, String, Vec<ValueModifier>)>;

/// An executable network: ordered layers plus one shared buffer arena.
pub struct Network<H: Handler> {
    layers: Vec<Box<dyn Layer<H>>>,
    buffer_manager: BufferManager<H>,
    architecture: Architecture,
    handler: H,
    rnd: marten_core::RandomState,
    input_layer: usize,
    loss_layers: Vec<usize>,
    initializers: ReferenceMap<Initializer>,
    weight_modifier_refs: ReferenceMap<Vec<ValueModifier>>,
    gradient_modifier_refs: ReferenceMap<Vec<ValueModifier>>,
    weight_modifiers: ModifierSet,
    gradient_modifiers: ModifierSet,
}

impl<H: Handler> Network<H> {
    /// Build a network from an architecture description.
    pub fn from_architecture(architecture: Architecture, handler: H) -> Result<Self> {
        Self::from_architecture_seeded(architecture, handler, None)
    }

    /// Build with a fixed seed for the network's own randomness (initializer
    /// seeds).
    pub fn from_architecture_seeded(
        architecture: Architecture,
        handler: H,
        seed: Option<u64>,
    ) -> Result<Self> {
        let (mut layers, connections) = instantiate_layers_from_architecture::<H>(&architecture)?;
        let layout = create_layout(&layers, &connections)?;
        let buffer_manager = BufferManager::new(handler.clone(), layout)?;

        let input_layers: Vec<usize> = layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_input())
            .map(|(i, _)| i)
            .collect();
        let input_layer = match input_layers.as_slice() {
            [single] => *single,
            [] => return Err(Error::network("architecture has no Input layer".to_string())),
            _ => {
                return Err(Error::network(
                    "architecture has more than one Input layer".to_string(),
                ))
            }
        };
        let loss_layers = layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_loss())
            .map(|(i, _)| i)
            .collect();

        for layer in &mut layers {
            layer.set_handler(&handler)?;
        }
        log::debug!(
            "network built: {} layers, {} parameter elements",
            layers.len(),
            buffer_manager.param_size()
        );

        let rnd = match seed {
            Some(s) => marten_core::RandomState::new(s),
            None => marten_core::RandomState::from_entropy(),
        };
        Ok(Network {
            layers,
            buffer_manager,
            architecture,
            handler,
            rnd,
            input_layer,
            loss_layers,
            initializers: ReferenceMap::new(),
            weight_modifier_refs: ReferenceMap::new(),
            gradient_modifier_refs: ReferenceMap::new(),
            weight_modifiers: Vec::new(),
            gradient_modifiers: Vec::new(),
        })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn buffer_manager(&self) -> &BufferManager<H> {
        &self.buffer_manager
    }

    /// Mutable manager access, for code that writes buffers directly (an
    /// optimizer updating parameters from gradients, tests seeding state).
    pub fn buffer_manager_mut(&mut self) -> &mut BufferManager<H> {
        &mut self.buffer_manager
    }

    pub fn initializer_refs(&self) -> &ReferenceMap<Initializer> {
        &self.initializers
    }

    pub fn weight_modifier_refs(&self) -> &ReferenceMap<Vec<ValueModifier>> {
        &self.weight_modifier_refs
    }

    pub fn gradient_modifier_refs(&self) -> &ReferenceMap<Vec<ValueModifier>> {
        &self.gradient_modifier_refs
    }

    /// Rebind the numeric backend: the buffer manager and every layer get
    /// the new handler.
    pub fn set_handler(&mut self, handler: H) -> Result<()> {
        self.handler = handler.clone();
        self.buffer_manager.set_memory_handler(handler.clone());
        for layer in &mut self.layers {
            layer.set_handler(&handler)?;
        }
        Ok(())
    }

    //  Running

    /// Resize the buffers to the data's time/batch dimensions and copy the
    /// data into the input layer's outputs.
    pub fn provide_external_data(&mut self, data: &[(&str, HostArray)]) -> Result<()> {
        let (first_name, first) = data
            .first()
            .ok_or_else(|| Error::IteratorValidation("no external data supplied".to_string()))?;
        if first.rank() < 2 {
            return Err(Error::IteratorValidation(format!(
                "external data '{}' must be at least [Time, Batch], got rank {}",
                first_name,
                first.rank()
            )));
        }
        let (time, batch) = (first.dims()[0], first.dims()[1]);
        self.buffer_manager.resize(time, batch)?;

        let input_name = self.layers[self.input_layer].name().to_string();
        for (name, arr) in data {
            let view = self
                .buffer_manager
                .layer_buffers(&input_name)?
                .output(name)
                .map_err(|_| {
                    Error::network(format!("input layer has no output named '{}'", name))
                })?
                .clone();
            self.handler
                .set_from_host(self.buffer_manager.mem_mut(), &view, arr)?;
        }
        Ok(())
    }

    /// Drive every layer forward in wiring order. Without a context the
    /// recurrent state starts from zero; with one, from the snapshot.
    pub fn forward_pass(&mut self, training_pass: bool, context: Option<&Context>) -> Result<()> {
        match context {
            None => self.buffer_manager.clear_context()?,
            Some(ctx) => self.buffer_manager.apply_context(ctx)?,
        }
        let (handler, mem, views) = self.buffer_manager.pass_parts();
        for (layer, buffers) in self.layers.iter().zip(views) {
            layer.forward_pass(handler, mem, buffers, training_pass)?;
        }
        Ok(())
    }

    /// Drive every layer backward in reverse order, then apply gradient
    /// modifiers. Gradients and deltas are zeroed first so every
    /// contribution accumulates from a clean slate.
    pub fn backward_pass(&mut self) -> Result<()> {
        self.buffer_manager.clear_backward_buffers()?;
        {
            let (handler, mem, views) = self.buffer_manager.pass_parts();
            for (layer, buffers) in self.layers.iter().zip(views).rev() {
                layer.backward_pass(handler, mem, buffers)?;
            }
        }
        self.apply_gradient_modifiers()
    }

    /// Host copy of `layer.output`, without the context row.
    pub fn get_output(&self, spec: &str) -> Result<HostArray> {
        let (layer_name, view_name) = spec.split_once('.').ok_or_else(|| {
            Error::network(format!(
                "invalid output spec '{}', expected 'layer.output'",
                spec
            ))
        })?;
        let buffers = self.buffer_manager.layer_buffers(layer_name)?;
        let view = buffers.output(view_name).map_err(|_| {
            Error::network(format!(
                "layer '{}' has no output named '{}'",
                layer_name, view_name
            ))
        })?;
        let computed = if view.dims()[0] > self.buffer_manager.time() {
            view.steps(0, self.buffer_manager.time())?
        } else {
            view.clone()
        };
        self.handler.get_host_copy(self.buffer_manager.mem(), &computed)
    }

    /// Host copy of one external data buffer as last provided.
    pub fn get_input(&self, name: &str) -> Result<HostArray> {
        let input_name = self.layers[self.input_layer].name();
        let buffers = self.buffer_manager.layer_buffers(input_name)?;
        let view = buffers.output(name).map_err(|_| {
            Error::network(format!("input layer has no output named '{}'", name))
        })?;
        self.handler.get_host_copy(self.buffer_manager.mem(), view)
    }

    /// Per-loss-layer summed loss values.
    pub fn get_loss_values(&self) -> Result<Vec<(String, f64)>> {
        let mut losses = Vec::new();
        for &idx in &self.loss_layers {
            let name = self.layers[idx].name();
            let arr = self.get_output(&format!("{}.default", name))?;
            losses.push((name.to_string(), arr.data().iter().sum()));
        }
        Ok(losses)
    }

    /// Sum of all loss-layer outputs.
    pub fn total_loss(&self) -> Result<f64> {
        Ok(self.get_loss_values()?.iter().map(|(_, l)| l).sum())
    }

    /// Snapshot recurrent state for streaming across sequence boundaries.
    pub fn get_context(&self) -> Result<Context> {
        self.buffer_manager.get_context()
    }

    //  Setup

    /// Resolve initializer references and fill every parameter buffer.
    /// Each parameter must match exactly one initializer and at most one
    /// fallback; a `seed` makes initialization reproducible.
    pub fn initialize(
        &mut self,
        refs: ReferenceMap<Initializer>,
        seed: Option<u64>,
    ) -> Result<()> {
        let targets = self.param_targets();
        let resolved = resolve_references(&targets, &refs)?;
        let mut init_rnd = self.rnd.create_random_state(seed);
        for ((layer, view_name), r) in &resolved {
            let view = self
                .buffer_manager
                .layer_buffers(layer)?
                .param(view_name)?
                .clone();
            let draw_seed = init_rnd.generate_seed();
            let arr = r.value.evaluate(view.shape(), r.fallback.as_ref(), draw_seed)?;
            self.handler
                .set_from_host(self.buffer_manager.mem_mut(), &view, &arr)?;
        }
        self.initializers = refs;
        Ok(())
    }

    /// Install weight modifiers; run them with [`Network::apply_weight_modifiers`].
    pub fn set_weight_modifiers(&mut self, refs: ReferenceMap<Vec<ValueModifier>>) -> Result<()> {
        let targets = self.param_targets();
        let resolved = resolve_optional(&targets, &refs)?;
        self.weight_modifiers = resolved
            .into_iter()
            .map(|((l, v), mods)| (l, v, mods))
            .collect();
        self.weight_modifier_refs = refs;
        Ok(())
    }

    /// Install gradient modifiers; they run automatically after every
    /// backward pass.
    pub fn set_gradient_modifiers(
        &mut self,
        refs: ReferenceMap<Vec<ValueModifier>>,
    ) -> Result<()> {
        let targets = self.param_targets();
        let resolved = resolve_optional(&targets, &refs)?;
        self.gradient_modifiers = resolved
            .into_iter()
            .map(|((l, v), mods)| (l, v, mods))
            .collect();
        self.gradient_modifier_refs = refs;
        Ok(())
    }

    /// Apply every installed weight modifier, in installation order.
    pub fn apply_weight_modifiers(&mut self) -> Result<()> {
        for (layer, view_name, mods) in &self.weight_modifiers {
            let view = self
                .buffer_manager
                .layer_buffers(layer)?
                .param(view_name)?
                .clone();
            for m in mods {
                m.apply(&self.handler, self.buffer_manager.mem_mut(), &view)?;
            }
        }
        Ok(())
    }

    /// Apply every installed gradient modifier to the gradient buffers.
    pub fn apply_gradient_modifiers(&mut self) -> Result<()> {
        for (layer, view_name, mods) in &self.gradient_modifiers {
            let view = self
                .buffer_manager
                .layer_buffers(layer)?
                .gradient(view_name)?
                .clone();
            for m in mods {
                m.apply(&self.handler, self.buffer_manager.mem_mut(), &view)?;
            }
        }
        Ok(())
    }

    fn param_targets(&self) -> Vec<(String, Vec<String>)> {
        self.layers
            .iter()
            .filter(|l| !l.parameter_shapes().is_empty())
            .map(|l| {
                (
                    l.name().to_string(),
                    l.parameter_shapes().iter().map(|(n, _)| n.clone()).collect(),
                )
            })
            .collect()
    }

    //  Serialization

    /// Host copy of the flat parameter region.
    pub fn parameters(&self) -> Result<HostArray> {
        self.handler
            .get_host_copy(self.buffer_manager.mem(), &self.buffer_manager.parameters_view())
    }

    /// Overwrite the flat parameter region.
    pub fn set_parameters(&mut self, arr: &HostArray) -> Result<()> {
        let view = self.buffer_manager.parameters_view();
        if arr.len() != view.len() {
            return Err(Error::network(format!(
                "parameter dump has {} elements, network expects {}",
                arr.len(),
                view.len()
            )));
        }
        self.handler
            .set_from_host(self.buffer_manager.mem_mut(), &view, arr)
    }

    pub(crate) fn restore_descriptions(
        &mut self,
        initializers: ReferenceMap<Initializer>,
        weight_mods: ReferenceMap<Vec<ValueModifier>>,
        gradient_mods: ReferenceMap<Vec<ValueModifier>>,
    ) -> Result<()> {
        self.initializers = initializers;
        self.set_weight_modifiers(weight_mods)?;
        self.set_gradient_modifiers(gradient_mods)
    }

    /// Save to the container format (description + parameter dump).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        checkpoint::save(self, path)
    }

    /// Load a network saved with [`Network::save`].
    pub fn load(path: impl AsRef<Path>, handler: H) -> Result<Self> {
        checkpoint::load(path, handler)
    }
}
