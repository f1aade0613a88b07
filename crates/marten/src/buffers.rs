use crate::layout::Layout;
use marten_core::{Error, Handler, HostArray, Result, TensorView};
use marten_nn::LayerBuffers;

// BufferManager — sole owner of the arena
//
// Holds the single backing allocation for a network and hands out per-layer
// view bundles. Layers and the network only ever see aliasing TensorViews;
// nothing else owns storage.
//
// `resize` re-derives every concrete allocation size from the symbolic
// time/batch dimensions. Growth reallocates (preserving the parameter and
// gradient prefix); shrinking reuses existing storage so that many
// similarly-sized batches never thrash the allocator. The `generation`
// counter increments only on reallocation, which makes the reuse observable.

/// An opaque snapshot of recurrent state, as produced by [`BufferManager::get_context`].
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    entries: Vec<HostArray>,
}

/// Owns the arena and the resolved per-layer buffer views.
#[derive(Debug)]
pub struct BufferManager<H: Handler> {
    handler: H,
    layout: Layout,
    mem: H::Mem,
    capacity: usize,
    generation: u64,
    time: usize,
    batch: usize,
    hub_offsets: Vec<usize>,
    backward_start: usize,
    total_len: usize,
    views: Vec<LayerBuffers>,
}

impl<H: Handler> BufferManager<H> {
    pub fn new(handler: H, layout: Layout) -> Result<Self> {
        let mem = handler.allocate(0)?;
        let mut manager = BufferManager {
            handler,
            layout,
            mem,
            capacity: 0,
            generation: 0,
            time: 0,
            batch: 0,
            hub_offsets: Vec::new(),
            backward_start: 0,
            total_len: 0,
            views: Vec::new(),
        };
        manager.resize(1, 1)?;
        Ok(manager)
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn time(&self) -> usize {
        self.time
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Bumped on every arena reallocation; stable across shrinking resizes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn param_size(&self) -> usize {
        self.layout.param_size
    }

    pub fn mem(&self) -> &H::Mem {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut H::Mem {
        &mut self.mem
    }

    /// The flat view over every parameter of the network.
    pub fn parameters_view(&self) -> TensorView {
        TensorView::new(0, self.layout.param_size)
    }

    /// The flat view over every gradient of the network.
    pub fn gradients_view(&self) -> TensorView {
        TensorView::new(self.layout.param_size, self.layout.param_size)
    }

    /// All per-layer view bundles, in layer execution order.
    pub fn views(&self) -> &[LayerBuffers] {
        &self.views
    }

    pub fn layer_buffers(&self, name: &str) -> Result<&LayerBuffers> {
        self.layout
            .layers
            .iter()
            .position(|p| p.name == name)
            .map(|i| &self.views[i])
            .ok_or_else(|| Error::network(format!("no layer named '{}'", name)))
    }

    /// Split borrows for a pass: the handler, the arena, and the views.
    pub fn pass_parts(&mut self) -> (&H, &mut H::Mem, &[LayerBuffers]) {
        (&self.handler, &mut self.mem, &self.views)
    }

    /// Swap the numeric backend. The arena contents carry over unchanged.
    pub fn set_memory_handler(&mut self, handler: H) {
        self.handler = handler;
    }

    /// Re-derive every buffer size for new time/batch dimensions.
    /// Reallocates only on growth, preserving parameters and gradients.
    pub fn resize(&mut self, time: usize, batch: usize) -> Result<()> {
        if time == 0 || batch == 0 {
            return Err(Error::msg(format!(
                "cannot resize to time {} x batch {}",
                time, batch
            )));
        }
        if time == self.time && batch == self.batch {
            return Ok(());
        }

        let param_size = self.layout.param_size;
        let mut offsets = vec![0usize; self.layout.hubs.len()];
        let mut cursor = 2 * param_size;
        for (i, hub) in self.layout.hubs.iter().enumerate() {
            if !hub.backward {
                offsets[i] = cursor;
                cursor += hub.structure.resolved_len(time, batch);
            }
        }
        let backward_start = cursor;
        for (i, hub) in self.layout.hubs.iter().enumerate() {
            if hub.backward {
                offsets[i] = cursor;
                cursor += hub.structure.resolved_len(time, batch);
            }
        }
        let total = cursor;

        if total > self.capacity {
            let prefix = TensorView::new(0, 2 * param_size);
            let saved = if self.capacity >= prefix.len() {
                Some(self.handler.get_host_copy(&self.mem, &prefix)?)
            } else {
                None
            };
            log::debug!(
                "arena grows {} -> {} elements (time {}, batch {})",
                self.capacity,
                total,
                time,
                batch
            );
            self.mem = self.handler.allocate(total)?;
            if let Some(saved) = saved {
                self.handler.set_from_host(&mut self.mem, &prefix, &saved)?;
            }
            self.capacity = total;
            self.generation += 1;
        }

        self.time = time;
        self.batch = batch;
        self.hub_offsets = offsets;
        self.backward_start = backward_start;
        self.total_len = total;
        self.rebuild_views();
        Ok(())
    }

    fn rebuild_views(&mut self) {
        let (time, batch) = (self.time, self.batch);
        let param_size = self.layout.param_size;
        let hub_offsets = &self.hub_offsets;
        let entry_views = |entries: &[crate::layout::BufEntry]| {
            entries
                .iter()
                .map(|e| {
                    (
                        e.name.clone(),
                        TensorView::new(hub_offsets[e.hub], e.structure.resolve(time, batch)),
                    )
                })
                .collect::<Vec<_>>()
        };
        let views: Vec<LayerBuffers> = self
            .layout
            .layers
            .iter()
            .map(|plan| LayerBuffers {
                inputs: entry_views(&plan.inputs),
                outputs: entry_views(&plan.outputs),
                internals: entry_views(&plan.internals),
                input_deltas: entry_views(&plan.input_deltas),
                output_deltas: entry_views(&plan.output_deltas),
                parameters: plan
                    .parameters
                    .iter()
                    .map(|p| {
                        (
                            p.name.clone(),
                            TensorView::new(p.offset, p.structure.resolve(time, batch)),
                        )
                    })
                    .collect(),
                gradients: plan
                    .parameters
                    .iter()
                    .map(|p| {
                        (
                            p.name.clone(),
                            TensorView::new(param_size + p.offset, p.structure.resolve(time, batch)),
                        )
                    })
                    .collect(),
            })
            .collect();
        self.views = views;
    }

    fn hub_view(&self, hub: usize) -> TensorView {
        TensorView::new(
            self.hub_offsets[hub],
            self.layout.hubs[hub].structure.resolve(self.time, self.batch),
        )
    }

    /// Zero the context slot of every recurrent buffer, so a fresh sequence
    /// starts from zero initial state.
    pub fn clear_context(&mut self) -> Result<()> {
        let hubs: Vec<usize> = self.layout.context_hubs().collect();
        for hub in hubs {
            let slot = self.hub_view(hub).step(-1)?;
            self.handler.fill(&mut self.mem, &slot, 0.0)?;
        }
        Ok(())
    }

    /// Snapshot the final computed step of every recurrent buffer, for
    /// streaming a long sequence across chunk boundaries.
    pub fn get_context(&self) -> Result<Context> {
        let mut entries = Vec::new();
        for hub in self.layout.context_hubs() {
            let last = self.hub_view(hub).step(self.time as isize - 1)?;
            entries.push(self.handler.get_host_copy(&self.mem, &last)?);
        }
        Ok(Context { entries })
    }

    /// Restore a snapshot into the context slots.
    pub fn apply_context(&mut self, context: &Context) -> Result<()> {
        let hubs: Vec<usize> = self.layout.context_hubs().collect();
        if hubs.len() != context.entries.len() {
            return Err(Error::network(format!(
                "context snapshot has {} entries, layout expects {}",
                context.entries.len(),
                hubs.len()
            )));
        }
        for (hub, saved) in hubs.into_iter().zip(&context.entries) {
            let slot = self.hub_view(hub).step(-1)?;
            self.handler.set_from_host(&mut self.mem, &slot, saved)?;
        }
        Ok(())
    }

    /// Zero every gradient and every backward/delta buffer so accumulation
    /// starts from zero on the next backward pass.
    pub fn clear_backward_buffers(&mut self) -> Result<()> {
        let grads = self.gradients_view();
        self.handler.fill(&mut self.mem, &grads, 0.0)?;
        let backward = TensorView::new(self.backward_start, self.total_len - self.backward_start);
        self.handler.fill(&mut self.mem, &backward, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::{instantiate_layers_from_architecture, Architecture};
    use crate::layout::create_layout;
    use marten_core::HostHandler;

    fn manager() -> BufferManager<HostHandler> {
        let mut arch = Architecture::new();
        arch.add_layer(
            "Input",
            "Input",
            serde_json::json!({"out_shapes": {"default": [4]}}),
        )
        .unwrap();
        arch.add_layer("rnn", "Rnn", serde_json::json!({"size": 3})).unwrap();
        arch.connect("Input", "default", "rnn", "default").unwrap();
        let (layers, conns) = instantiate_layers_from_architecture::<HostHandler>(&arch).unwrap();
        let layout = create_layout(&layers, &conns).unwrap();
        BufferManager::new(HostHandler::seeded(0), layout).unwrap()
    }

    #[test]
    fn test_shrink_does_not_reallocate_growth_does() {
        let mut m = manager();
        m.resize(6, 4).unwrap();
        let gen = m.generation();
        m.resize(3, 2).unwrap();
        assert_eq!(m.generation(), gen, "shrinking must reuse the arena");
        m.resize(8, 4).unwrap();
        assert_eq!(m.generation(), gen + 1, "growth must reallocate");
        // Shapes follow the new sizes.
        let rnn = m.layer_buffers("rnn").unwrap();
        assert_eq!(rnn.output("default").unwrap().dims(), &[9, 4, 3]);
        assert_eq!(rnn.input("default").unwrap().dims(), &[8, 4, 4]);
    }

    #[test]
    fn test_growth_preserves_parameters() {
        let mut m = manager();
        m.resize(2, 2).unwrap();
        let params = m.parameters_view();
        let init = HostArray::full(params.shape().clone(), 0.25);
        let handler = m.handler().clone();
        handler.set_from_host(m.mem_mut(), &params, &init).unwrap();
        m.resize(16, 8).unwrap();
        let back = handler.get_host_copy(m.mem(), &m.parameters_view()).unwrap();
        assert_eq!(back, init);
    }

    #[test]
    fn test_wired_views_share_memory() {
        let mut m = manager();
        m.resize(3, 2).unwrap();
        let input_view = m
            .layer_buffers("Input")
            .unwrap()
            .output("default")
            .unwrap()
            .clone();
        let rnn_in = m.layer_buffers("rnn").unwrap().input("default").unwrap().clone();
        assert_eq!(input_view.offset(), rnn_in.offset());
        assert_eq!(input_view.shape(), rnn_in.shape());
    }

    #[test]
    fn test_clear_backward_zeroes_gradients_and_deltas() {
        let mut m = manager();
        m.resize(2, 2).unwrap();
        let handler = m.handler().clone();
        let grads = m.gradients_view();
        handler
            .set_from_host(
                m.mem_mut(),
                &grads,
                &HostArray::full(grads.shape().clone(), 3.0),
            )
            .unwrap();
        let dha = m.layer_buffers("rnn").unwrap().internal("dHa").unwrap().clone();
        handler.fill(m.mem_mut(), &dha, 2.0).unwrap();
        m.clear_backward_buffers().unwrap();
        let grads_back = handler.get_host_copy(m.mem(), &m.gradients_view()).unwrap();
        assert!(grads_back.data().iter().all(|&x| x == 0.0));
        let dha_back = handler.get_host_copy(m.mem(), &dha).unwrap();
        assert!(dha_back.data().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_context_snapshot_roundtrip() {
        let mut m = manager();
        m.resize(3, 2).unwrap();
        let handler = m.handler().clone();
        // Pretend the last computed step holds state.
        let y = m.layer_buffers("rnn").unwrap().output("default").unwrap().clone();
        let last = y.step(2).unwrap();
        handler.fill(m.mem_mut(), &last, 0.5).unwrap();
        let ctx = m.get_context().unwrap();

        m.clear_context().unwrap();
        m.apply_context(&ctx).unwrap();
        let slot = handler.get_host_copy(m.mem(), &y.step(-1).unwrap()).unwrap();
        assert!(slot.data().iter().all(|&x| x == 0.5));
    }

    #[test]
    fn test_clear_context_zeroes_slots() {
        let mut m = manager();
        m.resize(3, 2).unwrap();
        let handler = m.handler().clone();
        let y = m.layer_buffers("rnn").unwrap().output("default").unwrap().clone();
        handler.fill(m.mem_mut(), &y, 1.0).unwrap();
        m.clear_context().unwrap();
        let slot = handler.get_host_copy(m.mem(), &y.step(-1).unwrap()).unwrap();
        assert!(slot.data().iter().all(|&x| x == 0.0));
        // Real steps untouched.
        let first = handler.get_host_copy(m.mem(), &y.step(0).unwrap()).unwrap();
        assert!(first.data().iter().all(|&x| x == 1.0));
    }
}
