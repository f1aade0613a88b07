mod common;

use common::{random_array, single_layer_arch};
use marten::{Handler, HostArray, HostHandler, Initializer, Network, ReferenceMap};

// Finite-difference gradient checks
//
// For each layer kind: run one forward/backward pass, then verify every
// analytic parameter gradient (and a sample of input deltas) against a
// central finite difference of the total loss.

const T: usize = 3;
const B: usize = 2;
const F: usize = 4;
const SIZE: usize = 3;
const EPS: f64 = 1e-5;
const TOL: f64 = 1e-4;

struct Harness {
    net: Network<HostHandler>,
    x: HostArray,
    targets: HostArray,
}

impl Harness {
    fn new(kind: &str) -> Harness {
        let arch = single_layer_arch(kind, serde_json::json!({"size": SIZE}), F, SIZE);
        let mut net =
            Network::from_architecture_seeded(arch, HostHandler::seeded(0), Some(13)).unwrap();
        net.initialize(
            ReferenceMap::new().default_rule(Initializer::gaussian(0.4)),
            Some(99),
        )
        .unwrap();
        Harness {
            net,
            x: random_array((T, B, F), 1.0, 21),
            targets: random_array((T, B, SIZE), 1.0, 22),
        }
    }

    fn provide(&mut self) {
        self.net
            .provide_external_data(&[
                ("default", self.x.clone()),
                ("targets", self.targets.clone()),
            ])
            .unwrap();
    }

    fn loss(&mut self) -> f64 {
        self.provide();
        self.net.forward_pass(false, None).unwrap();
        self.net.total_loss().unwrap()
    }

    /// Analytic gradients per parameter, from one forward/backward pass.
    fn analytic_gradients(&mut self) -> Vec<(String, HostArray)> {
        self.provide();
        self.net.forward_pass(true, None).unwrap();
        self.net.backward_pass().unwrap();

        let manager = self.net.buffer_manager();
        let handler = self.net.handler().clone();
        let plan = manager
            .layout()
            .layers
            .iter()
            .find(|p| p.name == "layer")
            .unwrap();
        plan.parameters
            .iter()
            .map(|p| {
                let view = manager
                    .layer_buffers("layer")
                    .unwrap()
                    .gradient(&p.name)
                    .unwrap()
                    .clone();
                (
                    p.name.clone(),
                    handler.get_host_copy(manager.mem(), &view).unwrap(),
                )
            })
            .collect()
    }

    /// Analytic input deltas for the layer's default input.
    fn analytic_input_deltas(&mut self) -> HostArray {
        self.provide();
        self.net.forward_pass(true, None).unwrap();
        self.net.backward_pass().unwrap();
        let manager = self.net.buffer_manager();
        let handler = self.net.handler().clone();
        let view = manager
            .layer_buffers("layer")
            .unwrap()
            .input_delta("default")
            .unwrap()
            .clone();
        handler.get_host_copy(manager.mem(), &view).unwrap()
    }

    fn read_param(&self, name: &str) -> HostArray {
        let manager = self.net.buffer_manager();
        let view = manager
            .layer_buffers("layer")
            .unwrap()
            .param(name)
            .unwrap()
            .clone();
        self.net
            .handler()
            .clone()
            .get_host_copy(manager.mem(), &view)
            .unwrap()
    }

    fn write_param(&mut self, name: &str, arr: &HostArray) {
        let view = self
            .net
            .buffer_manager()
            .layer_buffers("layer")
            .unwrap()
            .param(name)
            .unwrap()
            .clone();
        let handler = self.net.handler().clone();
        let manager = self.net.buffer_manager_mut();
        handler.set_from_host(manager.mem_mut(), &view, arr).unwrap();
    }
}

fn check_parameter_gradients(kind: &str, expected_params: usize) {
    let mut h = Harness::new(kind);
    let analytic = h.analytic_gradients();
    assert_eq!(analytic.len(), expected_params);

    for (name, grad) in &analytic {
        let original = h.read_param(name);
        for i in 0..original.len() {
            let mut plus = original.clone();
            plus.data_mut()[i] += EPS;
            h.write_param(name, &plus);
            let loss_plus = h.loss();

            let mut minus = original.clone();
            minus.data_mut()[i] -= EPS;
            h.write_param(name, &minus);
            let loss_minus = h.loss();

            h.write_param(name, &original);

            let numeric = (loss_plus - loss_minus) / (2.0 * EPS);
            let diff = (grad.data()[i] - numeric).abs();
            assert!(
                diff < TOL,
                "{} gradient {}[{}]: analytic {} vs numeric {} (diff {})",
                kind,
                name,
                i,
                grad.data()[i],
                numeric,
                diff
            );
        }
    }
}

fn check_input_deltas(kind: &str) {
    let mut h = Harness::new(kind);
    let analytic = h.analytic_input_deltas();
    assert_eq!(analytic.dims(), &[T, B, F]);

    let original = h.x.clone();
    for i in 0..original.len() {
        let mut plus = original.clone();
        plus.data_mut()[i] += EPS;
        h.x = plus;
        let loss_plus = h.loss();

        let mut minus = original.clone();
        minus.data_mut()[i] -= EPS;
        h.x = minus;
        let loss_minus = h.loss();

        h.x = original.clone();

        let numeric = (loss_plus - loss_minus) / (2.0 * EPS);
        let diff = (analytic.data()[i] - numeric).abs();
        assert!(
            diff < TOL,
            "{} input delta [{}]: analytic {} vs numeric {} (diff {})",
            kind,
            i,
            analytic.data()[i],
            numeric,
            diff
        );
    }
}

#[test]
fn test_rnn_parameter_gradients_match_finite_differences() {
    // W, R, bias.
    check_parameter_gradients("Rnn", 3);
}

#[test]
fn test_rnn_input_deltas_match_finite_differences() {
    check_input_deltas("Rnn");
}

#[test]
fn test_lstm_parameter_gradients_match_finite_differences() {
    // Four input-weight matrices, four recurrent matrices, four biases.
    check_parameter_gradients("Lstm", 12);
}

#[test]
fn test_lstm_input_deltas_match_finite_differences() {
    check_input_deltas("Lstm");
}

#[test]
fn test_fully_connected_gradients_match_finite_differences() {
    check_parameter_gradients("FullyConnected", 2);
    check_input_deltas("FullyConnected");
}

#[test]
fn test_backward_accumulation_restarts_each_pass() {
    // Two identical backward passes must produce identical gradients, not
    // doubled ones: clear_backward_buffers resets the accumulators.
    let mut h = Harness::new("Rnn");
    let first = h.analytic_gradients();
    let second = h.analytic_gradients();
    for ((n1, g1), (n2, g2)) in first.iter().zip(&second) {
        assert_eq!(n1, n2);
        assert_eq!(g1, g2);
    }
}
