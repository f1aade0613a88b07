use marten::{Architecture, HostArray, Initializer, Shape};

/// Input -> single layer -> squared-error loss, with `targets` wired from
/// the input layer.
pub fn single_layer_arch(
    kind: &str,
    kwargs: serde_json::Value,
    features: usize,
    out_features: usize,
) -> Architecture {
    let mut arch = Architecture::new();
    arch.add_layer(
        "Input",
        "Input",
        serde_json::json!({"out_shapes": {"default": [features], "targets": [out_features]}}),
    )
    .unwrap();
    arch.add_layer("layer", kind, kwargs).unwrap();
    arch.add_layer("loss", "SquaredError", serde_json::json!({})).unwrap();
    arch.connect("Input", "default", "layer", "default").unwrap();
    arch.connect("layer", "default", "loss", "default").unwrap();
    arch.connect("Input", "targets", "loss", "targets").unwrap();
    arch
}

/// Deterministic pseudo-random host array.
pub fn random_array(shape: impl Into<Shape>, std: f64, seed: u64) -> HostArray {
    Initializer::Gaussian { mean: 0.0, std }
        .evaluate(&shape.into(), None, seed)
        .unwrap()
}
