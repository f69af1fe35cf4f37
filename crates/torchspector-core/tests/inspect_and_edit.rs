use torchspector_core::{
    load_checkpoint, remove_nested_key, save_checkpoint, CheckpointError, Device, DisplayTree,
    Dtype, Mapping, Scalar, Tensor, Value,
};

fn layer(rows: usize) -> Mapping {
    let mut layer = Mapping::new();
    layer.insert(
        "weight",
        Tensor::from_vec(&[rows, 2], vec![0.5; rows * 2], Dtype::BF16).unwrap(),
    );
    layer.insert("bias", Tensor::from_f32(&[2], vec![0.0, 1.0]).unwrap());
    layer
}

fn training_checkpoint() -> Mapping {
    let mut state_dict = Mapping::new();
    state_dict.insert("encoder", layer(3));
    state_dict.insert("decoder", layer(4));

    let mut checkpoint = Mapping::new();
    checkpoint.insert("state_dict", state_dict);
    checkpoint.insert("epoch", Scalar::Int(12));
    checkpoint.insert("lr", Scalar::Float(3e-4));
    checkpoint.insert(
        "callbacks",
        Value::Sequence(vec![Value::Scalar("early_stop".into()), Value::Scalar(Scalar::None)]),
    );
    checkpoint
}

#[test]
fn test_tree_of_training_checkpoint() {
    let tree = DisplayTree::build(&training_checkpoint());

    let roots: Vec<&str> = tree.children(None).map(|n| n.key.as_str()).collect();
    assert_eq!(roots, vec!["state_dict", "epoch", "lr", "callbacks"]);

    // Second layer's entries are disambiguated across the whole tree.
    let decoder: Vec<&str> = tree.children(Some("decoder")).map(|n| n.key.as_str()).collect();
    assert_eq!(decoder, vec!["weight_1", "bias_1"]);
    let weight_1 = tree.get("weight_1").unwrap();
    assert_eq!(weight_1.text, "weight");
    assert_eq!(weight_1.values, vec!["(4, 2)".to_string()]);

    let callbacks: Vec<&str> = tree.children(Some("callbacks")).map(|n| n.key.as_str()).collect();
    assert_eq!(callbacks, vec!["callbacks_0", "callbacks_1"]);
    assert_eq!(tree.get("callbacks_1").unwrap().values, vec!["None".to_string()]);
    assert_eq!(tree.get("epoch").unwrap().values, vec!["12".to_string()]);
}

#[test]
fn test_remove_then_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");

    let mut checkpoint = training_checkpoint();
    // Scalars and sequences cannot be stored as safetensors.
    let err = save_checkpoint(&checkpoint, &path).unwrap_err();
    assert!(matches!(err, CheckpointError::NotSerializable { .. }));

    assert!(remove_nested_key(&mut checkpoint, &["epoch"]));
    assert!(remove_nested_key(&mut checkpoint, &["lr"]));
    assert!(remove_nested_key(&mut checkpoint, &["callbacks"]));
    assert!(remove_nested_key(&mut checkpoint, &["state_dict", "decoder", "bias"]));
    assert!(!remove_nested_key(&mut checkpoint, &["state_dict", "missing"]));
    save_checkpoint(&checkpoint, &path).unwrap();

    let reloaded = load_checkpoint(&path, &Device::Cpu).unwrap();
    let mut keys: Vec<&str> = reloaded.keys().collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec![
            "state_dict.decoder.weight",
            "state_dict.encoder.bias",
            "state_dict.encoder.weight",
        ]
    );
    let weight = reloaded
        .get("state_dict.encoder.weight")
        .and_then(Value::as_tensor)
        .unwrap();
    assert_eq!(weight.dtype(), Dtype::BF16);
    assert_eq!(weight.shape(), &[3, 2]);
}

#[test]
fn test_unsupported_extension() {
    let err = load_checkpoint("weights.onnx", &Device::Cpu).unwrap_err();
    assert!(matches!(err, CheckpointError::UnsupportedFormat { .. }));
}
