use std::path::{Path, PathBuf};

use torchspector_core::{flatten, load_checkpoint, save_checkpoint, Device, Dtype, Mapping, Tensor, Value};
use torchspector_merge::{ratio_merge, FileLoader, MergeError, RatioMergeConfig};

fn write_checkpoint(dir: &Path, name: &str, entries: &[(&str, Vec<f32>)]) -> PathBuf {
    let checkpoint: Mapping = entries
        .iter()
        .map(|(key, values)| {
            (
                *key,
                Tensor::from_f32(&[values.len()], values.clone()).unwrap(),
            )
        })
        .collect();
    let path = dir.join(name);
    save_checkpoint(&checkpoint, &path).unwrap();
    path
}

fn values(map: &Mapping, key: &str) -> Vec<f32> {
    map.get(key).and_then(Value::as_tensor).unwrap().to_vec()
}

#[test]
fn test_merge_safetensors_files_and_save() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_checkpoint(
        dir.path(),
        "a.safetensors",
        &[("enc.main.w", vec![1.0, 2.0]), ("enc.other.w", vec![5.0])],
    );
    let b = write_checkpoint(
        dir.path(),
        "b.safetensors",
        &[("enc.main.w", vec![3.0, 6.0]), ("enc.other.w", vec![7.0])],
    );

    let no_roots: &[&str] = &[];
    let output = ratio_merge(
        &FileLoader::new(),
        &[&a, &b],
        Some(&[0.25, 0.75][..]),
        &["main"],
        Device::Cpu,
        no_roots,
    )
    .unwrap();

    assert_eq!(output.merged.keys().collect::<Vec<_>>(), vec!["enc.main.w"]);
    assert_eq!(values(&output.merged, "enc.main.w"), vec![2.5, 5.0]);
    assert!(output.warnings.is_empty());

    let out = dir.path().join("merged.safetensors");
    save_checkpoint(&output.merged, &out).unwrap();
    let reloaded = load_checkpoint(&out, &Device::Cpu).unwrap();
    assert_eq!(reloaded, output.merged);
    assert_eq!(
        reloaded.get("enc.main.w").and_then(Value::as_tensor).unwrap().dtype(),
        Dtype::F32
    );
}

#[test]
fn test_merged_output_previews_as_tree() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_checkpoint(dir.path(), "a.safetensors", &[("w", vec![1.0; 4])]);

    let output = ratio_merge(
        &FileLoader::new(),
        &[&a],
        None,
        &[] as &[&str],
        Device::Cpu,
        &["ALL"],
    )
    .unwrap();

    let nodes = flatten(&output.merged);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].values, vec!["(4,)".to_string()]);
}

#[test]
fn test_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_checkpoint(dir.path(), "a.safetensors", &[("w", vec![1.0])]);
    let missing = dir.path().join("missing.safetensors");

    let err = ratio_merge(
        &FileLoader::new(),
        &[&a, &missing],
        None,
        &[] as &[&str],
        Device::Cpu,
        &[] as &[&str],
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::ModelLoad(_)));
}

#[test]
fn test_config_file_drives_merge() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_checkpoint(dir.path(), "a.safetensors", &[("w", vec![2.0])]);
    let b = write_checkpoint(dir.path(), "b.safetensors", &[("w", vec![4.0])]);

    let yaml = format!(
        "models:\n  - model: {}\n  - model: {}\nroots: [ALL]\n",
        a.display(),
        b.display()
    );
    let config_path = dir.path().join("merge.yaml");
    std::fs::write(&config_path, yaml).unwrap();

    let config = RatioMergeConfig::from_yaml_file(&config_path).unwrap();
    let job = config.to_job().unwrap();
    let output = torchspector_merge::run_ratio_merge(&FileLoader::new(), &job).unwrap();
    assert_eq!(values(&output.merged, "w"), vec![3.0]);
}
