//! Safetensors reading and writing.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::debug;

use crate::{CheckpointError, Dtype, Mapping, Result, Tensor, Value};

pub(super) fn load(path: &Path) -> Result<Mapping> {
    let file = File::open(path)?;
    // SAFETY: The file is opened read-only and the map outlives every view
    // taken from it in this function.
    #[allow(unsafe_code)]
    let mmap = unsafe { memmap2::Mmap::map(&file)? };

    let tensors = SafeTensors::deserialize(&mmap)?;
    let mut views = tensors.tensors();
    // File order, with the name breaking ties between empty tensors.
    views.sort_by(|(a_name, a), (b_name, b)| {
        (a.data().as_ptr() as usize)
            .cmp(&(b.data().as_ptr() as usize))
            .then_with(|| a_name.cmp(b_name))
    });

    let mut checkpoint = Mapping::new();
    for (name, view) in views {
        let dtype = Dtype::try_from(view.dtype())?;
        let tensor = Tensor::from_bytes(view.shape(), dtype, view.data())?;
        checkpoint.insert(name, tensor);
    }
    debug!("Read {} tensors from {:?}", checkpoint.len(), path);

    Ok(checkpoint)
}

pub(super) fn save(checkpoint: &Mapping, path: &Path) -> Result<()> {
    let mut flat = Vec::new();
    collect_tensors("", checkpoint, &mut flat)?;

    {
        let mut seen = HashSet::with_capacity(flat.len());
        for (name, _) in &flat {
            if !seen.insert(name.as_str()) {
                return Err(CheckpointError::DuplicateKey(name.clone()));
            }
        }
    }

    let encoded: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = flat
        .into_iter()
        .map(|(name, tensor)| {
            (name, tensor.dtype(), tensor.shape().to_vec(), tensor.to_bytes())
        })
        .collect();

    let views = encoded
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            let view = TensorView::new((*dtype).into(), shape.clone(), bytes)?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("Writing {} tensors to {:?}", views.len(), path);
    safetensors::serialize_to_file(views, &None, path)?;

    Ok(())
}

/// Collect tensors, joining nested mapping keys with `.`.
fn collect_tensors<'a>(
    prefix: &str,
    map: &'a Mapping,
    out: &mut Vec<(String, &'a Tensor)>,
) -> Result<()> {
    for (key, value) in map {
        let name = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Tensor(tensor) => out.push((name, tensor)),
            Value::Mapping(inner) => collect_tensors(&name, inner, out)?,
            other => {
                return Err(CheckpointError::NotSerializable {
                    key: name,
                    kind: other.kind(),
                })
            }
        }
    }
    Ok(())
}
