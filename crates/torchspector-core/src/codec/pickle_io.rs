//! PyTorch pickle archives (`.pt`, `.pth`, `.ckpt`, `.bin`).
//!
//! The archive is a zip holding one `data.pkl` object graph plus one entry
//! per tensor storage. The graph is decoded with candle's pickle machine and
//! turned into a [`Mapping`] in pickle order: dicts become mappings, lists
//! and tuples become sequences, tensors are rebuilt from their storage entry
//! and anything else is kept as a scalar. Objects with no counterpart in the
//! value model are rendered as a short description.

use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use candle_core::pickle::{Object, Stack};
use candle_core::DType;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::{CheckpointError, Dtype, Mapping, Result, Scalar, Tensor, Value};

const PICKLE_SUFFIX: &str = "data.pkl";

pub(super) fn load(path: &Path) -> Result<Mapping> {
    warn!(
        "Pickle checkpoints can embed arbitrary objects; only open {:?} if it comes from a trusted source",
        path
    );

    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let entry = archive
        .file_names()
        .find(|name| name.ends_with(PICKLE_SUFFIX))
        .map(str::to_string)
        .ok_or_else(|| {
            CheckpointError::MalformedArchive(format!("no {PICKLE_SUFFIX} entry in {path:?}"))
        })?;

    let root = {
        let mut reader = BufReader::new(archive.by_name(&entry)?);
        let mut stack = Stack::empty();
        stack.read_loop(&mut reader)?;
        stack.finalize()?
    };

    // Storage entries live next to the pickle, e.g. `archive/data/0`.
    let storage_dir = PathBuf::from(entry.trim_end_matches(".pkl"));
    let mut builder = TreeBuilder {
        archive: &mut archive,
        storage_dir,
        tensors: 0,
    };

    let checkpoint = match builder.value(root, "") {
        Value::Mapping(map) => map,
        other => {
            debug!("Top-level object in {:?} is a {}, wrapping it", path, other.kind());
            let mut map = Mapping::new();
            map.insert("object", other);
            map
        }
    };
    debug!("Rebuilt {} tensors from {:?}", builder.tensors, path);

    Ok(checkpoint)
}

struct TreeBuilder<'a, R> {
    archive: &'a mut ZipArchive<R>,
    storage_dir: PathBuf,
    tensors: usize,
}

impl<R: Read + Seek> TreeBuilder<'_, R> {
    fn value(&mut self, object: Object, path: &str) -> Value {
        match object {
            Object::Dict(items) => Value::Mapping(self.mapping(items, path)),
            Object::List(items) | Object::Tuple(items) => Value::Sequence(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.value(item, &child_path(path, &i.to_string())))
                    .collect(),
            ),
            Object::Int(v) => Scalar::Int(i64::from(v)).into(),
            Object::Long(v) => Scalar::Int(v).into(),
            Object::Float(v) => Scalar::Float(v).into(),
            Object::Bool(v) => Scalar::Bool(v).into(),
            Object::None => Scalar::None.into(),
            Object::Unicode(s) => Scalar::Str(s).into(),
            reduce @ Object::Reduce { .. } => self.reduce(reduce, path),
            Object::Build { callable, args } => match *args {
                // Plain objects pickle their attributes as a state dict.
                Object::Dict(items) => Value::Mapping(self.mapping(items, path)),
                args => Scalar::Str(format!("{}{}", describe(&callable), describe(&args))).into(),
            },
            other => Scalar::Str(describe(&other)).into(),
        }
    }

    fn mapping(&mut self, items: Vec<(Object, Object)>, path: &str) -> Mapping {
        let mut map = Mapping::new();
        for (key, value) in items {
            let key = key_string(key);
            let value = self.value(value, &child_path(path, &key));
            if map.insert(key.clone(), value).is_some() {
                debug!("Duplicate pickle key '{}' under '{}', keeping the last", key, path);
            }
        }
        map
    }

    fn reduce(&mut self, object: Object, path: &str) -> Value {
        let description = describe(&object);
        let info = match object.into_tensor_info(Object::Unicode(path.to_string()), &self.storage_dir)
        {
            Ok(Some(info)) => info,
            Ok(None) => return Scalar::Str(description).into(),
            Err(err) => {
                warn!("Cannot decode tensor at '{}': {}", path, err);
                return Scalar::Str(description).into();
            }
        };

        match self.tensor(&info) {
            Ok(tensor) => {
                self.tensors += 1;
                tensor.into()
            }
            Err(err) => {
                warn!("Cannot read tensor storage for '{}': {}", path, err);
                Scalar::Str(format!("<unreadable tensor {:?}>", info.layout.dims())).into()
            }
        }
    }

    fn tensor(&mut self, info: &candle_core::pickle::TensorInfo) -> Result<Tensor> {
        let dtype = dtype_from_candle(info.dtype)?;
        let mut bytes = Vec::new();
        self.archive.by_name(&info.path)?.read_to_end(&mut bytes)?;

        let storage_len = bytes.len() / dtype.size_bytes();
        let storage = Tensor::from_bytes(&[storage_len], dtype, &bytes)?;
        let layout = &info.layout;
        storage.gather_strided(layout.dims(), layout.stride(), layout.start_offset())
    }
}

fn dtype_from_candle(dtype: DType) -> Result<Dtype> {
    #[allow(unreachable_patterns)]
    match dtype {
        DType::F64 => Ok(Dtype::F64),
        DType::F32 => Ok(Dtype::F32),
        DType::F16 => Ok(Dtype::F16),
        DType::BF16 => Ok(Dtype::BF16),
        DType::I64 => Ok(Dtype::I64),
        DType::U32 => Ok(Dtype::U32),
        DType::U8 => Ok(Dtype::U8),
        other => Err(CheckpointError::UnsupportedDtype(format!("{other:?}"))),
    }
}

fn key_string(key: Object) -> String {
    match key {
        Object::Unicode(s) => s,
        Object::Int(v) => v.to_string(),
        Object::Long(v) => v.to_string(),
        other => describe(&other),
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Short Python-like rendering of an object the value model cannot hold.
fn describe(object: &Object) -> String {
    #[allow(unreachable_patterns)]
    match object {
        Object::Class {
            module_name,
            class_name,
        } => format!("{module_name}.{class_name}"),
        Object::Reduce { callable, .. } => format!("{}(...)", describe(callable)),
        Object::Build { callable, .. } => describe(callable),
        Object::Tuple(items) => format!("({} items)", items.len()),
        Object::List(items) => format!("[{} items]", items.len()),
        Object::Dict(items) => format!("{{{} items}}", items.len()),
        Object::PersistentLoad(_) => "<persistent>".to_string(),
        Object::Unicode(s) => s.clone(),
        Object::Int(v) => v.to_string(),
        Object::Long(v) => v.to_string(),
        Object::Float(v) => v.to_string(),
        Object::Bool(true) => "True".to_string(),
        Object::Bool(false) => "False".to_string(),
        Object::None => "None".to_string(),
        Object::Mark => "<mark>".to_string(),
        _ => "<object>".to_string(),
    }
}
