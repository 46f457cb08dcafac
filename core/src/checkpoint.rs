//! Checkpointing of module parameters.
//!
//! Parameters are stored in the `safetensors` format, one `F32` entry per
//! parameter, keyed by its dotted name (see [`Module`]) and carrying its real
//! shape. Loading writes into an already-built module, so the module's
//! structure decides which entries are read.

use crate::nn::Module;
use crate::tensor::{Result, TensorElem, TensorError};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

/// A parameter converted to little-endian `f32` bytes.
struct Encoded {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn encode<T: TensorElem>(name: &str, shape: &[usize], data: &[T]) -> Result<Encoded> {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for x in data {
        let value = x.to_f32().ok_or_else(|| {
            TensorError::Checkpoint(format!("{name}: {x:?} has no f32 representation"))
        })?;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Ok(Encoded {
        shape: shape.to_vec(),
        bytes,
    })
}

/// Saves every parameter of `module` to a safetensors file at `path`.
pub fn save_checkpoint<P: AsRef<Path>, T: TensorElem, M: Module<T> + ?Sized>(
    path: P,
    module: &M,
) -> Result<()> {
    let mut encoded = HashMap::new();
    let mut failure = None;
    module.visit_parameters("", &mut |name, shape, data| {
        if failure.is_some() {
            return;
        }
        match encode(name, shape, data) {
            Ok(e) => {
                encoded.insert(name.to_string(), e);
            }
            Err(e) => failure = Some(e),
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }

    let mut views = HashMap::new();
    for (name, e) in &encoded {
        let view = TensorView::new(Dtype::F32, e.shape.clone(), &e.bytes)
            .map_err(|err| TensorError::Checkpoint(format!("{name}: {err:?}")))?;
        views.insert(name.clone(), view);
    }

    let metadata: Option<HashMap<String, String>> = None;
    safetensors::serialize_to_file(&views, metadata, path.as_ref()).map_err(|e| {
        TensorError::Checkpoint(format!(
            "failed to write {}: {e:?}",
            path.as_ref().display()
        ))
    })?;
    debug!(path = %path.as_ref().display(), tensors = views.len(), "saved checkpoint");
    Ok(())
}

/// Loads the parameters of `module` from a safetensors file at `path`.
///
/// # Errors
///
/// `TensorError::Checkpoint` if the file cannot be read, or if an entry is
/// missing, is not `F32`, or has a different shape than the parameter.
pub fn load_checkpoint<P: AsRef<Path>, T: TensorElem, M: Module<T> + ?Sized>(
    path: P,
    module: &mut M,
) -> Result<()> {
    let path = path.as_ref();
    let content = std::fs::read(path).map_err(|e| {
        TensorError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    let file = SafeTensors::deserialize(&content).map_err(|e| {
        TensorError::Checkpoint(format!("failed to parse {}: {e:?}", path.display()))
    })?;

    let mut used = HashSet::new();
    module.visit_parameters_mut("", &mut |name, shape, data| {
        let view = file
            .tensor(name)
            .map_err(|_| TensorError::Checkpoint(format!("missing tensor {name}")))?;
        if view.dtype() != Dtype::F32 {
            return Err(TensorError::Checkpoint(format!(
                "{name}: expected F32, found {:?}",
                view.dtype()
            )));
        }
        if view.shape() != shape {
            return Err(TensorError::Checkpoint(format!(
                "{name}: expected shape {shape:?}, found {:?}",
                view.shape()
            )));
        }
        for (dst, chunk) in data.iter_mut().zip(view.data().chunks_exact(4)) {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            *dst = T::from_f32(value).ok_or_else(|| {
                TensorError::Checkpoint(format!("{name}: {value} does not fit the element type"))
            })?;
        }
        used.insert(name.to_string());
        Ok(())
    })?;

    for name in file.names() {
        if !used.contains(name) {
            warn!(tensor = %name, "checkpoint entry not used by the module");
        }
    }
    debug!(path = %path.display(), tensors = used.len(), "loaded checkpoint");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Init, Linear};
    use crate::tensor::Tensor;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::NamedTempFile;

    #[test]
    fn test_linear_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let saved = Linear::<f32>::init(3, 2, Init::Lecun, Some(Init::Std(1.0)), &mut rng).unwrap();
        let file = NamedTempFile::new().unwrap();
        save_checkpoint(file.path(), &saved).unwrap();

        let mut loaded = Linear::<f32>::new(Tensor::zeros([2, 3]), Some(Tensor::zeros([2]))).unwrap();
        load_checkpoint(file.path(), &mut loaded).unwrap();
        assert_eq!(loaded.weight.data(), saved.weight.data());
        assert_eq!(loaded.bias.unwrap().data(), saved.bias.unwrap().data());
    }

    #[test]
    fn test_shape_mismatch() {
        let mut rng = StdRng::seed_from_u64(0);
        let saved = Linear::<f32>::init(3, 2, Init::Lecun, None, &mut rng).unwrap();
        let file = NamedTempFile::new().unwrap();
        save_checkpoint(file.path(), &saved).unwrap();

        let mut wrong = Linear::<f32>::new(Tensor::zeros([3, 2]), None).unwrap();
        let err = load_checkpoint(file.path(), &mut wrong);
        assert!(matches!(err, Err(TensorError::Checkpoint(_))));
    }

    #[test]
    fn test_missing_tensor() {
        let mut rng = StdRng::seed_from_u64(0);
        let saved = Linear::<f32>::init(3, 2, Init::Lecun, None, &mut rng).unwrap();
        let file = NamedTempFile::new().unwrap();
        save_checkpoint(file.path(), &saved).unwrap();

        let mut with_bias = Linear::<f32>::new(Tensor::zeros([2, 3]), Some(Tensor::zeros([2]))).unwrap();
        let err = load_checkpoint(file.path(), &mut with_bias);
        assert!(matches!(err, Err(TensorError::Checkpoint(msg)) if msg.contains("bias")));
    }

    #[test]
    fn test_extra_entries_are_ignored() {
        let mut rng = StdRng::seed_from_u64(1);
        let saved = Linear::<f32>::init(3, 2, Init::Lecun, Some(Init::Std(1.0)), &mut rng).unwrap();
        let file = NamedTempFile::new().unwrap();
        save_checkpoint(file.path(), &saved).unwrap();

        let mut no_bias = Linear::<f32>::new(Tensor::zeros([2, 3]), None).unwrap();
        load_checkpoint(file.path(), &mut no_bias).unwrap();
        assert_eq!(no_bias.weight.data(), saved.weight.data());
    }

    #[test]
    fn test_unreadable_file() {
        let mut layer = Linear::<f32>::new(Tensor::zeros([1, 1]), None).unwrap();
        let err = load_checkpoint("/nonexistent/params.safetensors", &mut layer);
        assert!(matches!(err, Err(TensorError::Checkpoint(_))));
    }
}
