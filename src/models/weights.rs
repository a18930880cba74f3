//! Safetensors reading and writing for layer weights

use candle_core::{DType, Device, Tensor};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{FinetuneError, Result};

fn convert_dtype(dtype: DType) -> Result<SafeDtype> {
    match dtype {
        DType::F32 => Ok(SafeDtype::F32),
        DType::F16 => Ok(SafeDtype::F16),
        DType::BF16 => Ok(SafeDtype::BF16),
        DType::U8 => Ok(SafeDtype::U8),
        DType::U32 => Ok(SafeDtype::U32),
        DType::I64 => Ok(SafeDtype::I64),
        other => Err(FinetuneError::Model(format!(
            "unsupported dtype for safetensors: {:?}",
            other
        ))),
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<u8>> {
    let flattened = tensor.flatten_all()?;
    let data = match tensor.dtype() {
        DType::F32 => flattened
            .to_vec1::<f32>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::F16 => flattened
            .to_vec1::<half::f16>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::BF16 => flattened
            .to_vec1::<half::bf16>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::U8 => flattened.to_vec1::<u8>()?,
        DType::U32 => flattened
            .to_vec1::<u32>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        DType::I64 => flattened
            .to_vec1::<i64>()?
            .into_iter()
            .flat_map(|f| f.to_le_bytes())
            .collect(),
        other => {
            return Err(FinetuneError::Model(format!(
                "unsupported tensor dtype for conversion: {:?}",
                other
            )))
        }
    };
    Ok(data)
}

/// Writes tensors in the given order with string metadata.
pub fn write_safetensors(
    path: &Path,
    tensors: &[(String, Tensor)],
    metadata: HashMap<String, String>,
) -> Result<()> {
    let mut tensor_data = Vec::with_capacity(tensors.len());
    for (_, tensor) in tensors {
        tensor_data.push(tensor_to_vec(tensor)?);
    }

    let mut views = HashMap::new();
    for ((name, tensor), data) in tensors.iter().zip(tensor_data.iter()) {
        let view = TensorView::new(convert_dtype(tensor.dtype())?, tensor.dims().to_vec(), data)
            .map_err(|e| FinetuneError::persistence(path, format!("{:?}", e)))?;
        views.insert(name.clone(), view);
    }

    let bytes = serialize(&views, &Some(metadata))
        .map_err(|e| FinetuneError::persistence(path, format!("{:?}", e)))?;
    fs::write(path, bytes).map_err(|e| FinetuneError::persistence(path, e))?;
    Ok(())
}

/// Loads every tensor plus the header metadata.
pub fn read_safetensors(
    path: &Path,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let bytes = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&bytes)
        .map_err(|e| FinetuneError::Model(format!("{}: {:?}", path.display(), e)))?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = candle_core::safetensors::load(path, device)?;
    Ok((tensors, metadata))
}
