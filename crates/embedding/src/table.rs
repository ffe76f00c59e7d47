//! Range-checked embedding lookup tables.

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::errors::EmbeddingError;

/// A `(size, hidden)` lookup table addressed by integer ids.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    name: String,
    weight: Tensor,
}

impl EmbeddingTable {
    /// Wraps an explicit `(size, hidden)` weight. `name` appears in errors.
    pub fn new(name: impl Into<String>, weight: Tensor) -> Result<Self, EmbeddingError> {
        let name = name.into();
        let (size, hidden) = weight.dims2().map_err(|_| {
            EmbeddingError::shape(format!(
                "{name}: weight must be (size, hidden), got {:?}",
                weight.dims()
            ))
        })?;
        if size == 0 || hidden == 0 {
            return Err(EmbeddingError::shape(format!(
                "{name}: weight must be non-empty, got ({size}, {hidden})"
            )));
        }
        if !weight.dtype().is_float() {
            return Err(EmbeddingError::shape(format!(
                "{name}: weight must be floating point, got {:?}",
                weight.dtype()
            )));
        }
        Ok(Self { name, weight })
    }

    /// Pulls `weight` from `vb`, sampling `N(0, 1)` on on-demand backends.
    pub fn load(
        name: impl Into<String>,
        size: usize,
        hidden: usize,
        vb: VarBuilder,
    ) -> Result<Self, EmbeddingError> {
        let weight = vb.get_with_hints(
            (size, hidden),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Self::new(name, weight)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Gathers rows for integer `ids` of any shape, returning `ids.dims() + [hidden]`.
    pub fn lookup(&self, ids: &Tensor) -> Result<Tensor, EmbeddingError> {
        if !ids.dtype().is_int() {
            return Err(EmbeddingError::shape(format!(
                "{}: ids expected integer dtype but received {:?}",
                self.name,
                ids.dtype()
            )));
        }

        let flat = ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_range(&flat)?;

        let mut output_dims = ids.dims().to_vec();
        output_dims.push(self.hidden_size());
        Ok(self.weight.index_select(&flat, 0)?.reshape(output_dims)?)
    }

    fn ensure_range(&self, flat_ids: &Tensor) -> Result<(), EmbeddingError> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }

        let out_of_range = |index| EmbeddingError::IndexOutOfRange {
            table: self.name.clone(),
            index,
            size: self.size(),
        };

        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(out_of_range(min_id));
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.size() as i64 {
            return Err(out_of_range(max_id));
        }
        Ok(())
    }
}
