//! Bag-of-words hashing of text columns.

use regex::Regex;

use crate::error::{PrepError, Result};
use crate::frame::CsrMatrix;
use crate::preprocessing::hashing::hash_tokens;
use crate::preprocessing::step::{PreprocessingStep, StepContext};

use super::append_sparse_with_prefix;

const TOKEN_PATTERN: &str = r"(?u)\b\w\w+\b";

/// Lowercased word tokens hashed into `n_features` signed bins, each row
/// scaled to unit l2 norm. Block `hashvect:<col>`.
pub struct TextHashingVectorizer {
    column: String,
    n_features: usize,
}

impl TextHashingVectorizer {
    pub const DEFAULT_N_FEATURES: usize = 200_000;

    pub fn new(column: impl Into<String>, n_features: usize) -> Self {
        Self {
            column: column.into(),
            n_features: n_features.max(1),
        }
    }

    fn vectorize(&self, texts: &[Option<String>]) -> Result<CsrMatrix> {
        let tokenizer = Regex::new(TOKEN_PATTERN).map_err(|e| PrepError::ComputationError(e.to_string()))?;
        let rows = texts
            .iter()
            .map(|text| {
                let lowered = text.as_deref().unwrap_or("").to_lowercase();
                let mut row = hash_tokens(tokenizer.find_iter(&lowered).map(|m| m.as_str()), self.n_features);
                let norm = row.iter().map(|(_, v)| v * v).sum::<f64>().sqrt();
                if norm > 0.0 {
                    row.iter_mut().for_each(|(_, v)| *v /= norm);
                }
                row
            })
            .collect();
        CsrMatrix::from_rows(self.n_features, rows)
    }
}

impl PreprocessingStep for TextHashingVectorizer {
    fn name(&self) -> String {
        format!("TextHashingVectorizer ({})", self.column)
    }

    fn process(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        let texts = ctx.input.column(&self.column)?.to_text_vec();
        let matrix = self.vectorize(&texts)?;
        append_sparse_with_prefix(ctx, "hashvect:", &self.column, matrix, None)
    }
}
