//! Shot label tokenization.
//!
//! Each image comes with `S` shot descriptions. They are tokenized, padded
//! or truncated to a fixed context length and stacked into a
//! `[N, S, L]` u32 tensor, which is what the backbone's text tower consumes.

use std::path::Path;

use anyhow::Context;
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// CLIP text context length
pub const CONTEXT_LENGTH: usize = 77;

/// Id written into unused token slots
pub const PAD_TOKEN_ID: u32 = 0;

/// Separator between shot descriptions inside one label string
pub const SHOT_SEPARATOR: char = ';';

/// Anything that can turn a description into token ids.
pub trait ShotTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;
}

impl ShotTokenizer for Tokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Load a `tokenizer.json` from disk.
pub fn load_tokenizer(path: impl AsRef<Path>) -> anyhow::Result<Tokenizer> {
    let path = path.as_ref();
    Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to load tokenizer {}", path.display()))
}

fn pad_or_truncate(mut ids: Vec<u32>, context_length: usize) -> Vec<u32> {
    ids.truncate(context_length);
    ids.resize(context_length, PAD_TOKEN_ID);
    ids
}

/// Tokenize `shots[i][j]` (description `j` of image `i`) into `[N, S, L]`.
///
/// Every image must carry the same number of shots.
pub fn tokenize_shots<T: ShotTokenizer + ?Sized>(
    tokenizer: &T,
    shots: &[Vec<String>],
    context_length: usize,
    device: &Device,
) -> Result<Tensor> {
    let shot_count = shots.first().map(|s| s.len()).unwrap_or(0);
    let mut ids = Vec::with_capacity(shots.len() * shot_count * context_length);
    for image_shots in shots {
        if image_shots.len() != shot_count {
            return Err(Error::ShotCountMismatch {
                expected: shot_count,
                got: image_shots.len(),
            });
        }
        for text in image_shots {
            let encoded = tokenizer.encode_ids(text)?;
            ids.extend(pad_or_truncate(encoded, context_length));
        }
    }
    Ok(Tensor::from_vec(
        ids,
        (shots.len(), shot_count, context_length),
        device,
    )?)
}

/// Tokenize one label string per image into `[N, shot_count, L]`.
///
/// A label holding `shot_count` descriptions separated by `;` gives one
/// description per shot. A label with a single description is repeated for
/// every shot. Any other split is a shot-count mismatch.
pub fn tokenize_labels<T: ShotTokenizer + ?Sized>(
    tokenizer: &T,
    labels: &[&str],
    shot_count: usize,
    context_length: usize,
    device: &Device,
) -> Result<Tensor> {
    let shots = labels
        .iter()
        .map(|label| split_shots(label, shot_count))
        .collect::<Result<Vec<_>>>()?;
    tokenize_shots(tokenizer, &shots, context_length, device)
}

fn split_shots(label: &str, shot_count: usize) -> Result<Vec<String>> {
    let parts: Vec<String> = label
        .split(SHOT_SEPARATOR)
        .map(|s| s.trim().to_string())
        .collect();
    match parts.len() {
        n if n == shot_count => Ok(parts),
        1 => Ok(vec![parts[0].clone(); shot_count]),
        n => Err(Error::ShotCountMismatch {
            expected: shot_count,
            got: n,
        }),
    }
}
