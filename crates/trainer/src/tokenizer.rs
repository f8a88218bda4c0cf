use std::ops::Deref;
use std::path::Path;

use anyhow::{anyhow, Result};

/// Text <-> token id conversion used to feed the batcher.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>>;
    fn decode(&self, ids: &[i64]) -> Result<String>;
    fn vocab_size(&self) -> usize;
}

impl TextTokenizer for tokenizers::Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .deref()
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| u32::try_from(id).map_err(|_| anyhow!("Invalid token id: {}", id)))
            .collect::<Result<Vec<u32>>>()?;
        self.deref()
            .decode(&ids, false)
            .map_err(|e| anyhow!("Failed to decode ids: {}", e))
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// Loads a Hugging Face `tokenizer.json` (e.g. the GPT-2 one, 50257 entries).
pub fn load_tokenizer<P: AsRef<Path>>(path: P) -> Result<tokenizers::Tokenizer> {
    let path = path.as_ref();
    tokenizers::Tokenizer::from_file(path)
        .map_err(|e| anyhow!("Failed to load tokenizer from {:?}: {}", path, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One token per ASCII digit, for tests that need a tokenizer without
    /// vocabulary files.
    pub struct DigitTokenizer;

    impl TextTokenizer for DigitTokenizer {
        fn encode(&self, text: &str) -> Result<Vec<i64>> {
            text.chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| {
                    c.to_digit(10)
                        .map(|d| d as i64)
                        .ok_or_else(|| anyhow!("not a digit: {:?}", c))
                })
                .collect()
        }

        fn decode(&self, ids: &[i64]) -> Result<String> {
            ids.iter()
                .map(|&id| {
                    u32::try_from(id)
                        .ok()
                        .and_then(|d| char::from_digit(d, 10))
                        .ok_or_else(|| anyhow!("Invalid token id: {}", id))
                })
                .collect()
        }

        fn vocab_size(&self) -> usize {
            10
        }
    }

    #[test]
    fn digit_tokenizer_round_trips() {
        let ids = DigitTokenizer.encode("40 2").unwrap();
        assert_eq!(ids, vec![4, 0, 2]);
        assert_eq!(DigitTokenizer.decode(&ids).unwrap(), "402");
        assert!(DigitTokenizer.encode("x").is_err());
    }

    #[test]
    fn missing_tokenizer_file_is_reported() {
        let err = load_tokenizer("/nonexistent/tokenizer.json").unwrap_err();
        assert!(err.to_string().contains("Failed to load tokenizer"));
    }

    #[test]
    fn word_level_tokenizer_json_is_usable() {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"[UNK]": 0, "to": 1, "be": 2, "or": 3, "not": 4},
                "unk_token": "[UNK]"
            }
        }"#;
        let path = std::env::temp_dir().join("trainer_word_level_tokenizer.json");
        std::fs::write(&path, json).unwrap();
        let result = load_tokenizer(&path);
        let _ = std::fs::remove_file(&path);
        let tokenizer = result.unwrap();

        assert_eq!(TextTokenizer::vocab_size(&tokenizer), 5);
        let ids = TextTokenizer::encode(&tokenizer, "to be or not to be").unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 1, 2]);
    }
}
