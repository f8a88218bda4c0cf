use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::info;
use tch::{Device, Tensor};

use crate::tokenizer::TextTokenizer;

/// Walks a token stream front to back in `batch_size * seq_len` strides.
///
/// Each batch is `(input, target)` with target = input shifted by one token.
/// When the next read would run past the end, the cursor goes back to 0 and
/// the tail is dropped.
pub struct CorpusBatcher {
    tokens: Vec<i64>,
    batch_size: usize,
    seq_len: usize,
    current_position: usize,
    device: Device,
}

impl CorpusBatcher {
    pub fn new(tokens: Vec<i64>, batch_size: usize, seq_len: usize, device: Device) -> Result<Self> {
        ensure!(batch_size > 0 && seq_len > 0, "batch_size and seq_len must be positive");
        ensure!(
            tokens.len() > batch_size * seq_len,
            "corpus has {} tokens, a batch of {}x{} needs at least {}",
            tokens.len(),
            batch_size,
            seq_len,
            batch_size * seq_len + 1
        );

        info!("loaded {} tokens", tokens.len());
        info!("1 epoch = {} batches", tokens.len() / (batch_size * seq_len));

        Ok(Self {
            tokens,
            batch_size,
            seq_len,
            current_position: 0,
            device,
        })
    }

    /// Reads the whole corpus file once and tokenizes it.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        tokenizer: &dyn TextTokenizer,
        batch_size: usize,
        seq_len: usize,
        device: Device,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus at {:?}", path))?;
        let tokens = tokenizer
            .encode(&text)
            .with_context(|| format!("Failed to tokenize corpus at {:?}", path))?;
        Self::new(tokens, batch_size, seq_len, device)
    }

    pub fn next_batch(&mut self) -> (Tensor, Tensor) {
        let (b, t) = (self.batch_size, self.seq_len);
        let start = self.current_position;
        let buf = &self.tokens[start..start + b * t + 1];

        let input = Tensor::from_slice(&buf[..b * t])
            .view([b as i64, t as i64])
            .to(self.device);
        let target = Tensor::from_slice(&buf[1..])
            .view([b as i64, t as i64])
            .to(self.device);

        self.current_position += b * t;
        if self.current_position + (b * t + 1) > self.tokens.len() {
            self.current_position = 0;
        }
        (input, target)
    }

    pub fn current_position(&self) -> usize {
        self.current_position
    }

    pub fn tokens_per_batch(&self) -> usize {
        self.batch_size * self.seq_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::DigitTokenizer;
    use std::io::Write;

    fn to_rows(t: &Tensor) -> Vec<Vec<i64>> {
        Vec::<Vec<i64>>::try_from(t).unwrap()
    }

    fn counting(n: i64) -> CorpusBatcher {
        CorpusBatcher::new((0..n).collect(), 2, 3, Device::Cpu).unwrap()
    }

    #[test]
    fn first_batch_is_shifted_by_one() {
        let mut batcher = counting(1000);
        let (x, y) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(to_rows(&y), vec![vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(batcher.current_position(), 6);

        let (x, y) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![6, 7, 8], vec![9, 10, 11]]);
        assert_eq!(to_rows(&y), vec![vec![7, 8, 9], vec![10, 11, 12]]);
        assert_eq!(batcher.current_position(), 12);
    }

    #[test]
    fn cursor_wraps_on_the_overflowing_call() {
        let mut batcher = counting(1000);
        // After call k the cursor would be 6k; it wraps once 6k + 7 > 1000.
        for call in 1..=165 {
            batcher.next_batch();
            assert_eq!(batcher.current_position(), 6 * call);
        }
        let (x, _) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![990, 991, 992], vec![993, 994, 995]]);
        assert_eq!(batcher.current_position(), 0);

        let (x, _) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn exact_fit_corpus_repeats_the_same_batch() {
        let mut batcher = CorpusBatcher::new((0..7).collect(), 2, 3, Device::Cpu).unwrap();
        let (first, _) = batcher.next_batch();
        assert_eq!(batcher.current_position(), 0);
        let (second, _) = batcher.next_batch();
        assert!(first.equal(&second));
    }

    #[test]
    fn too_short_corpus_is_rejected() {
        assert!(CorpusBatcher::new((0..6).collect(), 2, 3, Device::Cpu).is_err());
        assert!(CorpusBatcher::new((0..10).collect(), 0, 3, Device::Cpu).is_err());
    }

    #[test]
    fn from_file_tokenizes_corpus() {
        let path = std::env::temp_dir().join("trainer_dataset_corpus.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "0123456789").unwrap();
        drop(f);

        let result = CorpusBatcher::from_file(&path, &DigitTokenizer, 1, 4, Device::Cpu);
        let _ = std::fs::remove_file(&path);
        let mut batcher = result.unwrap();

        let (x, y) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![0, 1, 2, 3]]);
        assert_eq!(to_rows(&y), vec![vec![1, 2, 3, 4]]);
        // ten tokens hold two strides of four before the wrap
        let (x, _) = batcher.next_batch();
        assert_eq!(to_rows(&x), vec![vec![4, 5, 6, 7]]);
        assert_eq!(batcher.current_position(), 0);
    }

    #[test]
    fn from_file_reports_missing_corpus() {
        let result = CorpusBatcher::from_file(
            "/nonexistent/corpus.txt",
            &DigitTokenizer,
            1,
            4,
            Device::Cpu,
        );
        let err = result.err().unwrap();
        assert!(format!("{:#}", err).contains("Failed to read corpus"));
    }
}
