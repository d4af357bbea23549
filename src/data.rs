//! Plain-text corpus loading, vocabulary and batch assembly.
//!
//! The corpus is one sentence per line. Each sentence is lowercased, split
//! on whitespace, truncated or right-padded to `sentence_len`, and then
//! padded with `filter_shape - 1` pad tokens on both sides:
//!
//! ```text
//! [pad × (fs-1)] [w1 w2 … pad pad] [pad × (fs-1)]     length t1
//! ```

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

pub const PAD: &str = "<pad>";
pub const UNK: &str = "<unk>";
pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;

/// File name of the vocabulary written next to the snapshots.
pub const VOCAB_FILE: &str = "vocab.json";

/// Bijection between tokens and ids. Ids 0 and 1 are `<pad>` and `<unk>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    words: Vec<String>,
    index: HashMap<String, u32>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        let mut vocab = Self {
            words: Vec::new(),
            index: HashMap::new(),
        };
        vocab.add(PAD);
        vocab.add(UNK);
        vocab
    }

    /// Rebuild a vocabulary from its id-ordered word list.
    pub fn from_words(words: Vec<String>) -> Result<Self> {
        if words.first().map(String::as_str) != Some(PAD)
            || words.get(1).map(String::as_str) != Some(UNK)
        {
            return Err(Error::Data(format!(
                "vocabulary must start with {PAD} and {UNK}"
            )));
        }
        let mut index = HashMap::with_capacity(words.len());
        for (id, word) in words.iter().enumerate() {
            if index.insert(word.clone(), id as u32).is_some() {
                return Err(Error::Data(format!("duplicate vocabulary entry {word:?}")));
            }
        }
        Ok(Self { words, index })
    }

    /// Id of `word`, adding it if unseen.
    pub fn add(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.index.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.index.insert(word.to_string(), id);
        id
    }

    pub fn id(&self, word: &str) -> u32 {
        self.index.get(word).copied().unwrap_or(UNK_ID)
    }

    pub fn word(&self, id: u32) -> &str {
        self.words.get(id as usize).map(String::as_str).unwrap_or(UNK)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Join the words of `ids`, dropping padding.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|&&id| id != PAD_ID)
            .map(|&id| self.word(id))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.words)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let words: Vec<String> = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_words(words)
    }
}

/// Lowercase and split on whitespace.
pub fn tokenize(line: &str) -> impl Iterator<Item = String> + '_ {
    line.split_whitespace().map(str::to_lowercase)
}

/// Truncate/pad `ids` to `sentence_len`, then add `filter_shape - 1` pads on
/// each side.
pub fn pad_sentence(ids: &[u32], sentence_len: usize, filter_shape: usize) -> Vec<u32> {
    let border = filter_shape.saturating_sub(1);
    let mut padded = Vec::with_capacity(sentence_len + 2 * border);
    padded.resize(border, PAD_ID);
    padded.extend(ids.iter().copied().take(sentence_len));
    padded.resize(border + sentence_len, PAD_ID);
    padded.resize(sentence_len + 2 * border, PAD_ID);
    padded
}

/// Padded sentences of a single fixed length.
#[derive(Debug, Clone, Default)]
pub struct SentenceSet {
    sentences: Vec<Vec<u32>>,
}

impl SentenceSet {
    /// Fails with [`Error::Data`] unless every sentence has length `padded_len`.
    pub fn new(sentences: Vec<Vec<u32>>, padded_len: usize) -> Result<Self> {
        if let Some((i, s)) = sentences.iter().enumerate().find(|(_, s)| s.len() != padded_len) {
            return Err(Error::Data(format!(
                "sentence {i} has {} tokens, expected {padded_len}",
                s.len()
            )));
        }
        Ok(Self { sentences })
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn sentences(&self) -> &[Vec<u32>] {
        &self.sentences
    }

    /// Iterate `[B, t1]` batches in order, or in an order drawn from `rng`.
    /// The last batch may be smaller.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        rng: Option<&mut ChaCha8Rng>,
        device: &Device,
    ) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.sentences.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        Batches {
            set: self,
            order,
            batch_size: batch_size.max(1),
            cursor: 0,
            device: device.clone(),
        }
    }
}

/// Iterator over the batches of a [`SentenceSet`].
pub struct Batches<'a> {
    set: &'a SentenceSet,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
    device: Device,
}

impl Iterator for Batches<'_> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picked = &self.order[self.cursor..end];
        self.cursor = end;

        let width = self.set.sentences[picked[0]].len();
        let flat: Vec<u32> = picked
            .iter()
            .flat_map(|&i| self.set.sentences[i].iter().copied())
            .collect();
        Some(Tensor::from_vec(flat, (picked.len(), width), &self.device).map_err(Error::from))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (left, Some(left))
    }
}

/// Vocabulary plus train/test splits, padded for a given model.
#[derive(Debug, Clone)]
pub struct Corpus {
    vocab: Vocabulary,
    train: SentenceSet,
    test: SentenceSet,
}

impl Corpus {
    /// Read a one-sentence-per-line text file.
    pub fn load(
        path: impl AsRef<Path>,
        sentence_len: usize,
        filter_shape: usize,
        test_fraction: f64,
        seed: u64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Data(format!("cannot read corpus {}: {e}", path.display())))?;
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let corpus = Self::from_sentences(&lines, sentence_len, filter_shape, test_fraction, seed)?;
        tracing::info!(
            path = %path.display(),
            vocab = corpus.vocab.len(),
            train = corpus.train.len(),
            test = corpus.test.len(),
            "loaded corpus"
        );
        Ok(corpus)
    }

    /// Build from in-memory sentences. The vocabulary covers every sentence;
    /// `test_fraction` of them, chosen with `seed`, go to the test split.
    pub fn from_sentences<S: AsRef<str>>(
        sentences: &[S],
        sentence_len: usize,
        filter_shape: usize,
        test_fraction: f64,
        seed: u64,
    ) -> Result<Self> {
        if sentences.is_empty() {
            return Err(Error::Data("corpus has no sentences".into()));
        }
        if sentence_len == 0 || filter_shape == 0 {
            return Err(Error::Data(format!(
                "cannot pad sentences with sentence_len={sentence_len}, filter_shape={filter_shape}"
            )));
        }
        if !(0.0..1.0).contains(&test_fraction) {
            return Err(Error::Data(format!(
                "test fraction must be in [0, 1), got {test_fraction}"
            )));
        }

        let mut vocab = Vocabulary::new();
        let padded: Vec<Vec<u32>> = sentences
            .iter()
            .map(|s| {
                let ids: Vec<u32> = tokenize(s.as_ref()).map(|w| vocab.add(&w)).collect();
                pad_sentence(&ids, sentence_len, filter_shape)
            })
            .collect();

        let mut order: Vec<usize> = (0..padded.len()).collect();
        order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        let n_test = ((padded.len() as f64 * test_fraction).round() as usize).min(padded.len() - 1);
        let (test_idx, train_idx) = order.split_at(n_test);

        let padded_len = sentence_len + 2 * (filter_shape - 1);
        let pick = |idx: &[usize]| idx.iter().map(|&i| padded[i].clone()).collect::<Vec<_>>();
        Ok(Self {
            train: SentenceSet::new(pick(train_idx), padded_len)?,
            test: SentenceSet::new(pick(test_idx), padded_len)?,
            vocab,
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Fail with [`Error::Data`] unless this corpus maps every token to the
    /// same id as `saved`. Restored embedding rows are only meaningful for
    /// the vocabulary they were trained with.
    pub fn verify_vocab(&self, saved: &Vocabulary) -> Result<()> {
        if self.vocab == *saved {
            return Ok(());
        }
        if self.vocab.len() != saved.len() {
            return Err(Error::Data(format!(
                "corpus has {} vocabulary entries, the saved vocabulary has {}",
                self.vocab.len(),
                saved.len()
            )));
        }
        let id = (0..self.vocab.len() as u32)
            .find(|&id| self.vocab.word(id) != saved.word(id))
            .unwrap_or(0);
        Err(Error::Data(format!(
            "id {id} is {:?} in the corpus but {:?} in the saved vocabulary",
            self.vocab.word(id),
            saved.word(id)
        )))
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn train(&self) -> &SentenceSet {
        &self.train
    }

    pub fn test(&self) -> &SentenceSet {
        &self.test
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_layout() {
        assert_eq!(pad_sentence(&[5, 6, 7], 4, 3), vec![0, 0, 5, 6, 7, 0, 0, 0]);
        // truncation
        assert_eq!(pad_sentence(&[5, 6, 7], 2, 2), vec![0, 5, 6, 0]);
        // filter_shape 1 adds nothing
        assert_eq!(pad_sentence(&[9], 2, 1), vec![9, 0]);
    }

    #[test]
    fn vocabulary_ids() {
        let mut v = Vocabulary::new();
        assert_eq!(v.id(PAD), PAD_ID);
        let a = v.add("hotel");
        assert_eq!(a, 2);
        assert_eq!(v.add("hotel"), 2);
        assert_eq!(v.id("unknown-word"), UNK_ID);
        assert_eq!(v.decode(&[0, 2, 1, 0]), "hotel <unk>");
    }

    #[test]
    fn vocabulary_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let mut v = Vocabulary::new();
        v.add("clean");
        v.add("room");
        v.save_json(&path).unwrap();
        assert_eq!(Vocabulary::load_json(&path).unwrap(), v);

        assert!(Vocabulary::from_words(vec!["a".into()]).is_err());
    }

    #[test]
    fn corpus_split_and_lengths() {
        let sentences: Vec<String> = (0..20).map(|i| format!("The room {i} was clean")).collect();
        let corpus = Corpus::from_sentences(&sentences, 6, 3, 0.25, 7).unwrap();
        assert_eq!(corpus.train().len(), 15);
        assert_eq!(corpus.test().len(), 5);
        // pad, unk, the, room, was, clean + 20 numbers
        assert_eq!(corpus.vocab_size(), 26);
        assert!(corpus.train().sentences().iter().all(|s| s.len() == 10));
        let first = &corpus.train().sentences()[0];
        assert_eq!(&first[..2], &[PAD_ID, PAD_ID]);
        assert_eq!(corpus.vocab().word(first[2]), "the");
    }

    #[test]
    fn reordered_vocabulary_of_same_size_is_rejected() {
        let corpus = Corpus::from_sentences(&["clean room", "noisy street"], 4, 2, 0.0, 0).unwrap();
        let same = Corpus::from_sentences(&["clean room", "noisy street"], 4, 2, 0.0, 3).unwrap();
        corpus.verify_vocab(same.vocab()).unwrap();

        let swapped = Corpus::from_sentences(&["noisy street", "clean room"], 4, 2, 0.0, 0).unwrap();
        assert_eq!(swapped.vocab_size(), corpus.vocab_size());
        let err = corpus.verify_vocab(swapped.vocab()).err().unwrap();
        assert!(matches!(err, Error::Data(_)), "{err}");
        assert!(err.to_string().contains("id 2"), "{err}");

        let smaller = Corpus::from_sentences(&["clean room"], 4, 2, 0.0, 0).unwrap();
        assert!(matches!(corpus.verify_vocab(smaller.vocab()), Err(Error::Data(_))));
    }

    #[test]
    fn corpus_errors() {
        let none: [&str; 0] = [];
        assert!(matches!(
            Corpus::from_sentences(&none, 5, 2, 0.1, 0),
            Err(Error::Data(_))
        ));
        assert!(Corpus::from_sentences(&["a b"], 5, 2, 1.5, 0).is_err());
        assert!(Corpus::load("/definitely/not/here.txt", 5, 2, 0.1, 0).is_err());
    }

    #[test]
    fn sentence_set_rejects_ragged_input() {
        assert!(matches!(
            SentenceSet::new(vec![vec![1, 2], vec![1]], 2),
            Err(Error::Data(_))
        ));
    }

    #[test]
    fn batches_cover_every_sentence() {
        let set = SentenceSet::new((0..7).map(|i| vec![i, i]).collect(), 2).unwrap();
        let dev = Device::Cpu;
        let shapes: Vec<Vec<usize>> = set
            .batches(3, None, &dev)
            .map(|b| b.unwrap().dims().to_vec())
            .collect();
        assert_eq!(shapes, vec![vec![3, 2], vec![3, 2], vec![1, 2]]);

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut seen: Vec<u32> = set
            .batches(2, Some(&mut rng), &dev)
            .flat_map(|b| b.unwrap().flatten_all().unwrap().to_vec1::<u32>().unwrap())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen, (0..7).collect::<Vec<u32>>());
    }
}
