//! Bounded question/answer history.
//!
//! The log lives only for the lifetime of the process. Appends and the
//! trim back to capacity happen in one write-locked section, and readers
//! always receive an owned snapshot.

use std::collections::VecDeque;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswerPair {
    pub question: String,
    pub answer: String,
}

impl QuestionAnswerPair {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history lock poisoned")]
    Poisoned,
}

/// Storage for accepted question/answer pairs.
pub trait History: Send + Sync {
    fn add(&self, pair: QuestionAnswerPair) -> Result<(), HistoryError>;
    /// Oldest-to-newest copy of the retained pairs.
    fn get_all(&self) -> Result<Vec<QuestionAnswerPair>, HistoryError>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory history keeping the most recent `max_size` pairs.
pub struct MemoryHistory {
    max_size: usize,
    pairs: RwLock<VecDeque<QuestionAnswerPair>>,
}

impl MemoryHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            // Capacity grows on demand; large limits should not cost memory up front.
            pairs: RwLock::new(VecDeque::with_capacity(max_size.min(64))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl History for MemoryHistory {
    fn add(&self, pair: QuestionAnswerPair) -> Result<(), HistoryError> {
        let mut pairs = self.pairs.write().map_err(|_| HistoryError::Poisoned)?;
        pairs.push_back(pair);
        while pairs.len() > self.max_size {
            pairs.pop_front();
        }
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<QuestionAnswerPair>, HistoryError> {
        let pairs = self.pairs.read().map_err(|_| HistoryError::Poisoned)?;
        Ok(pairs.iter().cloned().collect())
    }

    fn len(&self) -> usize {
        self.pairs.read().map(|p| p.len()).unwrap_or(0)
    }
}
