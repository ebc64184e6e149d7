//! Embedding intents.
//!
//! The underlying model learns a different geometry per intent, so two
//! vectors are only comparable when both were produced under the same
//! intent. Intent is therefore a required argument everywhere an
//! embedding is produced.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Corpus items: notes and document chunks.
    Document,
    /// Short retrieval queries.
    Search,
    /// Natural-language questions.
    QuestionAnswering,
}

impl Intent {
    pub const ALL: [Intent; 3] = [Intent::Document, Intent::Search, Intent::QuestionAnswering];

    /// Prompt prefix placed in front of the text before inference.
    pub const fn template_prefix(self) -> &'static str {
        match self {
            Intent::Document => "title: none | text: ",
            Intent::Search => "task: search result | query: ",
            Intent::QuestionAnswering => "task: question answering | query: ",
        }
    }

    /// Wrap `text` in this intent's template.
    pub fn apply(self, text: &str) -> String {
        let prefix = self.template_prefix();
        let mut prompt = String::with_capacity(prefix.len() + text.len());
        prompt.push_str(prefix);
        prompt.push_str(text);
        prompt
    }

    /// Usable in const assertions.
    pub const fn same_space(self, other: Intent) -> bool {
        self as u8 == other as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Intent::Document => "document",
            Intent::Search => "search",
            Intent::QuestionAnswering => "question_answering",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_are_distinct() {
        for a in Intent::ALL {
            for b in Intent::ALL {
                if a != b {
                    assert_ne!(a.template_prefix(), b.template_prefix());
                }
            }
        }
    }

    #[test]
    fn test_apply_prefixes_text() {
        assert_eq!(Intent::Document.apply("alpha beta"), "title: none | text: alpha beta");
        assert!(Intent::Search.apply("alpha beta").ends_with("alpha beta"));
    }

    #[test]
    fn test_same_space() {
        assert!(Intent::Document.same_space(Intent::Document));
        assert!(!Intent::Document.same_space(Intent::Search));
        assert!(!Intent::Search.same_space(Intent::QuestionAnswering));
    }
}
