//! Structured prompt context
//!
//! Rows of a workshop plan (week, topic, who leads it, a linked resource)
//! are rendered as a plain-text preamble ahead of the user's question.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextRow {
    pub week: String,
    pub topic: String,
    pub who_initiates: String,
    pub link_text: String,
    pub link_url: Option<String>,
}

impl ContextRow {
    fn is_empty(&self) -> bool {
        self.topic.is_empty() && self.link_text.is_empty()
    }

    fn render(&self) -> String {
        let mut line = format!("- Week {}: {} ({})", self.week, self.topic, self.link_text);
        if let Some(url) = self.link_url.as_deref().filter(|u| !u.is_empty()) {
            line.push_str(" - ");
            line.push_str(url);
        }
        line
    }
}

/// Context supplied alongside a prompt
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    rows: Vec<ContextRow>,
}

impl PromptContext {
    /// Rows with neither a topic nor link text are dropped
    pub fn new(rows: Vec<ContextRow>) -> Self {
        Self {
            rows: rows.into_iter().filter(|r| !r.is_empty()).collect(),
        }
    }

    /// Load rows from a JSON array file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::IoRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let rows: Vec<ContextRow> = serde_json::from_str(&content)
            .map_err(|e| Error::malformed(format!("context file {}: {}", path.display(), e)))?;
        Ok(Self::new(rows))
    }

    pub fn rows(&self) -> &[ContextRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The preamble text, empty when there are no rows
    pub fn preamble(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = self.rows.iter().map(ContextRow::render).collect();
        format!("File data loaded:\n{}\n\n", lines.join("\n"))
    }

    /// `prompt` with the preamble prepended
    pub fn apply(&self, prompt: &str) -> String {
        format!("{}{}", self.preamble(), prompt)
    }
}
