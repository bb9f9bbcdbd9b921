//! Generation worker
//!
//! Turns one schema-resolved source row into a structured [`Record`] with a
//! single model call. Retries are not attempted here; see
//! [`crate::retry::RetryPolicy`].

use crate::config::CallSettings;
use crate::error::GenerationError;
use crate::record::{Record, ResolvedRow};
use ersim_llm::ChatModel;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::debug;

/// Default system message for conversion calls
pub const DEFAULT_SYSTEM_PROMPT: &str = "You convert emergency-medicine case descriptions \
into structured simulation records. Respond with a single JSON object and nothing else.";

/// Default conversion instructions
pub const DEFAULT_INSTRUCTIONS: &str = "Convert the case below into a simulation record. \
Vitals blocks are JSON objects with HR, BP (\"120/80\"), SpO2, RR, Temp, EtCO2 and a \
waveform ending in _ecg. Omit fields you cannot infer.";

/// Prompt template for conversion calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSpec {
    /// System message
    pub system: String,
    /// Instructions preceding the case content
    pub instructions: String,
    /// Keys the record must use (sink Tier-2 headers)
    pub output_fields: Vec<String>,
}

impl Default for PromptSpec {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            output_fields: Vec::new(),
        }
    }
}

impl PromptSpec {
    /// Restrict record keys to `fields`
    #[must_use]
    pub fn with_output_fields(mut self, fields: Vec<String>) -> Self {
        self.output_fields = fields;
        self
    }

    /// Render the user prompt for `row`
    ///
    /// Only resolved, non-empty fields appear, each under its label.
    #[must_use]
    pub fn render(&self, row: &ResolvedRow) -> String {
        let mut prompt = String::with_capacity(1024);
        prompt.push_str(&self.instructions);
        if !self.output_fields.is_empty() {
            let _ = write!(
                prompt,
                "\n\nUse exactly these keys: {}",
                self.output_fields.join(", ")
            );
        }
        prompt.push_str("\n\n");
        for value in row.values.iter().filter(|v| !v.value.is_empty()) {
            let _ = write!(prompt, "### {}\n{}\n\n", value.label, value.value);
        }
        prompt.trim_end().to_string()
    }
}

/// Produces records from source rows
#[derive(Clone)]
pub struct GenerationWorker {
    model: Arc<dyn ChatModel>,
    settings: CallSettings,
}

impl fmt::Debug for GenerationWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationWorker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl GenerationWorker {
    /// Create a worker calling `model` with `settings`
    #[inline]
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>, settings: CallSettings) -> Self {
        Self { model, settings }
    }

    /// Call settings in use
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    /// Generate a record for `row` with exactly one model call
    pub async fn generate(
        &self,
        row: &ResolvedRow,
        prompt: &PromptSpec,
    ) -> Result<Record, GenerationError> {
        let request = self
            .settings
            .request(prompt.render(row))
            .with_system(prompt.system.clone());

        debug!("generating record for source row {}", row.row);
        let raw = self.model.complete(&request).await?;
        let payload = ersim_llm::unwrap(&raw)?;
        Record::from_payload(payload)
    }
}
