//! Pipeline configuration
//!
//! Loaded from TOML; every section and field has a default so a partial file
//! (or none at all) yields a working setup. Model parameters live here rather
//! than at call sites.
//!
//! ```toml
//! [llm.conversion]
//! model = "gpt-4"
//! temperature = 0.3
//!
//! [batch]
//! max_batch_size = 25
//! step_delay_ms = 1000
//! ```

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::schema::FieldSpec;
use ersim_llm::CompletionRequest;
use ersim_sheets::SheetLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding the conversion model
pub const MODEL_ENV: &str = "ERSIM_MODEL";

/// Parameters of one kind of model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSettings {
    /// Model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Completion token ceiling
    pub max_tokens: u32,
}

impl CallSettings {
    /// Create call settings
    #[must_use]
    pub fn new(model: impl Into<String>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens,
        }
    }

    /// Build a request for `prompt` with these settings
    #[must_use]
    pub fn request(&self, prompt: impl Into<String>) -> CompletionRequest {
        CompletionRequest::new(prompt, self.model.clone(), self.temperature)
            .with_max_tokens(self.max_tokens)
    }
}

/// Model endpoint and per-purpose call settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// API root
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-call timeout
    pub timeout_secs: u64,
    /// Row conversion calls
    pub conversion: CallSettings,
    /// Categorization calls
    pub categorization: CallSettings,
    /// Field recommendation calls
    pub recommendation: CallSettings,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: ersim_llm::openai::DEFAULT_BASE_URL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
            conversion: CallSettings::new("gpt-4", 0.3, 4000),
            categorization: CallSettings::new("gpt-4", 0.3, 4000),
            recommendation: CallSettings::new("gpt-4", 0.7, 1000),
        }
    }
}

impl LlmSettings {
    /// Timeout as a duration
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Batch execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Rows per `Next` batch
    pub max_batch_size: usize,
    /// Pause between steps (rate limiting)
    pub step_delay_ms: u64,
    /// Characters of source content fed into the duplicate signature
    pub signature_chars: usize,
    /// Retry policy around each generation call
    pub retry: RetryPolicy,
    /// Step ceiling per scheduler run
    pub max_steps: Option<u32>,
    /// Wall-clock ceiling per scheduler run
    pub max_wall_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            step_delay_ms: 1000,
            signature_chars: 1000,
            retry: RetryPolicy::default(),
            max_steps: None,
            max_wall_secs: 330,
        }
    }
}

impl BatchSettings {
    /// Step delay as a duration
    #[inline]
    #[must_use]
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// Sheet names and header layouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetSettings {
    /// Raw case descriptions
    pub source: String,
    /// Converted records
    pub sink: String,
    /// Categorization results
    pub results: String,
    /// Header rows on the source sheet
    pub source_header_rows: usize,
    /// Header rows on the sink sheet
    pub sink_header_rows: usize,
}

impl Default for SheetSettings {
    fn default() -> Self {
        Self {
            source: "Input".to_string(),
            sink: "Master Scenario Convert".to_string(),
            results: "AI_Categorization_Results".to_string(),
            source_header_rows: 2,
            sink_header_rows: 2,
        }
    }
}

impl SheetSettings {
    /// Source sheet layout
    #[inline]
    #[must_use]
    pub fn source_layout(&self) -> SheetLayout {
        SheetLayout {
            header_rows: self.source_header_rows,
        }
    }

    /// Sink sheet layout
    #[inline]
    #[must_use]
    pub fn sink_layout(&self) -> SheetLayout {
        SheetLayout {
            header_rows: self.sink_header_rows,
        }
    }
}

/// Field mappings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaSettings {
    /// Source columns fed to the model
    pub source_fields: Vec<FieldSpec>,
    /// Sink column holding `<status> | <signature>`
    pub status: FieldSpec,
    /// Tier-1 group written when the status column is created
    pub status_group: String,
    /// Unique record key
    pub primary_key: FieldSpec,
    /// Legacy key, may repeat across records
    pub secondary_key: FieldSpec,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            source_fields: vec![
                FieldSpec::new("formal_info", "Formal_Info", 0).with_label("Formal Info"),
                FieldSpec::new("html", "HTML", 1).with_label("HTML"),
                FieldSpec::new("doc", "DOC", 2).with_label("DOC"),
                FieldSpec::new("extra", "Extra", 3).with_label("Extra"),
            ],
            status: FieldSpec::header_only(
                "conversion_status",
                "Developer_and_QA_Metadata_Conversion_Status",
            ),
            status_group: "Developer_and_QA_Metadata".to_string(),
            primary_key: FieldSpec::new("case_id", "Case_Organization_Case_ID", 0),
            secondary_key: FieldSpec::header_only(
                "legacy_case_id",
                "Case_Organization_Legacy_Case_ID",
            ),
        }
    }
}

/// Quality scoring rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    /// Fields whose absence is a failure
    pub required_fields: Vec<String>,
    /// Vitals blocks whose absence is a failure
    pub required_vitals: Vec<String>,
    /// Vitals blocks whose absence is a warning
    pub optional_vitals: Vec<String>,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            required_fields: vec![
                "Case_Organization_Case_ID".to_string(),
                "Case_Organization_Spark_Title".to_string(),
            ],
            required_vitals: vec!["Monitor_Vital_Signs_Initial_Vitals".to_string()],
            optional_vitals: (1..=5)
                .map(|n| format!("Monitor_Vital_Signs_State{n}_Vitals"))
                .collect(),
        }
    }
}

/// Categorization pass and merge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategorizeSettings {
    /// Cases per model call
    pub batch_size: usize,
    /// Pause between model calls
    pub batch_delay_ms: u64,
    /// Sheet listing standard symptom codes and names
    pub mapping_sheet: String,
    /// Title shown to learners
    pub spark_title: FieldSpec,
    /// Title revealed after the case
    pub reveal_title: FieldSpec,
    /// Sink symptom code column
    pub symptom_code: FieldSpec,
    /// Sink system code column
    pub system_code: FieldSpec,
    /// Sink symptom name column
    pub symptom: FieldSpec,
    /// Sink system name column
    pub system: FieldSpec,
}

impl Default for CategorizeSettings {
    fn default() -> Self {
        Self {
            batch_size: 25,
            batch_delay_ms: 1000,
            mapping_sheet: "accronym_symptom_system_mapping".to_string(),
            spark_title: FieldSpec::header_only("spark_title", "Case_Organization_Spark_Title"),
            reveal_title: FieldSpec::header_only("reveal_title", "Case_Organization_Reveal_Title"),
            symptom_code: FieldSpec::header_only(
                "symptom_code",
                "Case_Organization_Category_Symptom_Code",
            ),
            system_code: FieldSpec::header_only(
                "system_code",
                "Case_Organization_Category_System_Code",
            ),
            symptom: FieldSpec::header_only("symptom", "Case_Organization_Category_Symptom"),
            system: FieldSpec::header_only("system", "Case_Organization_Category_System"),
        }
    }
}

impl CategorizeSettings {
    /// Designated output fields written by the merge
    #[must_use]
    pub fn output_fields(&self) -> [&FieldSpec; 4] {
        [&self.symptom_code, &self.system_code, &self.symptom, &self.system]
    }

    /// Delay between model calls
    #[inline]
    #[must_use]
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model access
    pub llm: LlmSettings,
    /// Batch execution
    pub batch: BatchSettings,
    /// Sheet names
    pub sheets: SheetSettings,
    /// Field mappings
    pub schema: SchemaSettings,
    /// Quality rules
    pub scoring: ScoringSettings,
    /// Categorization
    pub categorize: CategorizeSettings,
}

impl PipelineConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, applying environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_toml_str(&text)?.with_env_overrides())
    }

    /// Apply `ERSIM_MODEL` to the conversion model
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                tracing::debug!("conversion model overridden to {}", model);
                self.llm.conversion.model = model;
            }
        }
        self
    }

    /// Set the batch size
    #[inline]
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch.max_batch_size = size;
        self
    }

    /// Set the inter-step delay
    #[inline]
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.batch.step_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the generation retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.batch.retry = retry;
        self
    }

    /// Check values that deserialize but cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.max_batch_size == 0 {
            return Err(ConfigError::Invalid("batch.max_batch_size must be > 0".into()));
        }
        if self.batch.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("batch.retry.max_attempts must be > 0".into()));
        }
        if self.categorize.batch_size == 0 {
            return Err(ConfigError::Invalid("categorize.batch_size must be > 0".into()));
        }
        if self.sheets.sink_header_rows == 0 {
            return Err(ConfigError::Invalid("sheets.sink_header_rows must be > 0".into()));
        }
        if self.schema.source_fields.is_empty() {
            return Err(ConfigError::Invalid("schema.source_fields is empty".into()));
        }
        for (name, call) in [
            ("conversion", &self.llm.conversion),
            ("categorization", &self.llm.categorization),
            ("recommendation", &self.llm.recommendation),
        ] {
            if !(0.0..=2.0).contains(&call.temperature) {
                return Err(ConfigError::Invalid(format!(
                    "llm.{name}.temperature must be within 0..=2"
                )));
            }
        }
        Ok(())
    }
}
