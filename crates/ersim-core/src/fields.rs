//! Field selection and recommendation cache
//!
//! The selection is the set of sink fields a downstream cache step reads.
//! It is stored whole under one key and never partially merged. On first
//! use it is initialised with [`DEFAULT_FIELDS`].
//!
//! Recommendations come from the model when one is configured and fall back
//! to a static priority list on any failure. Either way the result never
//! contains a field that is already selected.

use crate::config::CallSettings;
use crate::error::GenerationError;
use chrono::{DateTime, Utc};
use ersim_llm::ChatModel;
use ersim_sheets::{get_json, set_json, KeyValueStore, KvError};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key holding the current selection
pub const SELECTION_KEY: &str = "fields.selection";
/// Key holding the last recommendations
pub const RECOMMENDATIONS_KEY: &str = "fields.recommendations";

/// Upper bound on returned recommendations
pub const MAX_RECOMMENDATIONS: usize = 10;

/// Rationale attached to static recommendations
pub const STATIC_RATIONALE: &str = "Recommended for pathway discovery";

/// Available fields listed in the prompt
const PROMPT_FIELD_LIMIT: usize = 100;

/// Selection used until a user saves one
pub const DEFAULT_FIELDS: &[&str] = &[
    "Case_Organization_Case_ID",
    "Case_Organization_Spark_Title",
    "Case_Organization_Reveal_Title",
    "Case_Organization_Pathway_or_Course_Name",
    "Case_Organization_Pre_Sim_Overview",
    "Case_Organization_Post_Sim_Overview",
    "Case_Organization_Medical_Category",
    "Case_Organization_Difficulty_Level",
    "Set_the_Stage_Context_Educational_Goal",
    "Set_the_Stage_Context_Why_It_Matters",
    "Set_the_Stage_Context_Environment_Type",
    "Patient_Demographics_and_Clinical_Data_Age",
    "Patient_Demographics_and_Clinical_Data_Gender",
    "Patient_Demographics_and_Clinical_Data_Presenting_Complaint",
    "Monitor_Vital_Signs_Initial_Vitals",
    "Situation_and_Environment_Details_Disposition_Plan",
];

/// Static recommendations, highest priority first
pub const STATIC_RECOMMENDATIONS: &[&str] = &[
    "Patient_Demographics_and_Clinical_Data_Presenting_Complaint",
    "Monitor_Vital_Signs_Initial_Vitals",
    "Patient_Demographics_and_Clinical_Data_Exam_Positive_Findings",
    "Patient_Demographics_and_Clinical_Data_Current_Medications",
    "Patient_Demographics_and_Clinical_Data_Past_Medical_History",
    "Patient_Demographics_and_Clinical_Data_Allergies",
    "Patient_Demographics_and_Clinical_Data_History_of_Present_Illness",
    "Situation_and_Environment_Details_Triage_or_SBAR_Note",
    "Set_the_Stage_Context_Case_Summary_Concise",
    "Monitor_Vital_Signs_State1_Vitals",
    "Situation_and_Environment_Details_Disposition_Plan",
    "Case_Organization_Final_Diagnosis",
];

/// Where a selection came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Initialised on first use
    Default,
    /// Saved by a user
    User,
    /// Explicitly reset to defaults
    Reset,
}

/// Ordered set of selected field names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelection {
    /// Selected fields, in selection order
    pub selected: IndexSet<String>,
    /// Origin of this selection
    pub source: SelectionSource,
}

impl FieldSelection {
    /// A user selection
    #[must_use]
    pub fn user<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected: fields.into_iter().map(Into::into).collect(),
            source: SelectionSource::User,
        }
    }

    /// The default set, limited to `available` when known
    #[must_use]
    pub fn defaults(source: SelectionSource, available: Option<&[String]>) -> Self {
        let selected = DEFAULT_FIELDS
            .iter()
            .filter(|f| available.map_or(true, |a| a.iter().any(|x| x.as_str() == **f)))
            .map(|f| (*f).to_string())
            .collect();
        Self { selected, source }
    }

    /// Whether `field` is selected
    #[inline]
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.selected.contains(field)
    }

    /// Number of selected fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// Whether nothing is selected
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// One suggested field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Field name
    pub name: String,
    /// Why it is suggested
    pub rationale: String,
}

/// How a recommendation list was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSource {
    /// Model response
    Ai,
    /// Static priority list
    Static,
}

/// Last recommendations, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRecommendations {
    /// Producer
    pub source: RecommendationSource,
    /// Suggestions
    pub recommendations: Vec<Recommendation>,
    /// When they were produced
    pub generated_at: DateTime<Utc>,
}

/// Parse model output into raw recommendations
///
/// Accepts objects with `name` and `rationale` as well as bare strings.
pub fn parse_recommendations(raw: &str) -> Result<Vec<Recommendation>, GenerationError> {
    let content = ersim_llm::message_content(raw)?;
    let array = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            return Err(GenerationError::InvalidPayload(
                "no JSON array in recommendation response".to_string(),
            ))
        }
    };
    let items: Vec<Value> =
        serde_json::from_str(array).map_err(|e| GenerationError::InvalidPayload(e.to_string()))?;

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(Recommendation {
                name,
                rationale: String::new(),
            }),
            Value::Object(map) => {
                let name = map.get("name").and_then(Value::as_str)?.to_string();
                let rationale = map
                    .get("rationale")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(Recommendation { name, rationale })
            }
            _ => None,
        })
        .collect())
}

/// Drop selected, unavailable and repeated fields, then cap the list
fn finalize(
    candidates: Vec<Recommendation>,
    selected: &FieldSelection,
    available: &[String],
) -> Vec<Recommendation> {
    let mut seen = IndexSet::new();
    candidates
        .into_iter()
        .map(|mut r| {
            r.name = r.name.trim().to_string();
            if r.rationale.trim().is_empty() {
                r.rationale = STATIC_RATIONALE.to_string();
            }
            r
        })
        .filter(|r| !r.name.is_empty() && !selected.contains(&r.name))
        .filter(|r| available.is_empty() || available.iter().any(|a| a == &r.name))
        .filter(|r| seen.insert(r.name.clone()))
        .take(MAX_RECOMMENDATIONS)
        .collect()
}

fn static_candidates() -> Vec<Recommendation> {
    STATIC_RECOMMENDATIONS
        .iter()
        .map(|name| Recommendation {
            name: (*name).to_string(),
            rationale: STATIC_RATIONALE.to_string(),
        })
        .collect()
}

/// Persisted selection plus recommendation lookups
#[derive(Clone)]
pub struct FieldRecommendationCache {
    kv: Arc<dyn KeyValueStore>,
    model: Option<Arc<dyn ChatModel>>,
    call: CallSettings,
}

impl fmt::Debug for FieldRecommendationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldRecommendationCache")
            .field("ai", &self.model.is_some())
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

impl FieldRecommendationCache {
    /// Create a cache with static recommendations only
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, call: CallSettings) -> Self {
        Self {
            kv,
            model: None,
            call,
        }
    }

    /// Ask `model` for recommendations
    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Current selection, initialising the default set on first use
    pub fn load(&self, available: Option<&[String]>) -> Result<FieldSelection, KvError> {
        match get_json::<FieldSelection>(self.kv.as_ref(), SELECTION_KEY) {
            Ok(Some(selection)) => return Ok(selection),
            Ok(None) => debug!("no saved field selection, using defaults"),
            Err(e @ KvError::Serialization { .. }) => {
                warn!("saved field selection unreadable ({}), using defaults", e);
            }
            Err(e) => return Err(e),
        }
        let selection = FieldSelection::defaults(SelectionSource::Default, available);
        set_json(self.kv.as_ref(), SELECTION_KEY, &selection)?;
        Ok(selection)
    }

    /// Replace the stored selection
    pub fn save(&self, selection: &FieldSelection) -> Result<(), KvError> {
        set_json(self.kv.as_ref(), SELECTION_KEY, selection)?;
        info!("saved {} selected field(s)", selection.len());
        Ok(())
    }

    /// Restore and persist the default selection
    pub fn reset(&self, available: Option<&[String]>) -> Result<FieldSelection, KvError> {
        let selection = FieldSelection::defaults(SelectionSource::Reset, available);
        set_json(self.kv.as_ref(), SELECTION_KEY, &selection)?;
        info!("field selection reset to {} default(s)", selection.len());
        Ok(selection)
    }

    /// Prompt asking for fields beyond `selected`
    #[must_use]
    pub fn build_prompt(&self, selected: &FieldSelection, available: &[String]) -> String {
        let selected: Vec<&String> = selected.selected.iter().collect();
        let unselected: Vec<&String> = available
            .iter()
            .filter(|f| !selected.contains(f))
            .take(PROMPT_FIELD_LIMIT)
            .collect();
        format!(
            "You are a medical education expert analyzing emergency medicine simulation cases.\n\
             Currently selected fields:\n{}\n\n\
             Available fields you may recommend:\n{}\n\n\
             Recommend additional fields that maximize both logic variance (different decision \
             pathways, treatments and diagnostic reasoning) and educational value. Never \
             recommend a field that is already selected.\n\
             Return ONLY a JSON array: \
             [{{\"name\": \"Exact_Field_Name\", \"rationale\": \"...\"}}]. \
             Maximum {} items.",
            serde_json::to_string_pretty(&selected).unwrap_or_default(),
            serde_json::to_string_pretty(&unselected).unwrap_or_default(),
            MAX_RECOMMENDATIONS
        )
    }

    /// Recommend up to ten unselected fields from `available`
    ///
    /// Model failures fall back to the static list; only persistence errors
    /// are returned.
    pub async fn recommend(
        &self,
        selected: &FieldSelection,
        available: &[String],
    ) -> Result<Vec<Recommendation>, KvError> {
        let from_model = match &self.model {
            Some(model) => match self.ask(model.as_ref(), selected, available).await {
                Ok(candidates) => {
                    let list = finalize(candidates, selected, available);
                    if list.is_empty() {
                        warn!("model recommended nothing usable, using static list");
                    }
                    Some(list).filter(|l| !l.is_empty())
                }
                Err(e) => {
                    warn!("field recommendation failed ({}), using static list", e);
                    None
                }
            },
            None => None,
        };

        let (source, recommendations) = match from_model {
            Some(list) => (RecommendationSource::Ai, list),
            None => (
                RecommendationSource::Static,
                finalize(static_candidates(), selected, available),
            ),
        };
        debug!("{} recommendation(s) from {:?}", recommendations.len(), source);

        let cached = CachedRecommendations {
            source,
            recommendations,
            generated_at: Utc::now(),
        };
        set_json(self.kv.as_ref(), RECOMMENDATIONS_KEY, &cached)?;
        Ok(cached.recommendations)
    }

    async fn ask(
        &self,
        model: &dyn ChatModel,
        selected: &FieldSelection,
        available: &[String],
    ) -> Result<Vec<Recommendation>, GenerationError> {
        let request = self.call.request(self.build_prompt(selected, available));
        let raw = model.complete(&request).await?;
        parse_recommendations(&raw)
    }

    /// Recommendations from the last `recommend` call
    pub fn cached_recommendations(&self) -> Result<Option<CachedRecommendations>, KvError> {
        get_json(self.kv.as_ref(), RECOMMENDATIONS_KEY)
    }
}
