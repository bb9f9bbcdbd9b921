//! AI categorization pass
//!
//! Produces the results sheet consumed by [`crate::merger`]. Cases are read
//! from the sink, sent to the model in batches, and each suggestion is
//! appended as one results row together with how it compares to the code the
//! case already carries (`new`, `match`, `conflict`). Cases already present
//! in the results sheet are skipped.

use crate::config::{CallSettings, CategorizeSettings, PipelineConfig};
use crate::error::{CategorizeError, GenerationError, SchemaError};
use crate::merger::RESULT_CASE_ID;
use crate::schema::{resolve, FieldSpec, HeaderSnapshot};
use ersim_llm::ChatModel;
use ersim_sheets::{SheetLayout, TabularError, TabularStore};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Header row of the results sheet
pub const RESULT_HEADERS: [&str; 16] = [
    "Case_Organization_Case_ID",
    "Legacy_Case_ID",
    "Row_Index",
    "Case_Organization_Spark_Title",
    "Case_Organization_Reveal_Title",
    "Suggested_Symptom_Code",
    "Suggested_Symptom_Name",
    "Suggested_System_Code",
    "Suggested_System_Name",
    "AI_Reasoning",
    "Status",
    "User_Decision",
    "Final_Symptom_Code",
    "Final_System_Code",
    "Final_Symptom_Name",
    "Final_System_Name",
];

/// How a suggestion compares to the case's current symptom code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    /// Case had no code
    New,
    /// Suggestion agrees with the current code
    Match,
    /// Suggestion differs from the current code
    Conflict,
}

impl SuggestionStatus {
    /// Compare a current code with a suggested one
    #[must_use]
    pub fn compare(current: &str, suggested: &str) -> Self {
        match current.trim() {
            "" => Self::New,
            c if c == suggested.trim() => Self::Match,
            _ => Self::Conflict,
        }
    }

    /// Cell text
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Match => "match",
            Self::Conflict => "conflict",
        }
    }
}

/// One sink record as sent for categorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    /// Sink row
    pub row: usize,
    /// Primary key
    pub case_id: String,
    /// Secondary key
    pub legacy_id: String,
    /// Learner-facing title
    pub spark_title: String,
    /// Diagnosis title
    pub reveal_title: String,
    /// Current symptom code
    pub symptom_code: String,
    /// Current system code
    pub system_code: String,
}

/// One model suggestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Categorization {
    /// Case the suggestion is for, when the model echoes it
    #[serde(alias = "caseID")]
    pub case_id: String,
    /// Standard symptom acronym
    pub symptom_code: String,
    /// Standard symptom name
    pub symptom_name: String,
    /// Short system code
    pub system_code: String,
    /// Full system name
    pub system_name: String,
    /// Model's explanation
    pub reasoning: String,
}

/// Outcome of a categorization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizeReport {
    /// Cases found in the sink
    pub cases: usize,
    /// Model calls made
    pub batches: usize,
    /// Results rows appended
    pub written: usize,
    /// Cases already in the results sheet
    pub duplicates: usize,
    /// Cases without a usable suggestion
    pub errors: usize,
}

impl fmt::Display for CategorizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} case(s) in {} batch(es): written {}, duplicates {}, errors {}",
            self.cases, self.batches, self.written, self.duplicates, self.errors
        )
    }
}

/// Read `code -> name` pairs from the symptom mapping sheet
///
/// A missing sheet yields an empty mapping.
pub fn read_symptom_mapping(
    store: &dyn TabularStore,
    sheet: &str,
) -> Result<IndexMap<String, String>, TabularError> {
    let mut mapping = IndexMap::new();
    if !store.sheet_exists(sheet) {
        return Ok(mapping);
    }
    let layout = SheetLayout::SINGLE;
    for row in layout.first_data_row()..=store.last_row(sheet)? {
        let cells = store.read_row(sheet, row)?;
        let code = cells.first().map_or("", |c| c.trim());
        let name = cells.get(1).map_or("", |c| c.trim());
        if !code.is_empty() {
            mapping.insert(code.to_string(), name.to_string());
        }
    }
    Ok(mapping)
}

/// Extract the JSON array of suggestions from a raw response body
pub fn parse_categorizations(raw: &str) -> Result<Vec<Categorization>, GenerationError> {
    let content = ersim_llm::message_content(raw)?;
    let array = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            return Err(GenerationError::InvalidPayload(format!(
                "no JSON array in response: {}",
                ersim_llm::excerpt(&content)
            )))
        }
    };
    serde_json::from_str(array).map_err(|e| GenerationError::InvalidPayload(e.to_string()))
}

/// Runs categorization batches against the model
#[derive(Clone)]
pub struct Categorizer {
    store: Arc<dyn TabularStore>,
    model: Arc<dyn ChatModel>,
    call: CallSettings,
    settings: CategorizeSettings,
    sink: String,
    sink_layout: SheetLayout,
    results: String,
    primary: FieldSpec,
    secondary: FieldSpec,
    symptom_mapping: IndexMap<String, String>,
}

impl fmt::Debug for Categorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Categorizer")
            .field("sink", &self.sink)
            .field("results", &self.results)
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

impl Categorizer {
    /// Create a categorizer for the configured sheets
    #[must_use]
    pub fn from_config(
        store: Arc<dyn TabularStore>,
        model: Arc<dyn ChatModel>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            model,
            call: config.llm.categorization.clone(),
            settings: config.categorize.clone(),
            sink: config.sheets.sink.clone(),
            sink_layout: config.sheets.sink_layout(),
            results: config.sheets.results.clone(),
            primary: config.schema.primary_key.clone(),
            secondary: config.schema.secondary_key.clone(),
            symptom_mapping: IndexMap::new(),
        }
    }

    /// Standard symptom codes offered to the model
    #[must_use]
    pub fn with_symptom_mapping(mut self, mapping: IndexMap<String, String>) -> Self {
        self.symptom_mapping = mapping;
        self
    }

    /// Load the symptom mapping from its configured sheet
    pub fn load_symptom_mapping(self) -> Result<Self, CategorizeError> {
        let mapping = read_symptom_mapping(self.store.as_ref(), &self.settings.mapping_sheet)?;
        debug!("loaded {} symptom code(s)", mapping.len());
        Ok(self.with_symptom_mapping(mapping))
    }

    /// Read every keyed record from the sink
    pub fn extract_cases(
        &self,
        sink_header: &HeaderSnapshot,
    ) -> Result<Vec<CaseSummary>, CategorizeError> {
        let s = &self.settings;
        let specs = [
            self.primary.clone(),
            self.secondary.clone(),
            s.spark_title.clone(),
            s.reveal_title.clone(),
            s.symptom_code.clone(),
            s.system_code.clone(),
        ];
        let map = resolve(sink_header, &specs);
        let case_col = map.require(&self.primary.name)?;
        let col = |spec: &FieldSpec| map.get(&spec.name);
        let (legacy, spark, reveal, symptom, system) = (
            col(&self.secondary),
            col(&s.spark_title),
            col(&s.reveal_title),
            col(&s.symptom_code),
            col(&s.system_code),
        );

        let mut cases = Vec::new();
        let last = self.store.last_row(&self.sink)?;
        for row in self.sink_layout.first_data_row()..=last {
            let cells = self.store.read_row(&self.sink, row)?;
            let cell = |col: Option<usize>| {
                col.and_then(|c| cells.get(c))
                    .map_or_else(String::new, |v| v.trim().to_string())
            };
            let case_id = cell(Some(case_col));
            if case_id.is_empty() {
                continue;
            }
            cases.push(CaseSummary {
                row,
                case_id,
                legacy_id: cell(legacy),
                spark_title: cell(spark),
                reveal_title: cell(reveal),
                symptom_code: cell(symptom),
                system_code: cell(system),
            });
        }
        Ok(cases)
    }

    /// Categorization prompt for one batch
    #[must_use]
    pub fn build_prompt(&self, cases: &[CaseSummary]) -> String {
        let mut prompt = String::with_capacity(4096);
        prompt.push_str(
            "You are a medical education expert categorizing emergency medicine \
             simulation cases.\n\n",
        );
        if !self.symptom_mapping.is_empty() {
            prompt.push_str("Standard symptom codes and names (match exactly):\n");
            for (code, name) in &self.symptom_mapping {
                let _ = writeln!(prompt, "  {code} -> {name}");
            }
            prompt.push('\n');
        }
        prompt.push_str(
            "System codes are short codes you choose (CARD, RESP, GI, NEURO, ENDO, INF, \
             TRAUMA, PEDS, OB, TOX, ...) with a full system name.\n\
             Base each categorization on the diagnosis (reveal title), using the primary \
             presenting symptom and the primary affected body system.\n\n",
        );

        let listed: Vec<serde_json::Value> = cases
            .iter()
            .map(|c| {
                serde_json::json!({
                    "caseID": c.case_id,
                    "sparkTitle": c.spark_title,
                    "revealTitle": c.reveal_title,
                })
            })
            .collect();
        let _ = write!(
            prompt,
            "Cases:\n{}\n\n",
            serde_json::to_string_pretty(&listed).unwrap_or_default()
        );
        prompt.push_str(
            "Return ONLY a JSON array with one object per case, in order, each with \
             caseID, symptomCode, symptomName, systemCode, systemName and reasoning.",
        );
        prompt
    }

    /// Categorize every sink case not yet in the results sheet
    pub async fn run(
        &self,
        sink_header: &HeaderSnapshot,
    ) -> Result<CategorizeReport, CategorizeError> {
        self.ensure_results_sheet()?;
        let columns = self.results_columns()?;
        let id_col = columns
            .iter()
            .position(|h| h == RESULT_CASE_ID)
            .ok_or_else(|| SchemaError::Unresolved(RESULT_CASE_ID.to_string()))?;
        let mut seen: HashSet<String> = self
            .store
            .read_column(&self.results, id_col, SheetLayout::SINGLE.first_data_row())?
            .into_iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();

        let cases = self.extract_cases(sink_header)?;
        let mut report = CategorizeReport {
            cases: cases.len(),
            ..CategorizeReport::default()
        };
        let mut pending = Vec::new();
        for case in cases {
            if seen.insert(case.case_id.clone()) {
                pending.push(case);
            } else {
                report.duplicates += 1;
            }
        }
        info!(
            "categorizing {} case(s), {} already in '{}'",
            pending.len(),
            report.duplicates,
            self.results
        );

        let batch_size = self.settings.batch_size.max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        for (n, batch) in pending.chunks(batch_size).enumerate() {
            report.batches += 1;
            match self.categorize_batch(batch).await {
                Ok(suggestions) => {
                    for (i, case) in batch.iter().enumerate() {
                        match pick(&suggestions, i, &case.case_id) {
                            Some(cat) => {
                                self.write_result(case, cat, &columns)?;
                                report.written += 1;
                            }
                            None => {
                                warn!("no categorization returned for {}", case.case_id);
                                report.errors += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("categorization batch {} failed: {}", n + 1, e);
                    report.errors += batch.len();
                }
            }

            let delay = self.settings.batch_delay();
            if n + 1 < total_batches && !delay.is_zero() {
                sleep(delay).await;
            }
        }

        info!("categorization: {}", report);
        Ok(report)
    }

    async fn categorize_batch(
        &self,
        cases: &[CaseSummary],
    ) -> Result<Vec<Categorization>, GenerationError> {
        let request = self.call.request(self.build_prompt(cases));
        let raw = self.model.complete(&request).await?;
        let suggestions = parse_categorizations(&raw)?;
        debug!("{} suggestion(s) for {} case(s)", suggestions.len(), cases.len());
        Ok(suggestions)
    }

    fn ensure_results_sheet(&self) -> Result<(), CategorizeError> {
        if self.store.sheet_exists(&self.results) {
            return Ok(());
        }
        self.store.create_sheet(&self.results)?;
        let header: Vec<String> = RESULT_HEADERS.iter().map(|h| (*h).to_string()).collect();
        self.store.write_row(&self.results, 1, &header)?;
        info!("created results sheet '{}'", self.results);
        Ok(())
    }

    /// Column names of the results sheet, in sheet order
    fn results_columns(&self) -> Result<Vec<String>, CategorizeError> {
        let header = self
            .store
            .read_row(&self.results, SheetLayout::SINGLE.field_header_row())?;
        Ok(header.into_iter().map(|h| h.trim().to_string()).collect())
    }

    /// Append one results row laid out by the sheet's own header
    fn write_result(
        &self,
        case: &CaseSummary,
        cat: &Categorization,
        columns: &[String],
    ) -> Result<(), CategorizeError> {
        let symptom_name = if cat.symptom_name.is_empty() {
            self.symptom_mapping
                .get(&cat.symptom_code)
                .cloned()
                .unwrap_or_default()
        } else {
            cat.symptom_name.clone()
        };
        let status = SuggestionStatus::compare(&case.symptom_code, &cat.symptom_code);

        let values: [String; RESULT_HEADERS.len()] = [
            case.case_id.clone(),
            case.legacy_id.clone(),
            case.row.to_string(),
            case.spark_title.clone(),
            case.reveal_title.clone(),
            cat.symptom_code.clone(),
            symptom_name.clone(),
            cat.system_code.clone(),
            cat.system_name.clone(),
            cat.reasoning.clone(),
            status.as_str().to_string(),
            String::new(),
            cat.symptom_code.clone(),
            cat.system_code.clone(),
            symptom_name,
            cat.system_name.clone(),
        ];
        let row: Vec<String> = columns
            .iter()
            .map(|name| {
                RESULT_HEADERS
                    .iter()
                    .position(|h| *h == name.as_str())
                    .map(|i| values[i].clone())
                    .unwrap_or_default()
            })
            .collect();
        self.store.append_row(&self.results, &row)?;
        Ok(())
    }
}

/// Suggestion for the `index`-th case, preferring an echoed case id
fn pick<'a>(
    suggestions: &'a [Categorization],
    index: usize,
    case_id: &str,
) -> Option<&'a Categorization> {
    suggestions
        .iter()
        .find(|c| c.case_id == case_id)
        .or_else(|| suggestions.get(index).filter(|c| c.case_id.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ersim_llm::{LlmError, MockChatModel};
    use ersim_sheets::MemoryWorkbook;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn s(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    fn header() -> HeaderSnapshot {
        HeaderSnapshot {
            sheet: "Master Scenario Convert".into(),
            groups: Vec::new(),
            fields: s(&[
                "Case_Organization_Case_ID",
                "Case_Organization_Spark_Title",
                "Case_Organization_Reveal_Title",
                "Case_Organization_Category_Symptom_Code",
            ]),
            refreshed_at: Utc::now(),
        }
    }

    fn store() -> Arc<MemoryWorkbook> {
        let mut rows = vec![s(&["Case_Organization"; 4]), header().fields];
        rows.push(s(&["CARD001", "Crushing pain", "Inferior STEMI", "CP"]));
        rows.push(s(&["RESP002", "Can't breathe", "Asthma", ""]));
        rows.push(s(&["", "orphan", "", ""]));
        rows.push(s(&["GI003", "Belly pain", "Appendicitis", "NV"]));
        Arc::new(MemoryWorkbook::new().with_sheet("Master Scenario Convert", rows))
    }

    fn envelope(content: &str) -> String {
        json!({"choices": [{"message": {"content": content}}]}).to_string()
    }

    fn config(batch_size: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.categorize.batch_size = batch_size;
        config.categorize.batch_delay_ms = 0;
        config
    }

    #[test]
    fn status_comparison() {
        assert_eq!(SuggestionStatus::compare("", "CP"), SuggestionStatus::New);
        assert_eq!(SuggestionStatus::compare("CP", "CP"), SuggestionStatus::Match);
        assert_eq!(SuggestionStatus::compare("NV", "AP"), SuggestionStatus::Conflict);
    }

    #[test]
    fn parses_array_inside_prose() {
        let raw =
            envelope("Here you go:\n```json\n[{\"caseID\": \"A\", \"symptomCode\": \"CP\"}]\n```");
        let parsed = parse_categorizations(&raw).unwrap();
        assert_eq!(parsed[0].case_id, "A");
        assert_eq!(parsed[0].symptom_code, "CP");
        assert!(parse_categorizations(&envelope("sorry")).is_err());
    }

    #[test]
    fn extracts_keyed_cases() {
        let store = store();
        let categorizer =
            Categorizer::from_config(store, Arc::new(MockChatModel::new()), &config(25));
        let cases = categorizer.extract_cases(&header()).unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[2].row, 6);
        assert_eq!(cases[0].symptom_code, "CP");
        assert_eq!(cases[0].legacy_id, "");
    }

    #[tokio::test]
    async fn writes_results_and_skips_known_cases() {
        let store = store();
        let mut mock = MockChatModel::new();
        mock.expect_complete().times(1).returning(|_| {
            Ok(envelope(
                &json!([
                    {"caseID": "RESP002", "symptomCode": "SOB", "systemCode": "RESP",
                     "systemName": "Respiratory", "reasoning": "asthma"},
                    {"caseID": "GI003", "symptomCode": "AP", "symptomName": "Abdominal Pain",
                     "systemCode": "GI", "systemName": "Gastrointestinal"}
                ])
                .to_string(),
            ))
        });
        store
            .create_sheet("AI_Categorization_Results")
            .unwrap();
        let header_row = s(&RESULT_HEADERS);
        store.write_row("AI_Categorization_Results", 1, &header_row).unwrap();
        store
            .append_row("AI_Categorization_Results", &s(&["CARD001"]))
            .unwrap();

        let mapping: IndexMap<String, String> =
            [("SOB".to_string(), "Shortness of Breath".to_string())].into_iter().collect();
        let categorizer = Categorizer::from_config(store.clone(), Arc::new(mock), &config(25))
            .with_symptom_mapping(mapping);
        let report = categorizer.run(&header()).await.unwrap();

        assert_eq!(report.cases, 3);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.written, 2);
        let rows = store.sheet("AI_Categorization_Results").unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[2][6], "Shortness of Breath");
        assert_eq!(rows[2][10], "new");
        assert_eq!(rows[3][10], "conflict");
        assert_eq!(rows[3][14], "Abdominal Pain");
    }

    #[tokio::test]
    async fn results_columns_are_found_by_header() {
        let store = store();
        let mut mock = MockChatModel::new();
        mock.expect_complete().times(1).returning(|_| {
            Ok(envelope(
                &json!([
                    {"caseID": "RESP002", "symptomCode": "SOB", "systemCode": "RESP"},
                    {"caseID": "GI003", "symptomCode": "AP", "systemCode": "GI"}
                ])
                .to_string(),
            ))
        });
        store.create_sheet("AI_Categorization_Results").unwrap();
        store
            .write_row(
                "AI_Categorization_Results",
                1,
                &s(&["Status", "Case_Organization_Case_ID", "Final_Symptom_Code"]),
            )
            .unwrap();
        store
            .append_row("AI_Categorization_Results", &s(&["match", "CARD001", "CP"]))
            .unwrap();

        let categorizer = Categorizer::from_config(store.clone(), Arc::new(mock), &config(25));
        let report = categorizer.run(&header()).await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.written, 2);
        let rows = store.sheet("AI_Categorization_Results").unwrap();
        assert_eq!(rows[2], s(&["new", "RESP002", "SOB"]));
        assert_eq!(rows[3], s(&["conflict", "GI003", "AP"]));
    }

    #[tokio::test]
    async fn failed_batch_counts_errors_and_continues() {
        let store = store();
        let mut mock = MockChatModel::new();
        let mut calls = 0;
        mock.expect_complete().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(LlmError::Timeout(120))
            } else {
                Ok(envelope(r#"[{"symptomCode": "AP"}]"#))
            }
        });

        let categorizer = Categorizer::from_config(store.clone(), Arc::new(mock), &config(2));
        let report = categorizer.run(&header()).await.unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(report.errors, 2);
        assert_eq!(report.written, 1);

        let rows = store.sheet("AI_Categorization_Results").unwrap();
        assert_eq!(rows[0], s(&RESULT_HEADERS));
        assert_eq!(rows[1][0], "GI003");
        assert_eq!(rows[1][10], "conflict");
    }
}
