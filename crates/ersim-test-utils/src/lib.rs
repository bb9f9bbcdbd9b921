//! Testing utilities for ERSIM workspace
//!
//! Sheet fixtures in the default layout, envelope builders and a scripted
//! chat model that records every request.

#![allow(missing_docs)]

use async_trait::async_trait;
use ersim_llm::{ChatModel, CompletionRequest, LlmError};
use ersim_sheets::{Grid, MemoryWorkbook};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const SOURCE: &str = "Input";
pub const SINK: &str = "Master Scenario Convert";
pub const RESULTS: &str = "AI_Categorization_Results";

pub const SOURCE_FIELDS: [&str; 4] = ["Formal_Info", "HTML", "DOC", "Extra"];

pub const SINK_FIELDS: [&str; 14] = [
    "Case_Organization_Case_ID",
    "Case_Organization_Spark_Title",
    "Case_Organization_Reveal_Title",
    "Case_Organization_Legacy_Case_ID",
    "Monitor_Vital_Signs_Initial_Vitals",
    "Monitor_Vital_Signs_State1_Vitals",
    "Monitor_Vital_Signs_State2_Vitals",
    "Monitor_Vital_Signs_State3_Vitals",
    "Monitor_Vital_Signs_State4_Vitals",
    "Monitor_Vital_Signs_State5_Vitals",
    "Case_Organization_Category_Symptom_Code",
    "Case_Organization_Category_System_Code",
    "Case_Organization_Category_Symptom",
    "Case_Organization_Category_System",
];

pub const STATUS_HEADER: &str = "Developer_and_QA_Metadata_Conversion_Status";

pub fn strings(cells: &[&str]) -> Vec<String> {
    cells.iter().map(|c| (*c).to_string()).collect()
}

/// Two-tier source header
pub fn source_header() -> Grid {
    vec![strings(&["Input", "", "", ""]), strings(&SOURCE_FIELDS)]
}

/// Two-tier sink header without a status column
pub fn sink_header() -> Grid {
    let groups = SINK_FIELDS
        .iter()
        .map(|f| {
            if f.starts_with("Monitor_Vital_Signs") {
                "Monitor_Vital_Signs".to_string()
            } else {
                "Case_Organization".to_string()
            }
        })
        .collect();
    vec![groups, strings(&SINK_FIELDS)]
}

/// Source data row with only `Formal_Info` set
pub fn case_row(text: &str) -> Vec<String> {
    strings(&[text, "", "", ""])
}

/// Source sheet holding `cases` (empty strings become blank rows)
pub fn source_sheet(cases: &[&str]) -> Grid {
    let mut grid = source_header();
    grid.extend(cases.iter().map(|c| case_row(c)));
    grid
}

/// Workbook with a source of `cases` and an empty sink
pub fn workbook(cases: &[&str]) -> MemoryWorkbook {
    MemoryWorkbook::new()
        .with_sheet(SOURCE, source_sheet(cases))
        .with_sheet(SINK, sink_header())
}

/// Numbered, distinct case texts
pub fn cases(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("case {i}: chest pain")).collect()
}

pub fn vitals() -> Value {
    json!({
        "HR": 110, "BP": "100/60", "SpO2": 94, "RR": 22,
        "Temp": 37.8, "EtCO2": 35, "waveform": "sinus_tachy_ecg"
    })
}

/// A record that passes the default quality rules
pub fn valid_record(case_id: &str) -> Value {
    let mut record = json!({
        "Case_Organization_Case_ID": case_id,
        "Case_Organization_Spark_Title": format!("{case_id} spark"),
        "Case_Organization_Reveal_Title": format!("{case_id} reveal"),
        "Monitor_Vital_Signs_Initial_Vitals": vitals(),
    });
    for n in 1..=5 {
        record[format!("Monitor_Vital_Signs_State{n}_Vitals")] = vitals();
    }
    record
}

/// Successful chat-completion body carrying `content`
pub fn envelope(content: &str) -> String {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
}

/// Successful body carrying a serialized payload
pub fn payload_envelope(payload: &Value) -> String {
    envelope(&payload.to_string())
}

/// API error body
pub fn error_envelope(message: &str) -> String {
    json!({"error": {"message": message, "type": "server_error"}}).to_string()
}

/// Case text of the `Formal Info` section in a conversion prompt
pub fn case_text(prompt: &str) -> Option<&str> {
    let (_, rest) = prompt.split_once("### Formal Info\n")?;
    rest.lines().next()
}

type Responder = dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync;

/// Chat model answering from a closure, recording every request
pub struct ScriptedModel {
    responder: Box<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Same body for every call
    pub fn always(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self::new(move |_| Ok(raw.clone()))
    }

    /// Responses in order; a transport error once exhausted
    pub fn sequence(responses: Vec<Result<String, LlmError>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::new(move |_| {
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Transport("script exhausted".into())))
        })
    }

    /// Valid record whose case id is the prompt's case text
    pub fn converting() -> Self {
        Self::new(|req| {
            let id = case_text(&req.prompt).unwrap_or("unknown");
            Ok(payload_envelope(&valid_record(id)))
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        (self.responder)(request)
    }
}
