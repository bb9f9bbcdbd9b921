//! Record quality scoring
//!
//! Read-only checks over a generated record:
//! - required fields present
//! - vitals blocks parse to objects with the core keys
//! - waveform names follow the `_ecg` convention and the known catalogue
//! - blood pressure is a `systolic/diastolic` string
//!
//! Failures make a record invalid; warnings only lower its score.

use crate::config::ScoringSettings;
use crate::record::Record;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Score lost per failure
pub const FAILURE_PENALTY: f64 = 25.0;
/// Score lost per warning
pub const WARNING_PENALTY: f64 = 5.0;

/// Keys every vitals block must carry
pub const REQUIRED_VITAL_KEYS: [&str; 5] = ["HR", "BP", "SpO2", "RR", "waveform"];

/// Keys whose absence is worth a warning
pub const RECOMMENDED_VITAL_KEYS: [&str; 2] = ["EtCO2", "Temp"];

/// Waveforms the monitor can render
pub const KNOWN_WAVEFORMS: &[&str] = &[
    "sinus_ecg",
    "sinus_brady_ecg",
    "sinus_tachy_ecg",
    "afib_ecg",
    "aflutter_ecg",
    "mat_ecg",
    "svt_ecg",
    "pac_ecg",
    "junctional_ecg",
    "vtach_ecg",
    "vfib_ecg",
    "torsades_ecg",
    "bigeminy_ecg",
    "trigeminy_ecg",
    "idioventricular_ecg",
    "aivr_ecg",
    "avblock1_ecg",
    "avblock2_type1_ecg",
    "avblock2_type2_ecg",
    "avblock3_ecg",
    "lbbb_ecg",
    "rbbb_ecg",
    "wpw_ecg",
    "vpaced_ecg",
    "dual_paced_ecg",
    "hyperkalemia_ecg",
    "hypokalemia_ecg",
    "hypothermia_ecg",
    "stemi_ecg",
    "stemi_inferior_ecg",
    "nstemi_ecg",
    "lbbb_sgarbossa_ecg",
    "pericarditis_ecg",
    "pulmonary_embolism_ecg",
    "early_repolarization_ecg",
    "electrical_alternans_ecg",
    "asystole_ecg",
    "pea_ecg",
    "artifact_ecg",
];

static BP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+/\d+$").expect("blood pressure pattern is valid"));

fn is_systolic_diastolic(bp: &str) -> bool {
    BP_PATTERN.is_match(bp.trim())
}

/// Verdict for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// No failures
    pub valid: bool,
    /// Issues that lower the score
    pub warnings: Vec<String>,
    /// Issues that invalidate the record
    pub failures: Vec<String>,
    /// 0 to 100
    pub score: f64,
}

impl QualityReport {
    fn from_findings(failures: Vec<String>, warnings: Vec<String>) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let penalty =
            failures.len() as f64 * FAILURE_PENALTY + warnings.len() as f64 * WARNING_PENALTY;
        Self {
            valid: failures.is_empty(),
            warnings,
            failures,
            score: (100.0 - penalty).clamp(0.0, 100.0),
        }
    }

    /// First failure, for status cells
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        match self.failures.len() {
            0 => None,
            1 => Some(self.failures[0].clone()),
            n => Some(format!("{} (+{} more)", self.failures[0], n - 1)),
        }
    }
}

/// Applies [`ScoringSettings`] to records
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    rules: ScoringSettings,
}

impl QualityScorer {
    /// Create a scorer with the given rules
    #[inline]
    #[must_use]
    pub fn new(rules: ScoringSettings) -> Self {
        Self { rules }
    }

    /// Score a record without modifying it
    #[must_use]
    pub fn score(&self, record: &Record) -> QualityReport {
        let mut failures = Vec::new();
        let mut warnings = Vec::new();

        for field in &self.rules.required_fields {
            if !record.has_value(field) {
                failures.push(format!("missing required field {field}"));
            }
        }

        for field in &self.rules.required_vitals {
            match record.get(field).filter(|v| !is_empty(v)) {
                Some(value) => check_vitals(field, value, &mut failures, &mut warnings),
                None => failures.push(format!("missing required vitals {field}")),
            }
        }
        for field in &self.rules.optional_vitals {
            match record.get(field).filter(|v| !is_empty(v)) {
                Some(value) => check_vitals(field, value, &mut failures, &mut warnings),
                None => warnings.push(format!("{field} is empty")),
            }
        }

        QualityReport::from_findings(failures, warnings)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(text) => match serde_json::from_str(text) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn check_vitals(
    field: &str,
    value: &Value,
    failures: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let Some(vitals) = as_object(value) else {
        failures.push(format!("{field} is not a JSON object"));
        return;
    };

    for key in REQUIRED_VITAL_KEYS {
        if !vitals.contains_key(key) {
            failures.push(format!("{field} missing {key}"));
        }
    }
    for key in RECOMMENDED_VITAL_KEYS {
        if !vitals.contains_key(key) {
            warnings.push(format!("{field} has no {key}"));
        }
    }

    match vitals.get("waveform") {
        Some(Value::String(wave)) if !wave.ends_with("_ecg") => {
            failures.push(format!("{field} waveform '{wave}' must end with _ecg"));
        }
        Some(Value::String(wave)) if !KNOWN_WAVEFORMS.contains(&wave.as_str()) => {
            warnings.push(format!("{field} waveform '{wave}' is not a known rhythm"));
        }
        Some(Value::String(_)) | None => {}
        Some(_) => failures.push(format!("{field} waveform is not a string")),
    }

    match vitals.get("BP") {
        Some(Value::String(bp)) if !is_systolic_diastolic(bp) => {
            failures.push(format!("{field} BP '{bp}' is not systolic/diastolic"));
        }
        Some(Value::Object(_)) => {
            warnings.push(format!("{field} BP is an object, expected \"sys/dia\""));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vitals() -> Value {
        json!({
            "HR": 112, "BP": "92/58", "SpO2": 91, "RR": 24,
            "Temp": 38.4, "EtCO2": 30, "waveform": "sinus_tachy_ecg"
        })
    }

    fn record(initial: Value) -> Record {
        let mut payload = json!({
            "Case_Organization_Case_ID": "RESP003",
            "Case_Organization_Spark_Title": "Short of breath",
            "Monitor_Vital_Signs_Initial_Vitals": initial,
        });
        for n in 1..=5 {
            payload[format!("Monitor_Vital_Signs_State{n}_Vitals")] = vitals();
        }
        Record::from_payload(payload).unwrap()
    }

    #[test]
    fn complete_record_scores_full() {
        let report = QualityScorer::default().score(&record(vitals()));
        assert!(report.valid, "{report:?}");
        assert!(report.warnings.is_empty());
        assert!((report.score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn vitals_as_json_string_are_accepted() {
        let report = QualityScorer::default().score(&record(Value::String(vitals().to_string())));
        assert!(report.valid);
    }

    #[test]
    fn waveform_without_suffix_fails() {
        let mut v = vitals();
        v["waveform"] = json!("sinus");
        let report = QualityScorer::default().score(&record(v));
        assert!(!report.valid);
        assert!(report.failures[0].contains("_ecg"));
    }

    #[test]
    fn unknown_waveform_only_warns() {
        let mut v = vitals();
        v["waveform"] = json!("brugada_ecg");
        let report = QualityScorer::default().score(&record(v));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert!((report.score - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn blood_pressure_rules() {
        let mut v = vitals();
        v["BP"] = json!("ninety over sixty");
        assert!(!QualityScorer::default().score(&record(v)).valid);

        let mut v = vitals();
        v["BP"] = json!({"sys": 90, "dia": 60});
        let report = QualityScorer::default().score(&record(v));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn systolic_diastolic_pattern() {
        assert!(is_systolic_diastolic("120/80"));
        assert!(is_systolic_diastolic(" 92/58 "));
        assert!(!is_systolic_diastolic("120/"));
        assert!(!is_systolic_diastolic("120 / 80"));
        assert!(!is_systolic_diastolic("120/80/60"));
    }

    #[test]
    fn missing_optional_pieces_warn() {
        let mut v = vitals();
        v.as_object_mut().unwrap().remove("EtCO2");
        let mut rec = record(v);
        rec.insert("Monitor_Vital_Signs_State5_Vitals", Value::Null);
        let report = QualityScorer::default().score(&rec);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn missing_required_pieces_fail_and_floor_at_zero() {
        let rec = Record::from_payload(json!({"Other": "x"})).unwrap();
        let report = QualityScorer::default().score(&rec);
        assert!(!report.valid);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.warnings.len(), 5);
        assert!(report.score.abs() < f64::EPSILON);
        assert!(report.summary().unwrap().contains("+2 more"));
    }
}
