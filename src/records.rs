//! Persisted stage records and the keyed output sink
//!
//! Every stage reads and writes plain JSON arrays in the data directory.
//! Writes go through a temporary file and a rename so a crash never leaves
//! a half-written array behind.

use crate::error::{PipelineError, Result};
use crate::types::{
    ConsensusJudgment, Dialog, DialogId, GroundTruth, Intent, MistakeSet, QualityScore, RawJudgment,
    Satisfaction, Scenario, Turn,
};
use crate::verify::{VerificationStatus, VerifiedJudgment};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Records addressed by dialog id
pub trait Keyed {
    fn key(&self) -> &DialogId;
}

/// One entry of `dataset.json`.
///
/// Older datasets name the transcript `messages` and keep the scenario
/// under `metadata.scenario_type`; both are accepted on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "StoredDatasetRecord")]
pub struct DatasetRecord {
    pub id: DialogId,
    pub dialog: Vec<Turn>,
    pub ground_truth: GroundTruth,
}

#[derive(Deserialize)]
struct StoredDatasetRecord {
    id: DialogId,
    #[serde(alias = "messages")]
    dialog: Vec<Turn>,
    ground_truth: StoredGroundTruth,
    #[serde(default)]
    metadata: Option<LegacyMetadata>,
}

#[derive(Deserialize)]
struct StoredGroundTruth {
    intent: Intent,
    satisfaction: Satisfaction,
    quality_score: QualityScore,
    #[serde(default)]
    scenario: Option<Scenario>,
    #[serde(default)]
    agent_mistakes: MistakeSet,
}

#[derive(Deserialize)]
struct LegacyMetadata {
    scenario_type: Scenario,
}

impl TryFrom<StoredDatasetRecord> for DatasetRecord {
    type Error = String;

    fn try_from(stored: StoredDatasetRecord) -> std::result::Result<Self, Self::Error> {
        let truth = stored.ground_truth;
        let scenario = truth
            .scenario
            .or_else(|| stored.metadata.map(|m| m.scenario_type))
            .ok_or_else(|| format!("dialog {} has no scenario in its ground truth", stored.id))?;
        Ok(Self {
            id: stored.id,
            dialog: stored.dialog,
            ground_truth: GroundTruth {
                intent: truth.intent,
                satisfaction: truth.satisfaction,
                quality_score: truth.quality_score,
                scenario,
                agent_mistakes: truth.agent_mistakes,
            },
        })
    }
}

impl DatasetRecord {
    pub fn to_dialog(&self) -> Dialog {
        Dialog {
            id: self.id.clone(),
            turns: self.dialog.clone(),
        }
    }
}

/// One entry of `analysis.json`.
///
/// A dialog whose rounds could not all be completed has no consensus and
/// carries the reason in `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AnalysisRecord {
    pub id: DialogId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusJudgment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_rounds: Vec<RawJudgment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisRecord {
    pub fn analyzed(id: DialogId, consensus: ConsensusJudgment, raw_rounds: Vec<RawJudgment>) -> Self {
        Self {
            id,
            consensus: Some(consensus),
            raw_rounds,
            error: None,
        }
    }

    pub fn unanalyzed(id: DialogId, reason: impl Into<String>) -> Self {
        Self {
            id,
            consensus: None,
            raw_rounds: Vec::new(),
            error: Some(reason.into()),
        }
    }
}

/// One entry of `analysis_verified.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifiedRecord {
    pub id: DialogId,
    #[serde(flatten)]
    pub judgment: VerifiedJudgment,
}

impl Keyed for DatasetRecord {
    fn key(&self) -> &DialogId {
        &self.id
    }
}

impl Keyed for AnalysisRecord {
    fn key(&self) -> &DialogId {
        &self.id
    }
}

impl Keyed for VerifiedRecord {
    fn key(&self) -> &DialogId {
        &self.id
    }
}

/// Either prediction file format, as read by the evaluator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PredictionRecord {
    Verified(VerifiedRecord),
    Analysis(AnalysisRecord),
}

impl PredictionRecord {
    pub fn id(&self) -> &DialogId {
        match self {
            PredictionRecord::Verified(r) => &r.id,
            PredictionRecord::Analysis(r) => &r.id,
        }
    }

    /// The judgment to score, if the dialog was analyzed
    pub fn prediction(&self) -> Option<&ConsensusJudgment> {
        match self {
            PredictionRecord::Verified(r) => Some(&r.judgment.verified),
            PredictionRecord::Analysis(r) => r.consensus.as_ref(),
        }
    }

    /// Whether the record carries a judgment or the reason it has none
    pub fn has_outcome(&self) -> bool {
        match self {
            PredictionRecord::Verified(_) => true,
            PredictionRecord::Analysis(r) => r.consensus.is_some() || r.error.is_some(),
        }
    }

    /// `None` for consensus-only records
    pub fn verification_status(&self) -> Option<VerificationStatus> {
        match self {
            PredictionRecord::Verified(r) => Some(r.judgment.verification_status),
            PredictionRecord::Analysis(_) => None,
        }
    }
}

/// Read a JSON file; a missing file is `MissingInput`
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::MissingInput(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_str(&content)?)
}

/// Write pretty JSON atomically (temp file + rename)
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Output file keyed by dialog id.
///
/// Each key may be written once; every accepted record is persisted
/// immediately so partial results survive an aborted run.
pub struct RecordSink<T> {
    path: PathBuf,
    records: Mutex<BTreeMap<DialogId, T>>,
}

impl<T> RecordSink<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Keyed + Serialize> RecordSink<T> {
    /// Add a record and rewrite the output file
    pub fn insert(&self, record: T) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let key = record.key().clone();
        if records.contains_key(&key) {
            return Err(PipelineError::DuplicateRecord(key));
        }
        records.insert(key, record);

        let ordered: Vec<&T> = records.values().collect();
        save_json(&self.path, &ordered)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MistakeType, Speaker};
    use crate::verify::{CheckResult, ChecklistItem, Correction, Field, FieldChange, FieldValue};

    fn consensus() -> ConsensusJudgment {
        ConsensusJudgment {
            intent: Intent::Refund,
            satisfaction: Satisfaction::Neutral,
            quality_score: QualityScore::new(3).unwrap(),
            agent_mistakes: [MistakeType::NoResolution].into_iter().collect(),
        }
    }

    fn verified_record() -> VerifiedRecord {
        let mut verified = consensus();
        verified.satisfaction = Satisfaction::Unsatisfied;
        VerifiedRecord {
            id: DialogId::Number(4),
            judgment: VerifiedJudgment {
                verified,
                checklist_results: vec![CheckResult {
                    item: ChecklistItem::HiddenDissatisfaction,
                    passed: false,
                    correction: Some(Correction::Satisfaction { satisfaction: Satisfaction::Unsatisfied }),
                }],
                changes: vec![FieldChange {
                    item: ChecklistItem::HiddenDissatisfaction,
                    field: Field::Satisfaction,
                    before: FieldValue::Satisfaction(Satisfaction::Neutral),
                    after: FieldValue::Satisfaction(Satisfaction::Unsatisfied),
                }],
                verification_status: VerificationStatus::Verified,
                error: None,
            },
        }
    }

    #[test]
    fn test_dataset_accepts_legacy_field_names() {
        let json = r#"[{
            "id": 1,
            "messages": [{"role": "customer", "text": "Hi"}, {"role": "agent", "text": "Hello"}],
            "ground_truth": {"intent": "refund", "satisfaction": "neutral", "quality_score": 3,
                             "scenario": "problematic", "agent_mistakes": []}
        }]"#;
        let records: Vec<DatasetRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].dialog[1].speaker, Speaker::Agent);
        assert_eq!(records[0].ground_truth.scenario, Scenario::Problematic);
    }

    #[test]
    fn test_dataset_accepts_legacy_metadata_scenario() {
        let json = r#"[{
            "id": 7,
            "messages": [{"role": "customer", "text": "Where is my refund?"}],
            "metadata": {"scenario_type": "hidden_dissatisfaction", "has_hidden_dissatisfaction": true},
            "ground_truth": {"intent": "refund", "satisfaction": "unsatisfied", "quality_score": 2,
                             "agent_mistakes": ["no_resolution"]}
        }]"#;
        let records: Vec<DatasetRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].ground_truth.scenario, Scenario::HiddenDissatisfaction);
        assert_eq!(records[0].dialog.len(), 1);

        let missing = r#"{"id": 8, "dialog": [], "ground_truth": {"intent": "refund",
            "satisfaction": "neutral", "quality_score": 3}}"#;
        let err = serde_json::from_str::<DatasetRecord>(missing).unwrap_err();
        assert!(err.to_string().contains("no scenario"));
    }

    #[test]
    fn test_verified_record_round_trip() {
        let record = verified_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["verification_status"], "verified");
        assert_eq!(json["verified"]["satisfaction"], "unsatisfied");

        let parsed: VerifiedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_prediction_record_detects_format() {
        let verified: PredictionRecord =
            serde_json::from_value(serde_json::to_value(verified_record()).unwrap()).unwrap();
        assert_eq!(verified.verification_status(), Some(VerificationStatus::Verified));
        assert_eq!(verified.prediction().unwrap().satisfaction, Satisfaction::Unsatisfied);

        let analysis = AnalysisRecord::analyzed(DialogId::Number(2), consensus(), Vec::new());
        let parsed: PredictionRecord =
            serde_json::from_value(serde_json::to_value(&analysis).unwrap()).unwrap();
        assert!(matches!(parsed, PredictionRecord::Analysis(_)));
        assert_eq!(parsed.verification_status(), None);

        let failed: PredictionRecord =
            serde_json::from_str(r#"{"id": "chat-9", "error": "incomplete samples"}"#).unwrap();
        assert!(failed.prediction().is_none());
        assert!(failed.has_outcome());

        let bare: PredictionRecord = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert!(!bare.has_outcome());
    }

    #[test]
    fn test_prediction_record_rejects_other_files() {
        let dataset = r#"{"id": 1, "dialog": [], "ground_truth": {"intent": "refund",
            "satisfaction": "neutral", "quality_score": 3, "scenario": "successful", "agent_mistakes": []}}"#;
        assert!(serde_json::from_str::<PredictionRecord>(dataset).is_err());

        let legacy = r#"{"id": 1, "analysis": {"intent": "refund", "satisfaction": "neutral"}}"#;
        assert!(serde_json::from_str::<PredictionRecord>(legacy).is_err());
    }

    #[test]
    fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<Vec<DatasetRecord>> = load_json(&dir.path().join("dataset.json"));
        assert!(matches!(result, Err(PipelineError::MissingInput(_))));
    }

    #[test]
    fn test_sink_persists_each_insert_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("analysis.json");
        let sink = RecordSink::new(&path);

        sink.insert(AnalysisRecord::analyzed(DialogId::Number(2), consensus(), Vec::new()))
            .unwrap();
        sink.insert(AnalysisRecord::unanalyzed(DialogId::Number(1), "timeout"))
            .unwrap();

        let on_disk: Vec<AnalysisRecord> = load_json(&path).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk[0].id, DialogId::Number(1));

        let duplicate = sink.insert(AnalysisRecord::unanalyzed(DialogId::Number(2), "again"));
        assert!(matches!(duplicate, Err(PipelineError::DuplicateRecord(_))));

        assert_eq!(sink.len(), 2);
        let on_disk: Vec<AnalysisRecord> = load_json(&path).unwrap();
        assert!(on_disk[1].consensus.is_some());
    }
}
