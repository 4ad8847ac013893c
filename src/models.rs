use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Stored text that names none of an enum's variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} `{value}`")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    SyncCatalog,
    ImportCsv,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncCatalog => "SYNC_CATALOG",
            JobKind::ImportCsv => "IMPORT_CSV",
        }
    }
}

impl FromStr for JobKind {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "SYNC_CATALOG" | "SYNC_DB" => Ok(JobKind::SyncCatalog),
            "IMPORT_CSV" | "CSV_IMPORT" => Ok(JobKind::ImportCsv),
            _ => Err(UnknownVariant::new("job kind", input)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Pending → Processing → {Completed | Failed}. A pending job may also be
    /// failed directly when it is cancelled before a worker picks it up.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Statuses a job must currently hold to move into `self`.
    pub fn predecessors(self) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(self))
            .collect()
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            _ => Err(UnknownVariant::new("job status", input)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress_current: i64,
    pub progress_total: i64,
    pub result_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: JobStatus::Pending,
            progress_current: 0,
            progress_total: 0,
            result_summary: None,
            created_at: Utc::now(),
        }
    }

    pub fn report(&self) -> JobReport {
        JobReport::from_job(self)
    }
}

/// Result payload of a completed CSV import.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub success: u64,
    pub review: u64,
}

impl ImportSummary {
    pub fn total(&self) -> u64 {
        self.success + self.review
    }
}

/// What a status poller sees. Import jobs store a JSON count object while
/// catalog syncs store a sentence, so the summary is parsed per kind and never
/// trusted to be well formed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobReport {
    Pending,
    Processing { current: i64, total: i64 },
    Imported { success: u64, review: u64 },
    Synced { message: String },
    Unparsed { summary: String },
    Failed { error: String },
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        let summary = job.result_summary.clone().unwrap_or_default();
        match job.status {
            JobStatus::Pending => JobReport::Pending,
            JobStatus::Processing => JobReport::Processing {
                current: job.progress_current,
                total: job.progress_total,
            },
            JobStatus::Failed => JobReport::Failed { error: summary },
            JobStatus::Completed => match job.kind {
                JobKind::ImportCsv => match serde_json::from_str::<ImportSummary>(&summary) {
                    Ok(counts) => JobReport::Imported {
                        success: counts.success,
                        review: counts.review,
                    },
                    Err(_) => JobReport::Unparsed { summary },
                },
                JobKind::SyncCatalog => JobReport::Synced { message: summary },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewIssue {
    NotFound,
    Ambiguous,
    WriteError,
}

impl ReviewIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewIssue::NotFound => "NOT_FOUND",
            ReviewIssue::Ambiguous => "AMBIGUOUS",
            ReviewIssue::WriteError => "WRITE_ERROR",
        }
    }
}

impl FromStr for ReviewIssue {
    type Err = UnknownVariant;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "NOT_FOUND" => Ok(ReviewIssue::NotFound),
            "AMBIGUOUS" => Ok(ReviewIssue::Ambiguous),
            "WRITE_ERROR" | "DB_ERROR" => Ok(ReviewIssue::WriteError),
            _ => Err(UnknownVariant::new("review issue", input)),
        }
    }
}

impl fmt::Display for ReviewIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized values inferred from an import row, offered to the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposedValues {
    pub quantity: i64,
    pub condition: String,
    pub is_foil: bool,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReviewItem {
    pub job_id: String,
    pub issue: ReviewIssue,
    pub raw_data: BTreeMap<String, String>,
    pub proposed: ProposedValues,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewItem {
    pub id: i64,
    pub job_id: String,
    pub issue: ReviewIssue,
    pub raw_data: BTreeMap<String, String>,
    pub proposed: ProposedValues,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryItem {
    pub scryfall_id: String,
    pub quantity: i64,
    pub condition: String,
    pub is_foil: bool,
    pub language: String,
    pub location: String,
}

/// Stored inventory row joined with its catalog card, when the card is known.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InventoryRecord {
    pub id: i64,
    #[serde(flatten)]
    pub item: InventoryItem,
    pub card_name: Option<String>,
    pub set_code: Option<String>,
    pub collector_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogCard {
    pub scryfall_id: String,
    pub name: String,
    pub set_code: String,
    pub collector_number: String,
    pub image_uri: String,
}

impl CatalogCard {
    pub fn label(&self) -> String {
        format!(
            "{} ({} #{})",
            self.name, self.set_code, self.collector_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(kind: JobKind, status: JobStatus, summary: Option<&str>) -> Job {
        Job {
            status,
            result_summary: summary.map(str::to_string),
            progress_current: 7,
            progress_total: 0,
            ..Job::new(kind)
        }
    }

    #[test]
    fn status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Pending.predecessors().is_empty());
        assert_eq!(Processing.predecessors(), vec![Pending]);
        assert_eq!(Completed.predecessors(), vec![Processing]);
        assert_eq!(Failed.predecessors(), vec![Pending, Processing]);
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Pending.is_terminal() && !Processing.is_terminal());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert_eq!("csv_import".parse::<JobKind>(), Ok(JobKind::ImportCsv));
        assert_eq!(" sync_db ".parse::<JobKind>(), Ok(JobKind::SyncCatalog));
        assert_eq!("db_error".parse::<ReviewIssue>(), Ok(ReviewIssue::WriteError));
        let err = "running".parse::<JobStatus>().expect_err("not a status");
        assert_eq!(err.to_string(), "unknown job status `running`");
    }

    #[test]
    fn report_parses_import_counts() {
        let done = job(
            JobKind::ImportCsv,
            JobStatus::Completed,
            Some(r#"{"success": 3, "review": 2}"#),
        );
        assert_eq!(
            done.report(),
            JobReport::Imported {
                success: 3,
                review: 2
            }
        );
    }

    #[test]
    fn report_tolerates_malformed_import_summary() {
        let done = job(JobKind::ImportCsv, JobStatus::Completed, Some("3 rows ok"));
        assert_eq!(
            done.report(),
            JobReport::Unparsed {
                summary: "3 rows ok".into()
            }
        );
    }

    #[test]
    fn report_keeps_sync_sentence_and_failure_text() {
        let synced = job(
            JobKind::SyncCatalog,
            JobStatus::Completed,
            Some("Successfully synced 10 cards"),
        );
        assert_eq!(
            synced.report(),
            JobReport::Synced {
                message: "Successfully synced 10 cards".into()
            }
        );
        let failed = job(JobKind::ImportCsv, JobStatus::Failed, Some("boom"));
        assert_eq!(
            failed.report(),
            JobReport::Failed {
                error: "boom".into()
            }
        );
        let running = job(JobKind::ImportCsv, JobStatus::Processing, None);
        assert_eq!(
            running.report(),
            JobReport::Processing {
                current: 7,
                total: 0
            }
        );
    }

    #[test]
    fn report_serializes_with_state_tag() {
        let value = serde_json::to_value(JobReport::Imported {
            success: 1,
            review: 1,
        })
        .expect("serialize");
        assert_eq!(value["state"], "imported");
        assert_eq!(value["success"], 1);
    }
}
