use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One usable data row of the input table, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub student_name: String,
    pub letter_grades: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdviceBucket {
    Excellent,
    GoodCanImprove,
    Borderline,
    NeedsSupport,
}

impl AdviceBucket {
    pub const ALL: [AdviceBucket; 4] = [
        AdviceBucket::Excellent,
        AdviceBucket::GoodCanImprove,
        AdviceBucket::Borderline,
        AdviceBucket::NeedsSupport,
    ];

    pub fn message(self) -> &'static str {
        match self {
            AdviceBucket::Excellent => {
                "¡Excelente trabajo! Sigue esforzándote y mantén tu ritmo. 🚀"
            }
            AdviceBucket::GoodCanImprove => {
                "Vas bien, pero puedes mejorar con un poco más de práctica y constancia. 📘"
            }
            AdviceBucket::Borderline => {
                "Estás en el límite, revisa tus apuntes y organiza un horario de estudio. ⏳"
            }
            AdviceBucket::NeedsSupport => {
                "Debes enfocarte más: pide apoyo a tu profesor, estudia en grupo y practica más. 💡"
            }
        }
    }

    pub fn from_message(message: &str) -> Option<AdviceBucket> {
        Self::ALL
            .into_iter()
            .find(|bucket| bucket.message() == message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub student_name: String,
    pub letter_grades: Vec<String>,
    /// Unrounded mean of the grade points.
    pub average: f64,
    pub advice: AdviceBucket,
}

impl GradeRecord {
    pub fn grades_text(&self) -> String {
        self.letter_grades.join(", ")
    }

    pub fn rounded_average(&self) -> f64 {
        round2(self.average)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLabel {
    #[serde(rename = "No en riesgo")]
    NotAtRisk,
    #[serde(rename = "En riesgo")]
    AtRisk,
}

impl RiskLabel {
    pub fn from_class(class: u8) -> RiskLabel {
        if class == 0 {
            RiskLabel::NotAtRisk
        } else {
            RiskLabel::AtRisk
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            RiskLabel::NotAtRisk => "No en riesgo",
            RiskLabel::AtRisk => "En riesgo",
        }
    }

    pub fn from_text(text: &str) -> Option<RiskLabel> {
        match text {
            "No en riesgo" => Some(RiskLabel::NotAtRisk),
            "En riesgo" => Some(RiskLabel::AtRisk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrigin {
    Real { student: usize },
    Synthetic { student: usize, pass: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSample {
    pub average: f64,
    pub risk_label: u8,
    pub origin: SampleOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub student_name: String,
    pub grades: String,
    pub average: f64,
    pub advice: String,
    pub predicted_risk: RiskLabel,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    /// Held-out accuracy in `[0, 1]`; absent when no model was trained.
    pub accuracy: Option<f64>,
    pub html: String,
    pub spreadsheet: Vec<u8>,
}

impl Report {
    pub fn accuracy_percent(&self) -> Option<f64> {
        self.accuracy.map(|acc| round2(acc * 100.0))
    }
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub id: Uuid,
    pub session: String,
    pub file_name: String,
    pub accuracy: Option<f64>,
    pub row_count: i32,
    pub spreadsheet: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
