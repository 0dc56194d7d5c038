//! Compatibility matching — pure, deterministic scoring of a candidate
//! against a target profile.
//!
//! No suspension points anywhere in this module: scoring is a plain function
//! of (target, candidate, weights, now). The generation-backed explanation
//! layer lives in `agents::compatibility`, not here.

pub mod scoring;
pub mod tenure;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use scoring::score_compatibility;

// ────────────────────────────────────────────────────────────────────────────
// Profiles
// ────────────────────────────────────────────────────────────────────────────

/// The role being hired for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetProfile {
    pub title: String,
    /// Seniority hint ("senior", "lead", ...). Also inferred from the title
    /// when absent.
    pub level: Option<String>,
    pub required_skills: Vec<String>,
    pub preferred_skills: Vec<String>,
    /// Free-form location ("Berlin, Germany"). `None` means unspecified.
    pub location: Option<String>,
    pub remote: bool,
    pub salary_range: Option<SalaryRange>,
    /// Degree-level keyword ("bachelor", "master", ...).
    pub degree_requirement: Option<String>,
    pub field_of_study: Option<String>,
}

/// One candidate as presented to the scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateProfile {
    pub candidate_id: Uuid,
    pub skills: Vec<String>,
    pub positions: Vec<Position>,
    pub education: Vec<Degree>,
    pub location: Option<String>,
    pub expected_salary: Option<SalaryRange>,
}

/// Employment period with raw date strings; `end == None` means current.
/// Accepted formats: `2020-01`, `2020-01-15`, `01/2020`, `January 2020`,
/// bare `2020`, and "Present"/"current" as an open end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub title: String,
    pub start: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Degree {
    /// Degree level text ("BSc", "Master of Science", ...).
    pub level: String,
    pub field: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: f64,
    pub max: f64,
}

impl SalaryRange {
    /// Tolerates inverted input; scoring always sees min <= max.
    pub fn normalized(self) -> SalaryRange {
        SalaryRange {
            min: self.min.min(self.max),
            max: self.min.max(self.max),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Weights
// ────────────────────────────────────────────────────────────────────────────

/// Dimension weights. Caller-overridable and not required to sum to 1:
/// the scorer rescales by the sum, so the 0-100 ceiling never shifts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub skills: f64,
    pub experience: f64,
    pub education: f64,
    pub location: f64,
    pub salary: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            skills: 0.35,
            experience: 0.30,
            education: 0.15,
            location: 0.10,
            salary: 0.10,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Report
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub skills: f64,
    pub experience: f64,
    pub education: f64,
    pub location: f64,
    pub salary: f64,
}

/// Full scoring result. Carries enough detail to derive a readable reasons
/// list without another generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub overall: f64,
    pub sub_scores: SubScores,
    pub matched_skills: Vec<String>,
    pub missing_skills: Vec<String>,
    pub actual_years: f64,
    pub required_years: f64,
    pub salary_in_range: bool,
    pub location_compatible: bool,
}

impl CompatibilityReport {
    /// Deterministic fallback explanation derived from sub-scores, used when
    /// the generated explanation is unavailable.
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();

        if self.missing_skills.is_empty() && !self.matched_skills.is_empty() {
            reasons.push(format!(
                "Covers all required skills ({})",
                self.matched_skills.join(", ")
            ));
        } else if !self.missing_skills.is_empty() {
            reasons.push(format!("Missing skills: {}", self.missing_skills.join(", ")));
        }

        if self.required_years > 0.0 {
            if self.actual_years >= self.required_years {
                reasons.push(format!(
                    "{:.1} years of experience against {:.0} required",
                    self.actual_years, self.required_years
                ));
            } else {
                reasons.push(format!(
                    "Only {:.1} of {:.0} required years of experience",
                    self.actual_years, self.required_years
                ));
            }
        }

        if self.sub_scores.education >= 80.0 {
            reasons.push("Education meets the stated requirement".to_string());
        } else if self.sub_scores.education < 60.0 {
            reasons.push("Education below the stated requirement".to_string());
        }

        if !self.location_compatible {
            reasons.push("Location likely incompatible".to_string());
        }

        if self.salary_in_range {
            reasons.push("Salary expectation compatible with the offered range".to_string());
        } else if self.sub_scores.salary <= 60.0 {
            reasons.push("Salary expectation above the offered range".to_string());
        }

        reasons
    }
}
