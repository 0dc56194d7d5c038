//! The five-dimension compatibility scorer.
//!
//! Every function here is pure: identical (target, candidate, weights, now)
//! always produces identical scores, independent of call order.

use chrono::{DateTime, Utc};

use crate::errors::EngineError;

use super::tenure::{required_years_for, title_similarity_bonus, total_tenure_years};
use super::{
    CandidateProfile, CompatibilityReport, SalaryRange, ScoreWeights, SubScores, TargetProfile,
};

// ────────────────────────────────────────────────────────────────────────────
// Skill matching
// ────────────────────────────────────────────────────────────────────────────

/// Interchangeable skill spellings. Matching is symmetric: either side of a
/// group matches any other member.
static ALIAS_GROUPS: &[&[&str]] = &[
    &["javascript", "js", "ecmascript"],
    &["typescript", "ts"],
    &["kubernetes", "k8s"],
    &["python", "py"],
    &["go", "golang"],
    &["postgresql", "postgres"],
    &["terraform", "tf"],
    &["machine learning", "ml"],
    &["amazon web services", "aws"],
    &["google cloud platform", "google cloud", "gcp"],
    &["node.js", "nodejs", "node"],
    &["react", "reactjs", "react.js"],
    &["c#", "csharp"],
    &["ci/cd", "cicd", "continuous integration"],
];

fn alias_group(skill: &str) -> Option<usize> {
    ALIAS_GROUPS
        .iter()
        .position(|group| group.contains(&skill))
}

/// Case-insensitive, alias-aware, containment-tolerant skill equality.
/// Containment requires at least three characters so that short tokens
/// ("go", "r") cannot match by accident; their aliases cover the short forms.
pub fn skills_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    if let (Some(ga), Some(gb)) = (alias_group(&a), alias_group(&b)) {
        if ga == gb {
            return true;
        }
    }
    (a.len() >= 3 && b.contains(&a)) || (b.len() >= 3 && a.contains(&b))
}

struct SkillCoverage {
    score: f64,
    matched: Vec<String>,
    missing: Vec<String>,
}

/// Required-set coverage is worth 70 points, preferred-set coverage 30.
/// An empty set grants its full share: a target that lists nothing cannot
/// penalize anyone for it.
fn skills_score(target: &TargetProfile, candidate: &CandidateProfile) -> SkillCoverage {
    let mut matched = Vec::new();
    let mut missing = Vec::new();

    let required_fraction = if target.required_skills.is_empty() {
        1.0
    } else {
        let mut hits = 0usize;
        for wanted in &target.required_skills {
            if candidate.skills.iter().any(|have| skills_match(wanted, have)) {
                hits += 1;
                matched.push(wanted.clone());
            } else {
                missing.push(wanted.clone());
            }
        }
        hits as f64 / target.required_skills.len() as f64
    };

    let preferred_fraction = if target.preferred_skills.is_empty() {
        1.0
    } else {
        let mut hits = 0usize;
        for wanted in &target.preferred_skills {
            if candidate.skills.iter().any(|have| skills_match(wanted, have)) {
                hits += 1;
                matched.push(wanted.clone());
            }
        }
        hits as f64 / target.preferred_skills.len() as f64
    };

    SkillCoverage {
        score: required_fraction * 70.0 + preferred_fraction * 30.0,
        matched,
        missing,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Experience
// ────────────────────────────────────────────────────────────────────────────

struct ExperienceScore {
    score: f64,
    actual_years: f64,
    required_years: f64,
}

fn experience_score(
    target: &TargetProfile,
    candidate: &CandidateProfile,
    now: DateTime<Utc>,
) -> ExperienceScore {
    let today = now.date_naive();
    let actual_years = total_tenure_years(&candidate.positions, today);
    let required_years = required_years_for(target.level.as_deref(), &target.title);

    let base = (actual_years / required_years * 100.0).min(100.0);
    let bonus = title_similarity_bonus(&target.title, &candidate.positions);

    ExperienceScore {
        score: (base + bonus).min(100.0),
        actual_years,
        required_years,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Education
// ────────────────────────────────────────────────────────────────────────────

fn degree_rank(text: &str) -> u8 {
    let lowered = text.to_lowercase();
    const DOCTORAL: &[&str] = &["phd", "ph.d", "doctor"];
    const MASTERS: &[&str] = &["master", "msc", "m.sc", "m.s", "mba", "meng"];
    const BACHELORS: &[&str] = &["bachelor", "bsc", "b.sc", "b.s", "btech", "b.tech", "undergraduate", "ba "];
    const ASSOCIATE: &[&str] = &["associate", "diploma"];

    if DOCTORAL.iter().any(|k| lowered.contains(k)) {
        4
    } else if MASTERS.iter().any(|k| lowered.contains(k)) {
        3
    } else if BACHELORS.iter().any(|k| lowered.contains(k)) || lowered == "ba" {
        2
    } else if ASSOCIATE.iter().any(|k| lowered.contains(k)) {
        1
    } else {
        0
    }
}

fn fields_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Base 70, shifted by how the candidate's highest degree compares to the
/// required level, plus a capped bonus for a relevant field of study.
fn education_score(target: &TargetProfile, candidate: &CandidateProfile) -> f64 {
    let highest = candidate
        .education
        .iter()
        .map(|d| degree_rank(&d.level))
        .max()
        .unwrap_or(0);

    let mut score: f64 = 70.0;

    if let Some(requirement) = &target.degree_requirement {
        let required = degree_rank(requirement);
        if required > 0 {
            if highest >= required {
                score += 15.0;
            } else {
                score -= 20.0;
            }
        }
    }

    if let Some(field) = &target.field_of_study {
        let relevant = candidate.education.iter().any(|d| {
            d.field
                .as_deref()
                .map(|f| fields_match(f, field))
                .unwrap_or(false)
        });
        if relevant {
            score += 10.0;
        }
    }

    score.clamp(0.0, 100.0)
}

// ────────────────────────────────────────────────────────────────────────────
// Location
// ────────────────────────────────────────────────────────────────────────────

fn location_tokens(segment: &str) -> Vec<String> {
    segment
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// City is the part before the first comma, country the part after the last.
fn split_location(raw: &str) -> (String, Option<String>) {
    match raw.split_once(',') {
        Some((city, rest)) => {
            let country = rest.rsplit(',').next().unwrap_or(rest).trim().to_lowercase();
            (city.trim().to_string(), Some(country))
        }
        None => (raw.trim().to_string(), None),
    }
}

fn location_score(target: &TargetProfile, candidate: &CandidateProfile) -> (f64, bool) {
    if target.remote {
        return (100.0, true);
    }
    let Some(target_loc) = target.location.as_deref() else {
        return (90.0, true);
    };
    let Some(candidate_loc) = candidate.location.as_deref() else {
        return (80.0, true);
    };

    let (target_city, target_country) = split_location(target_loc);
    let (candidate_city, candidate_country) = split_location(candidate_loc);

    let target_tokens = location_tokens(&target_city);
    let candidate_tokens = location_tokens(&candidate_city);
    let city_overlap = target_tokens
        .iter()
        .any(|t| candidate_tokens.contains(t));
    if city_overlap {
        return (100.0, true);
    }

    if let (Some(a), Some(b)) = (target_country, candidate_country) {
        if a == b {
            return (70.0, true);
        }
    }

    (40.0, false)
}

// ────────────────────────────────────────────────────────────────────────────
// Salary
// ────────────────────────────────────────────────────────────────────────────

fn salary_score(
    target: Option<SalaryRange>,
    expectation: Option<SalaryRange>,
) -> (f64, bool) {
    let (Some(target), Some(expectation)) = (target, expectation) else {
        return (70.0, false);
    };
    let target = target.normalized();
    let expectation = expectation.normalized();

    // Candidate expectation fully inside the offered range.
    if expectation.min >= target.min && expectation.max <= target.max {
        return (100.0, true);
    }

    let overlap = target.max.min(expectation.max) - target.min.max(expectation.min);
    if overlap > 0.0 {
        let span = (expectation.max - expectation.min).max(1.0);
        let overlap_percent = (overlap / span * 100.0).min(100.0);
        return (50.0 + 0.5 * overlap_percent, true);
    }

    // Offer tops out below what the candidate wants.
    if target.max < expectation.min {
        let gap_fraction = (expectation.min - target.max) / expectation.min.max(1.0);
        return ((60.0 - gap_fraction * 100.0).max(20.0), false);
    }

    // Offer starts above the candidate's expectation.
    (85.0, false)
}

// ────────────────────────────────────────────────────────────────────────────
// Aggregate
// ────────────────────────────────────────────────────────────────────────────

fn validate_weights(weights: &ScoreWeights) -> Result<f64, EngineError> {
    let values = [
        weights.skills,
        weights.experience,
        weights.education,
        weights.location,
        weights.salary,
    ];
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(EngineError::InvalidInput(
            "score weights must be finite and non-negative".to_string(),
        ));
    }
    let sum: f64 = values.iter().sum();
    if sum <= 0.0 {
        return Err(EngineError::InvalidInput(
            "score weights must not all be zero".to_string(),
        ));
    }
    Ok(sum)
}

/// Scores a candidate against a target. Pure and deterministic; `now` is the
/// clock for open-ended tenure and is injected for exactly that reason.
pub fn score_compatibility(
    target: &TargetProfile,
    candidate: &CandidateProfile,
    weights: &ScoreWeights,
    now: DateTime<Utc>,
) -> Result<CompatibilityReport, EngineError> {
    let weight_sum = validate_weights(weights)?;

    let skills = skills_score(target, candidate);
    let experience = experience_score(target, candidate, now);
    let education = education_score(target, candidate);
    let (location, location_compatible) = location_score(target, candidate);
    let (salary, salary_in_range) = salary_score(
        target.salary_range,
        candidate.expected_salary,
    );

    let sub_scores = SubScores {
        skills: skills.score,
        experience: experience.score,
        education,
        location,
        salary,
    };

    // Weights are rescaled by their sum so a non-normalized set shifts the
    // blend, never the 0-100 ceiling.
    let overall = (weights.skills * sub_scores.skills
        + weights.experience * sub_scores.experience
        + weights.education * sub_scores.education
        + weights.location * sub_scores.location
        + weights.salary * sub_scores.salary)
        / weight_sum;

    Ok(CompatibilityReport {
        overall,
        sub_scores,
        matched_skills: skills.matched,
        missing_skills: skills.missing,
        actual_years: experience.actual_years,
        required_years: experience.required_years,
        salary_in_range,
        location_compatible,
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures;
    use super::super::{Degree, Position, SalaryRange};
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_scoring_is_pure() {
        let target = fixtures::target();
        let candidate = fixtures::candidate();
        let weights = ScoreWeights::default();

        let a = score_compatibility(&target, &candidate, &weights, fixed_now()).unwrap();
        let b = score_compatibility(&target, &candidate, &weights, fixed_now()).unwrap();
        assert_eq!(a.overall, b.overall);
        assert_eq!(a.sub_scores, b.sub_scores);
    }

    #[test]
    fn test_overall_stays_within_bounds() {
        let report = score_compatibility(
            &fixtures::target(),
            &fixtures::candidate(),
            &ScoreWeights::default(),
            fixed_now(),
        )
        .unwrap();
        assert!((0.0..=100.0).contains(&report.overall));
        assert!(report.overall > 60.0, "strong fixture scored {}", report.overall);
    }

    #[test]
    fn test_alias_symmetry_kubernetes_k8s() {
        assert!(skills_match("Kubernetes", "k8s"));
        assert!(skills_match("k8s", "Kubernetes"));
        assert!(skills_match("JS", "JavaScript"));
        assert!(skills_match("golang", "Go"));
    }

    #[test]
    fn test_containment_matches_both_ways() {
        assert!(skills_match("react", "React Native"));
        assert!(skills_match("React Native", "react"));
        assert!(!skills_match("go", "google sheets"), "short tokens must not contain-match");
    }

    #[test]
    fn test_full_required_coverage_scores_seventy_plus() {
        let mut target = fixtures::target();
        target.preferred_skills.clear();
        let candidate = fixtures::candidate();

        let report =
            score_compatibility(&target, &candidate, &ScoreWeights::default(), fixed_now())
                .unwrap();
        assert_eq!(report.sub_scores.skills, 100.0);
        assert!(report.missing_skills.is_empty());
    }

    #[test]
    fn test_missing_required_skill_is_reported() {
        let mut target = fixtures::target();
        target.required_skills.push("Erlang".to_string());

        let report = score_compatibility(
            &target,
            &fixtures::candidate(),
            &ScoreWeights::default(),
            fixed_now(),
        )
        .unwrap();
        assert!(report.missing_skills.contains(&"Erlang".to_string()));
        assert!(report.sub_scores.skills < 100.0);
    }

    #[test]
    fn test_salary_partial_overlap_lands_between_50_and_100() {
        let target = SalaryRange {
            min: 120_000.0,
            max: 150_000.0,
        };
        let expectation = SalaryRange {
            min: 100_000.0,
            max: 140_000.0,
        };

        let (score, in_range) = salary_score(Some(target), Some(expectation));
        assert!(score > 50.0 && score < 100.0, "score was {score}");
        assert!(in_range);
        // Overlap [120k, 140k] is half the expectation span.
        assert!((score - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_salary_containment_scores_full() {
        let (score, in_range) = salary_score(
            Some(SalaryRange {
                min: 100_000.0,
                max: 160_000.0,
            }),
            Some(SalaryRange {
                min: 120_000.0,
                max: 140_000.0,
            }),
        );
        assert_eq!(score, 100.0);
        assert!(in_range);
    }

    #[test]
    fn test_salary_offer_below_expectation_floors_at_20() {
        // Offer max 50k, expectation min 100k: gap fraction 0.5 -> 60-50=10,
        // floored to 20.
        let (score, in_range) = salary_score(
            Some(SalaryRange {
                min: 40_000.0,
                max: 50_000.0,
            }),
            Some(SalaryRange {
                min: 100_000.0,
                max: 120_000.0,
            }),
        );
        assert_eq!(score, 20.0);
        assert!(!in_range);
    }

    #[test]
    fn test_salary_offer_above_expectation_is_85() {
        let (score, _) = salary_score(
            Some(SalaryRange {
                min: 150_000.0,
                max: 180_000.0,
            }),
            Some(SalaryRange {
                min: 90_000.0,
                max: 120_000.0,
            }),
        );
        assert_eq!(score, 85.0);
    }

    #[test]
    fn test_salary_absent_ranges_score_70() {
        assert_eq!(salary_score(None, None).0, 70.0);
        assert_eq!(
            salary_score(
                Some(SalaryRange {
                    min: 1.0,
                    max: 2.0
                }),
                None
            )
            .0,
            70.0
        );
    }

    #[test]
    fn test_location_tiers() {
        let mut target = fixtures::target();
        let mut candidate = fixtures::candidate();

        // Same city
        assert_eq!(location_score(&target, &candidate).0, 100.0);

        // Same country, different city
        candidate.location = Some("Munich, Germany".to_string());
        assert_eq!(location_score(&target, &candidate).0, 70.0);

        // Different country
        candidate.location = Some("Lisbon, Portugal".to_string());
        let (score, compatible) = location_score(&target, &candidate);
        assert_eq!(score, 40.0);
        assert!(!compatible);

        // Candidate location unknown
        candidate.location = None;
        assert_eq!(location_score(&target, &candidate).0, 80.0);

        // Target location unspecified
        target.location = None;
        assert_eq!(location_score(&target, &candidate).0, 90.0);

        // Remote trumps everything
        target.remote = true;
        target.location = Some("Berlin, Germany".to_string());
        candidate.location = Some("Lisbon, Portugal".to_string());
        assert_eq!(location_score(&target, &candidate).0, 100.0);
    }

    #[test]
    fn test_education_meets_and_misses_requirement() {
        let target = fixtures::target();
        let mut candidate = fixtures::candidate();

        // BSc in CS against a bachelor requirement with field bonus.
        let meets = education_score(&target, &candidate);
        assert_eq!(meets, 95.0);

        candidate.education = vec![Degree {
            level: "High school".to_string(),
            field: None,
        }];
        let below = education_score(&target, &candidate);
        assert_eq!(below, 50.0);
    }

    #[test]
    fn test_experience_ratio_and_bonus() {
        let target = fixtures::target();
        let candidate = fixtures::candidate();

        let report =
            score_compatibility(&target, &candidate, &ScoreWeights::default(), fixed_now())
                .unwrap();
        // ~7.2 years against 5 required, capped at 100 before bonus.
        assert!(report.actual_years > 7.0);
        assert_eq!(report.required_years, 5.0);
        assert_eq!(report.sub_scores.experience, 100.0);
    }

    #[test]
    fn test_non_normalized_weights_rescale_not_shift() {
        let target = fixtures::target();
        let candidate = fixtures::candidate();

        let unit = ScoreWeights::default();
        let doubled = ScoreWeights {
            skills: 0.70,
            experience: 0.60,
            education: 0.30,
            location: 0.20,
            salary: 0.20,
        };

        let a = score_compatibility(&target, &candidate, &unit, fixed_now()).unwrap();
        let b = score_compatibility(&target, &candidate, &doubled, fixed_now()).unwrap();
        assert!((a.overall - b.overall).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_weights_are_rejected() {
        let zero = ScoreWeights {
            skills: 0.0,
            experience: 0.0,
            education: 0.0,
            location: 0.0,
            salary: 0.0,
        };
        let err = score_compatibility(
            &fixtures::target(),
            &fixtures::candidate(),
            &zero,
            fixed_now(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::InvalidInput);

        let negative = ScoreWeights {
            skills: -1.0,
            ..ScoreWeights::default()
        };
        assert!(score_compatibility(
            &fixtures::target(),
            &fixtures::candidate(),
            &negative,
            fixed_now()
        )
        .is_err());
    }

    #[test]
    fn test_empty_candidate_scores_low_but_valid() {
        let candidate = super::super::CandidateProfile {
            candidate_id: uuid::Uuid::new_v4(),
            skills: vec![],
            positions: vec![Position {
                title: "Intern".to_string(),
                start: "not a date".to_string(),
                end: None,
            }],
            education: vec![],
            location: None,
            expected_salary: None,
        };

        let report = score_compatibility(
            &fixtures::target(),
            &candidate,
            &ScoreWeights::default(),
            fixed_now(),
        )
        .unwrap();
        assert!((0.0..=100.0).contains(&report.overall));
        assert_eq!(report.actual_years, 0.0);
        assert_eq!(report.missing_skills.len(), 2);
    }
}
