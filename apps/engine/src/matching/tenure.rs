//! Tenure arithmetic — flexible employment-date parsing and experience
//! requirements inferred from seniority keywords.

use chrono::{Datelike, NaiveDate};

use super::Position;

/// Parses the date formats that show up in real profiles: ISO (`2020-01-15`,
/// `2020-01`), slash (`01/2020`, `2020/01`), month names (`January 2020`,
/// `Mar 2019`), and bare years (`2020`).
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }

    // YYYY-MM
    if let Some((year, month)) = raw.split_once('-') {
        if let (Ok(year), Ok(month)) = (year.parse::<i32>(), month.parse::<u32>()) {
            if let Some(date) = NaiveDate::from_ymd_opt(year, month, 1) {
                return Some(date);
            }
        }
    }

    // MM/YYYY or YYYY/MM; the four-digit side is the year.
    if let Some((a, b)) = raw.split_once('/') {
        if let (Ok(a), Ok(b)) = (a.parse::<i64>(), b.parse::<i64>()) {
            let (year, month) = if a > 12 { (a, b) } else { (b, a) };
            if let Some(date) = NaiveDate::from_ymd_opt(year as i32, month as u32, 1) {
                return Some(date);
            }
        }
    }

    // "January 2020" / "Mar 2019"
    let mut parts = raw.split_whitespace();
    if let (Some(name), Some(year)) = (parts.next(), parts.next()) {
        if let (Some(month), Ok(year)) = (
            month_number(name),
            year.trim_end_matches(',').parse::<i32>(),
        ) {
            return NaiveDate::from_ymd_opt(year, month, 1);
        }
    }

    // Bare year
    if let Ok(year) = raw.parse::<i32>() {
        if (1900..=2100).contains(&year) {
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
    }

    None
}

fn month_number(name: &str) -> Option<u32> {
    let lowered = name.to_lowercase();
    let prefix = lowered.get(..3)?;
    match prefix {
        "jan" => Some(1),
        "feb" => Some(2),
        "mar" => Some(3),
        "apr" => Some(4),
        "may" => Some(5),
        "jun" => Some(6),
        "jul" => Some(7),
        "aug" => Some(8),
        "sep" => Some(9),
        "oct" => Some(10),
        "nov" => Some(11),
        "dec" => Some(12),
        _ => None,
    }
}

fn months_between(start: NaiveDate, end: NaiveDate) -> f64 {
    let years = end.year() - start.year();
    let months = end.month() as i32 - start.month() as i32;
    let total = years * 12 + months;
    let day_frac = (end.day() as f64 - start.day() as f64) / 30.0;
    (total as f64 + day_frac).max(0.0)
}

/// Tenure of one position in fractional years. An open end, or one that
/// reads "Present"/"current", counts up to the injected `now`.
pub fn position_tenure_years(position: &Position, now: NaiveDate) -> f64 {
    let Some(start) = parse_flexible_date(&position.start) else {
        return 0.0;
    };
    let end = position
        .end
        .as_deref()
        .and_then(|raw| {
            let lowered = raw.trim().to_lowercase();
            if matches!(lowered.as_str(), "present" | "current" | "now" | "ongoing") {
                None
            } else {
                parse_flexible_date(raw)
            }
        })
        .unwrap_or(now);

    months_between(start, end) / 12.0
}

/// Total tenure across positions. Overlapping positions double-count;
/// the signal wanted here is accumulated practice, not calendar coverage.
pub fn total_tenure_years(positions: &[Position], now: NaiveDate) -> f64 {
    positions
        .iter()
        .map(|p| position_tenure_years(p, now))
        .sum()
}

/// Years of experience implied by seniority keywords in the level or title.
pub fn required_years_for(level: Option<&str>, title: &str) -> f64 {
    let haystack = format!("{} {}", level.unwrap_or(""), title).to_lowercase();

    const ENTRY: &[&str] = &["intern", "entry", "junior", "graduate", "trainee"];
    const LEAD: &[&str] = &["lead", "principal", "staff", "head of"];
    const SENIOR: &[&str] = &["senior", "sr."];
    const MID: &[&str] = &["mid-level", "mid level", "intermediate"];

    if ENTRY.iter().any(|k| haystack.contains(k)) {
        1.0
    } else if LEAD.iter().any(|k| haystack.contains(k)) {
        7.0
    } else if SENIOR.iter().any(|k| haystack.contains(k)) {
        5.0
    } else if MID.iter().any(|k| haystack.contains(k)) {
        3.0
    } else {
        2.0
    }
}

/// Title/category similarity bonus, 0 to 10: best token overlap between the
/// target title and any held title.
pub fn title_similarity_bonus(target_title: &str, positions: &[Position]) -> f64 {
    let target_tokens = title_tokens(target_title);
    if target_tokens.is_empty() {
        return 0.0;
    }

    positions
        .iter()
        .map(|p| {
            let held = title_tokens(&p.title);
            let overlap = target_tokens.iter().filter(|t| held.contains(*t)).count();
            overlap as f64 / target_tokens.len() as f64 * 10.0
        })
        .fold(0.0, f64::max)
}

fn title_tokens(title: &str) -> Vec<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(str::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn position(start: &str, end: Option<&str>) -> Position {
        Position {
            title: "Engineer".to_string(),
            start: start.to_string(),
            end: end.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_iso_formats() {
        assert_eq!(parse_flexible_date("2020-01-15"), Some(date(2020, 1, 15)));
        assert_eq!(parse_flexible_date("2020-01"), Some(date(2020, 1, 1)));
    }

    #[test]
    fn test_parse_slash_formats() {
        assert_eq!(parse_flexible_date("01/2020"), Some(date(2020, 1, 1)));
        assert_eq!(parse_flexible_date("2020/06"), Some(date(2020, 6, 1)));
    }

    #[test]
    fn test_parse_month_name_formats() {
        assert_eq!(parse_flexible_date("January 2020"), Some(date(2020, 1, 1)));
        assert_eq!(parse_flexible_date("Mar 2019"), Some(date(2019, 3, 1)));
        assert_eq!(parse_flexible_date("sep 2021"), Some(date(2021, 9, 1)));
    }

    #[test]
    fn test_parse_bare_year() {
        assert_eq!(parse_flexible_date("2020"), Some(date(2020, 1, 1)));
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert_eq!(parse_flexible_date("soon"), None);
        assert_eq!(parse_flexible_date(""), None);
        assert_eq!(parse_flexible_date("2020-13"), None);
    }

    #[test]
    fn test_closed_position_tenure_matches_calendar() {
        // 2020-01 to 2022-06 is 29 months, about 2.4 years.
        let years = position_tenure_years(
            &position("2020-01", Some("2022-06")),
            date(2024, 1, 1),
        );
        assert!((years - 2.4).abs() < 0.1, "tenure was {years}");
    }

    #[test]
    fn test_open_position_is_deterministic_under_fixed_clock() {
        let fixed_now = date(2023, 1, 1);
        let a = position_tenure_years(&position("2020-01", None), fixed_now);
        let b = position_tenure_years(&position("2020-01", Some("Present")), fixed_now);
        assert_eq!(a, b);
        assert!((a - 3.0).abs() < 0.05, "tenure was {a}");
    }

    #[test]
    fn test_unparseable_start_contributes_zero() {
        let years = position_tenure_years(&position("unknown", Some("2022-06")), date(2024, 1, 1));
        assert_eq!(years, 0.0);
    }

    #[test]
    fn test_required_years_from_keywords() {
        assert_eq!(required_years_for(Some("junior"), "Developer"), 1.0);
        assert_eq!(required_years_for(None, "Mid-level Engineer"), 3.0);
        assert_eq!(required_years_for(Some("senior"), "Engineer"), 5.0);
        assert_eq!(required_years_for(None, "Staff Engineer"), 7.0);
        assert_eq!(required_years_for(None, "Principal Engineer"), 7.0);
        assert_eq!(required_years_for(None, "Software Engineer"), 2.0);
    }

    #[test]
    fn test_title_bonus_rewards_overlap() {
        let positions = vec![Position {
            title: "Senior Backend Engineer".to_string(),
            start: "2020-01".to_string(),
            end: None,
        }];
        let full = title_similarity_bonus("Senior Backend Engineer", &positions);
        assert!((full - 10.0).abs() < 1e-9);

        let partial = title_similarity_bonus("Backend Developer", &positions);
        assert!(partial > 0.0 && partial < 10.0);

        let none = title_similarity_bonus("Accountant", &positions);
        assert_eq!(none, 0.0);
    }
}
