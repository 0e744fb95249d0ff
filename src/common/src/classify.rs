//! Free-text classification of marketplace listing titles.
//!
//! All functions are pure: raw text in, closed answers out.

use rust_decimal::Decimal;

/// Title terms marking a listing that does not represent the card itself
/// (group breaks, raffles, digital items, chase promos, bundles).
const LOW_QUALITY_TERMS: &[&str] = &["chase", "razz", "break", "digital", "lot of"];

/// Grading companies recognised in titles, in match order.
const GRADERS: &[&str] = &["psa", "bgs", "sgc", "cgc"];

/// Listings priced below 1/OUTLIER_DIVISOR of the fetched batch median are ignored.
const OUTLIER_DIVISOR: i64 = 4;

/// Grader and grade bucket parsed from a title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleGrade {
    pub grader: String,
    pub grade: String,
}

impl TitleGrade {
    fn raw() -> Self {
        Self {
            grader: "Raw".to_string(),
            grade: "Raw".to_string(),
        }
    }
}

/// True when the title names a break, raffle, digital item, chase promo or lot.
pub fn is_low_quality_title(title: &str) -> bool {
    let lower = title.to_lowercase();
    LOW_QUALITY_TERMS.iter().any(|term| lower.contains(term))
}

/// Parse the grading company and grade bucket ("10", "9", "<9") from a title.
///
/// Titles with no recognised grader are "Raw"/"Raw". A grader with no number
/// after it keeps the grade "Raw".
pub fn parse_title_grade(title: &str) -> TitleGrade {
    let lower = title.to_lowercase();

    for grader in GRADERS {
        let Some(pos) = lower.find(grader) else {
            continue;
        };

        let rest = lower[pos + grader.len()..].trim_start();
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let number = number.trim_end_matches('.');

        let grade = match number.parse::<f64>() {
            Ok(v) if v == 10.0 => "10",
            Ok(v) if v == 9.0 => "9",
            Ok(_) => "<9",
            Err(_) => "Raw",
        };

        return TitleGrade {
            grader: grader.to_uppercase(),
            grade: grade.to_string(),
        };
    }

    TitleGrade::raw()
}

/// Whether a listing title plausibly describes the given grader/grade.
///
/// A raw item matches only raw titles; a graded item matches the same grader
/// and grade bucket. Grades outside the 10/9/<9 buckets compare as "<9".
pub fn title_matches_grade(title: &str, grader: &str, grade: &str) -> bool {
    let parsed = parse_title_grade(title);

    if grader.eq_ignore_ascii_case("raw") {
        return parsed.grader == "Raw";
    }

    if !parsed.grader.eq_ignore_ascii_case(grader) {
        return false;
    }

    grade_bucket(grade) == parsed.grade
}

fn grade_bucket(grade: &str) -> &'static str {
    match grade.trim().parse::<f64>() {
        Ok(v) if v == 10.0 => "10",
        Ok(v) if v == 9.0 => "9",
        Ok(_) => "<9",
        Err(_) => "Raw",
    }
}

/// Price far below the median of the same fetch (mislabelled or bait listing).
pub fn is_price_outlier(price: Decimal, batch_median: Option<Decimal>) -> bool {
    match batch_median {
        Some(median) if median > Decimal::ZERO => price * Decimal::from(OUTLIER_DIVISOR) < median,
        _ => false,
    }
}
