use crate::document::Roster;
use crate::models::{AdviceBucket, GradeRecord, RosterEntry};

pub const GRADE_POINTS: [(&str, u32); 3] = [("A", 20), ("B", 15), ("C", 10)];

/// Points for a letter grade; anything outside the table scores zero.
pub fn grade_points(letter: &str) -> u32 {
    GRADE_POINTS
        .iter()
        .find(|(grade, _)| *grade == letter)
        .map_or(0, |(_, points)| *points)
}

pub fn average_points(letter_grades: &[String]) -> f64 {
    if letter_grades.is_empty() {
        return 0.0;
    }
    let total: u32 = letter_grades.iter().map(|grade| grade_points(grade)).sum();
    f64::from(total) / letter_grades.len() as f64
}

pub fn advice_for(average: f64) -> AdviceBucket {
    if average >= 17.0 {
        AdviceBucket::Excellent
    } else if average >= 14.0 {
        AdviceBucket::GoodCanImprove
    } else if average >= 12.0 {
        AdviceBucket::Borderline
    } else {
        AdviceBucket::NeedsSupport
    }
}

pub fn normalize_entry(entry: &RosterEntry) -> GradeRecord {
    let average = average_points(&entry.letter_grades);
    GradeRecord {
        student_name: entry.student_name.clone(),
        letter_grades: entry.letter_grades.clone(),
        average,
        advice: advice_for(average),
    }
}

pub fn normalize_roster(roster: &Roster) -> Vec<GradeRecord> {
    roster.entries.iter().map(normalize_entry).collect()
}
