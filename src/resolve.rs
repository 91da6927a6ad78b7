//! Maps free-text allocation subject names onto canonical subject rows, and
//! pulls semester numbers out of class names.
//!
//! Allocation names are typed by hand and arrive in many shapes:
//! `"DBMS - Semester 3"`, `"20CS41 Data Structures"`, `"Maths • Semester 2"`.
//! Resolution generates a handful of candidate strings from the input and
//! compares their punctuation-free keys against each subject's name and code,
//! strongest evidence first.

use crate::error::{AppError, AppResult};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;

const SEPARATORS: [char; 2] = ['•', '-'];

/// Shorter keys are too ambiguous to be used for substring matching.
const MIN_SUBSTRING_KEY_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRow {
    pub id: String,
    pub code: String,
    pub name: String,
    pub semester: i64,
}

pub fn extract_semester_from_class(class_name: &str) -> Option<i64> {
    if let Some(d) = class_name.chars().find(|c| ('1'..='8').contains(c)) {
        return d.to_digit(10).map(i64::from);
    }
    class_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(roman_semester)
}

fn roman_semester(token: &str) -> Option<i64> {
    let n = match token.to_ascii_lowercase().as_str() {
        "i" => 1,
        "ii" => 2,
        "iii" => 3,
        "iv" => 4,
        "v" => 5,
        "vi" => 6,
        "vii" => 7,
        "viii" => 8,
        _ => return None,
    };
    Some(n)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strips one trailing `semester N` annotation. With `require_sep` the
/// annotation must be introduced by `-` or `•`.
fn strip_semester_suffix(s: &str, require_sep: bool) -> Option<&str> {
    let rest = s.trim_end();
    let digits_start = rest.trim_end_matches(|c: char| c.is_ascii_digit());
    if digits_start.len() == rest.len() {
        return None;
    }
    let before_digits = digits_start.trim_end();
    const WORD: &str = "semester";
    if before_digits.len() < WORD.len() {
        return None;
    }
    let split = before_digits.len() - WORD.len();
    if !before_digits.is_char_boundary(split)
        || !before_digits[split..].eq_ignore_ascii_case(WORD)
    {
        return None;
    }
    let head = before_digits[..split].trim_end();
    match head.strip_suffix(SEPARATORS) {
        Some(h) => Some(h.trim_end()),
        None if require_sep => None,
        None => Some(head),
    }
}

pub fn normalize_subject_name(name: &str) -> String {
    let collapsed = collapse_whitespace(name);
    let mut cleaned: &str = &collapsed;
    if let Some(s) = strip_semester_suffix(cleaned, true) {
        cleaned = s;
    }
    if let Some(s) = strip_semester_suffix(cleaned, false) {
        cleaned = s;
    }
    cleaned.trim().to_string()
}

pub fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn has_letter_and_digit(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_alphabetic()) && token.chars().any(|c| c.is_ascii_digit())
}

pub fn subject_name_candidates(subject_name: &str) -> Vec<String> {
    let raw = collapse_whitespace(subject_name);
    let cleaned = normalize_subject_name(&raw);

    let mut out: Vec<String> = Vec::new();
    let mut push = |c: &str| {
        let c = c.trim();
        if !c.is_empty() && !out.iter().any(|o| o == c) {
            out.push(c.to_string());
        }
    };
    push(raw.as_str());
    push(cleaned.as_str());

    for sep in SEPARATORS {
        if !cleaned.contains(sep) {
            continue;
        }
        let parts: Vec<&str> = cleaned
            .split(sep)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if let (Some(&first), Some(&last)) = (parts.first(), parts.last()) {
            push(first);
            push(last);
        }
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.len() > 1 && has_letter_and_digit(tokens[0]) {
        push(tokens[1..].join(" ").as_str());
    }

    out
}

pub fn extract_code_candidates(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| has_letter_and_digit(t))
        .map(|t| t.to_ascii_uppercase())
        .collect()
}

/// Picks the best subject for `subject_name` among `subjects`.
///
/// Tiers, strongest first: exact key match on name or code, then a code-like
/// token matching a subject code, then substring containment between a
/// candidate and a subject name. Within a tier the first subject in slice
/// order wins.
pub fn match_subject<'a>(subjects: &'a [SubjectRow], subject_name: &str) -> Option<&'a SubjectRow> {
    let candidate_keys: Vec<String> = subject_name_candidates(subject_name)
        .iter()
        .map(|c| normalize_key(c))
        .filter(|k| !k.is_empty())
        .collect();
    let code_keys: Vec<String> = extract_code_candidates(subject_name)
        .iter()
        .map(|c| normalize_key(c))
        .filter(|k| !k.is_empty())
        .collect();
    if candidate_keys.is_empty() && code_keys.is_empty() {
        return None;
    }

    let keyed: Vec<(&SubjectRow, String, String)> = subjects
        .iter()
        .map(|s| (s, normalize_key(&s.name), normalize_key(&s.code)))
        .collect();

    let exact = keyed.iter().find(|(_, name_key, code_key)| {
        candidate_keys
            .iter()
            .any(|ck| ck == name_key || ck == code_key)
    });
    if let Some((s, _, _)) = exact {
        return Some(*s);
    }

    let by_code = keyed
        .iter()
        .find(|(_, _, code_key)| code_keys.iter().any(|ck| ck == code_key));
    if let Some((s, _, _)) = by_code {
        return Some(*s);
    }

    keyed
        .iter()
        .find(|(_, name_key, _)| {
            name_key.len() >= MIN_SUBSTRING_KEY_LEN
                && candidate_keys.iter().any(|ck| {
                    ck.len() >= MIN_SUBSTRING_KEY_LEN
                        && (name_key.contains(ck.as_str()) || ck.contains(name_key.as_str()))
                })
        })
        .map(|(s, _, _)| *s)
}

fn load_subjects(
    conn: &Connection,
    branch_id: &str,
    semester: Option<i64>,
) -> rusqlite::Result<Vec<SubjectRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, subject_code, subject_name, semester
         FROM subjects
         WHERE branch_id = ?1 AND is_active = 1 AND (?2 IS NULL OR semester = ?2)
         ORDER BY subject_code",
    )?;
    stmt.query_map((branch_id, semester), |r| {
        Ok(SubjectRow {
            id: r.get(0)?,
            code: r.get(1)?,
            name: r.get(2)?,
            semester: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// Resolves an allocation subject name within a branch, preferring the given
/// semester and falling back to the whole branch.
pub fn resolve_subject(
    conn: &Connection,
    branch_id: &str,
    semester: Option<i64>,
    subject_name: &str,
) -> AppResult<SubjectRow> {
    if subject_name.trim().is_empty() {
        return Err(AppError::UnresolvedSubject(subject_name.to_string()));
    }

    if semester.is_some() {
        let scoped = load_subjects(conn, branch_id, semester)?;
        if let Some(s) = match_subject(&scoped, subject_name) {
            return Ok(s.clone());
        }
    }

    let all = load_subjects(conn, branch_id, None)?;
    match match_subject(&all, subject_name) {
        Some(s) => {
            if semester.is_some_and(|sem| sem != s.semester) {
                tracing::debug!(
                    subject = %s.code,
                    requested = ?semester,
                    "subject resolved outside the allocation semester"
                );
            }
            Ok(s.clone())
        }
        None => Err(AppError::UnresolvedSubject(subject_name.to_string())),
    }
}
