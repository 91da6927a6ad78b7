//! Entry windows for attendance and CIE data.
//!
//! A HOD opens or closes a window per branch. Each (branch, kind, semester)
//! has exactly one row in `controls`; toggling updates that row in place, so
//! the latest toggle is the state. A NULL semester opens the window for the
//! whole branch.

use crate::db;
use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Attendance,
    Cie,
}

impl ControlKind {
    pub fn parse(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attendance" => Ok(ControlKind::Attendance),
            "cie" => Ok(ControlKind::Cie),
            other => Err(AppError::bad_params_with(
                "type must be one of: attendance, cie",
                json!({ "type": other }),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Attendance => "attendance",
            ControlKind::Cie => "cie",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ControlKind::Attendance => "Attendance",
            ControlKind::Cie => "CIE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRow {
    pub id: String,
    pub semester: Option<i64>,
    pub month: Option<String>,
    pub cie_type: Option<String>,
    pub is_active: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct ControlUpdate {
    pub kind: ControlKind,
    pub enabled: bool,
    pub semesters: Vec<i64>,
    pub month: Option<String>,
    pub cie_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlChange {
    pub activated: usize,
    pub deactivated: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub enabled: bool,
    pub semesters: Vec<i64>,
    pub month: Option<String>,
    pub cie_type: Option<String>,
}

pub fn normalize_month(raw: &str) -> AppResult<String> {
    match raw.trim().parse::<u32>() {
        Ok(m) if (1..=12).contains(&m) => Ok(format!("{m:02}")),
        _ => Err(AppError::bad_params_with(
            "month must be between 01 and 12",
            json!({ "month": raw }),
        )),
    }
}

/// First run of digits in a label like `"CIE 2"` or `"cie-3 (retest)"`.
pub fn extract_cie_number(cie_type: &str) -> Option<i64> {
    let start = cie_type.find(|c: char| c.is_ascii_digit())?;
    let digits: String = cie_type[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn active_controls(
    conn: &Connection,
    branch_id: &str,
    kind: ControlKind,
) -> rusqlite::Result<Vec<ControlRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, semester, month, cie_type, is_active, updated_at
         FROM controls
         WHERE branch_id = ? AND control_type = ? AND is_active = 1
         ORDER BY updated_at DESC, IFNULL(semester, 0)",
    )?;
    stmt.query_map((branch_id, kind.as_str()), |r| {
        Ok(ControlRow {
            id: r.get(0)?,
            semester: r.get(1)?,
            month: r.get(2)?,
            cie_type: r.get(3)?,
            is_active: r.get::<_, i64>(4)? != 0,
            updated_at: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
}

/// Whether a staff member teaching `staff_semesters` may enter data under
/// the given active controls. Staff with no known semester are admitted by
/// any open window.
pub fn control_enabled_for_staff(controls: &[ControlRow], staff_semesters: &BTreeSet<i64>) -> bool {
    if controls.is_empty() {
        return false;
    }
    if staff_semesters.is_empty() {
        return true;
    }
    controls.iter().any(|c| match c.semester {
        None => true,
        Some(sem) => staff_semesters.contains(&sem),
    })
}

/// Fails with `entry_closed` unless the window is open for `semester`.
pub fn ensure_entry_open(
    conn: &Connection,
    branch_id: &str,
    kind: ControlKind,
    semester: Option<i64>,
) -> AppResult<()> {
    let controls = active_controls(conn, branch_id, kind)?;
    let semesters: BTreeSet<i64> = semester.into_iter().collect();
    if control_enabled_for_staff(&controls, &semesters) {
        Ok(())
    } else {
        Err(AppError::EntryClosed(format!("{} entry disabled", kind.label())))
    }
}

pub fn control_status(conn: &Connection, branch_id: &str, kind: ControlKind) -> AppResult<ControlStatus> {
    let controls = active_controls(conn, branch_id, kind)?;
    let latest = controls.first();
    let semesters: BTreeSet<i64> = controls.iter().filter_map(|c| c.semester).collect();
    Ok(ControlStatus {
        enabled: !controls.is_empty(),
        semesters: semesters.into_iter().collect(),
        month: latest.and_then(|c| c.month.clone()),
        cie_type: latest.and_then(|c| c.cie_type.clone()),
    })
}

/// Applies a HOD toggle. Disabling closes every row of the kind for the
/// branch; enabling opens exactly the requested semesters (or the
/// branch-wide row when none are given) and closes the rest.
pub fn set_controls(conn: &Connection, branch_id: &str, update: &ControlUpdate) -> AppResult<ControlChange> {
    let now = db::now_timestamp();
    let kind = update.kind;

    if !update.enabled {
        let closed = conn.execute(
            "UPDATE controls SET is_active = 0, updated_at = ?
             WHERE branch_id = ? AND control_type = ? AND is_active = 1",
            (&now, branch_id, kind.as_str()),
        )?;
        tracing::info!(branch = branch_id, kind = kind.as_str(), closed, "entry window disabled");
        return Ok(ControlChange {
            activated: 0,
            deactivated: closed,
        });
    }

    let (month, cie_type) = match kind {
        ControlKind::Attendance => {
            let raw = update
                .month
                .as_deref()
                .ok_or_else(|| AppError::bad_params("month is required to open attendance entry"))?;
            (Some(normalize_month(raw)?), None)
        }
        ControlKind::Cie => {
            let label = update
                .cie_type
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| AppError::bad_params("cieType is required to open CIE entry"))?;
            if extract_cie_number(label).is_none() {
                return Err(AppError::bad_params_with(
                    "cieType must name a CIE number",
                    json!({ "cieType": label }),
                ));
            }
            (None, Some(label.to_string()))
        }
    };

    let mut requested: BTreeSet<i64> = BTreeSet::new();
    for &sem in &update.semesters {
        if !(1..=8).contains(&sem) {
            return Err(AppError::bad_params_with(
                "semesters must be between 1 and 8",
                json!({ "semester": sem }),
            ));
        }
        requested.insert(sem);
    }
    let targets: Vec<Option<i64>> = if requested.is_empty() {
        vec![None]
    } else {
        requested.iter().copied().map(Some).collect()
    };

    let tx = conn.unchecked_transaction()?;
    let mut change = ControlChange::default();

    for row in active_controls(&tx, branch_id, kind)? {
        if !targets.contains(&row.semester) {
            tx.execute(
                "UPDATE controls SET is_active = 0, updated_at = ? WHERE id = ?",
                (&now, &row.id),
            )?;
            change.deactivated += 1;
        }
    }

    for semester in &targets {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM controls
                 WHERE branch_id = ? AND control_type = ? AND IFNULL(semester, 0) = IFNULL(?, 0)",
                (branch_id, kind.as_str(), semester),
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE controls
                     SET is_active = 1, month = ?, cie_type = ?, updated_at = ?
                     WHERE id = ?",
                    (&month, &cie_type, &now, &id),
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO controls(id, branch_id, control_type, semester, month, cie_type, is_active, created_at, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
                    (
                        db::new_id(),
                        branch_id,
                        kind.as_str(),
                        semester,
                        &month,
                        &cie_type,
                        &now,
                        &now,
                    ),
                )?;
            }
        }
        change.activated += 1;
    }

    tx.commit()?;
    tracing::info!(
        branch = branch_id,
        kind = kind.as_str(),
        semesters = ?requested,
        activated = change.activated,
        deactivated = change.deactivated,
        "entry window enabled"
    );
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = db::open_memory_db().expect("open db");
        conn.execute(
            "INSERT INTO branches(id, code, name) VALUES('b1', 'CSE', 'Computer Science'), ('b2', 'ECE', 'Electronics')",
            [],
        )
        .expect("branches");
        conn
    }

    fn attendance(enabled: bool, semesters: &[i64]) -> ControlUpdate {
        ControlUpdate {
            kind: ControlKind::Attendance,
            enabled,
            semesters: semesters.to_vec(),
            month: Some("9".into()),
            cie_type: None,
        }
    }

    fn row(semester: Option<i64>) -> ControlRow {
        ControlRow {
            id: "c".into(),
            semester,
            month: None,
            cie_type: None,
            is_active: true,
            updated_at: "now".into(),
        }
    }

    fn count_active(conn: &Connection, branch: &str, kind: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM controls WHERE branch_id = ? AND control_type = ? AND is_active = 1",
            (branch, kind),
            |r| r.get(0),
        )
        .expect("count")
    }

    #[test]
    fn disabling_closes_every_semester_of_the_kind() {
        let conn = setup();
        let change = set_controls(&conn, "b1", &attendance(true, &[3, 4])).expect("enable");
        assert_eq!(change.activated, 2);
        set_controls(
            &conn,
            "b1",
            &ControlUpdate {
                kind: ControlKind::Cie,
                enabled: true,
                semesters: vec![3],
                month: None,
                cie_type: Some("CIE 1".into()),
            },
        )
        .expect("enable cie");
        set_controls(&conn, "b2", &attendance(true, &[5])).expect("other branch");

        let change = set_controls(&conn, "b1", &attendance(false, &[])).expect("disable");
        assert_eq!(change.deactivated, 2);
        assert_eq!(count_active(&conn, "b1", "attendance"), 0);
        assert_eq!(count_active(&conn, "b1", "cie"), 1);
        assert_eq!(count_active(&conn, "b2", "attendance"), 1);
    }

    #[test]
    fn reenabling_reuses_the_state_row() {
        let conn = setup();
        set_controls(&conn, "b1", &attendance(true, &[3])).expect("enable");
        set_controls(&conn, "b1", &attendance(false, &[])).expect("disable");
        set_controls(&conn, "b1", &attendance(true, &[3, 3])).expect("enable again");
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM controls", [], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, 1);
        let status = control_status(&conn, "b1", ControlKind::Attendance).expect("status");
        assert!(status.enabled);
        assert_eq!(status.semesters, vec![3]);
        assert_eq!(status.month.as_deref(), Some("09"));
    }

    #[test]
    fn enabling_replaces_the_open_semesters() {
        let conn = setup();
        set_controls(&conn, "b1", &attendance(true, &[3, 4])).expect("enable");
        let change = set_controls(&conn, "b1", &attendance(true, &[5])).expect("re-enable");
        assert_eq!(change, ControlChange { activated: 1, deactivated: 2 });
        let status = control_status(&conn, "b1", ControlKind::Attendance).expect("status");
        assert_eq!(status.semesters, vec![5]);

        set_controls(&conn, "b1", &attendance(true, &[])).expect("branch-wide");
        let active = active_controls(&conn, "b1", ControlKind::Attendance).expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].semester, None);
    }

    #[test]
    fn enabling_validates_window_details() {
        let conn = setup();
        let mut no_month = attendance(true, &[3]);
        no_month.month = None;
        assert_eq!(set_controls(&conn, "b1", &no_month).expect_err("month").code(), "bad_params");

        let bad_cie = ControlUpdate {
            kind: ControlKind::Cie,
            enabled: true,
            semesters: vec![],
            month: None,
            cie_type: Some("final".into()),
        };
        assert_eq!(set_controls(&conn, "b1", &bad_cie).expect_err("cie").code(), "bad_params");
        assert_eq!(
            set_controls(&conn, "b1", &attendance(true, &[9])).expect_err("sem").code(),
            "bad_params"
        );
        assert_eq!(count_active(&conn, "b1", "attendance"), 0);
    }

    #[test]
    fn staff_admission_rules() {
        let sems = |v: &[i64]| v.iter().copied().collect::<BTreeSet<i64>>();

        assert!(!control_enabled_for_staff(&[], &sems(&[3])));
        assert!(!control_enabled_for_staff(&[], &sems(&[])));
        assert!(control_enabled_for_staff(&[row(Some(5))], &sems(&[])));
        assert!(control_enabled_for_staff(&[row(None)], &sems(&[3])));
        assert!(control_enabled_for_staff(&[row(Some(4)), row(Some(3))], &sems(&[3, 6])));
        assert!(!control_enabled_for_staff(&[row(Some(4)), row(Some(5))], &sems(&[3, 6])));
    }

    #[test]
    fn ensure_entry_open_reports_closed_window() {
        let conn = setup();
        let e = ensure_entry_open(&conn, "b1", ControlKind::Attendance, Some(3)).expect_err("closed");
        assert_eq!(e.code(), "entry_closed");
        assert_eq!(e.to_string(), "Attendance entry disabled");

        set_controls(&conn, "b1", &attendance(true, &[3])).expect("enable");
        assert!(ensure_entry_open(&conn, "b1", ControlKind::Attendance, Some(3)).is_ok());
        assert!(ensure_entry_open(&conn, "b1", ControlKind::Attendance, None).is_ok());
        assert!(ensure_entry_open(&conn, "b1", ControlKind::Attendance, Some(4)).is_err());
        assert!(ensure_entry_open(&conn, "b1", ControlKind::Cie, Some(3)).is_err());
    }

    #[test]
    fn month_and_cie_number_parsing() {
        assert_eq!(normalize_month("3").expect("month"), "03");
        assert_eq!(normalize_month(" 11 ").expect("month"), "11");
        assert!(normalize_month("13").is_err());
        assert!(normalize_month("March").is_err());

        assert_eq!(extract_cie_number("CIE 2"), Some(2));
        assert_eq!(extract_cie_number("cie-12 (retest)"), Some(12));
        assert_eq!(extract_cie_number("final"), None);
    }
}
