use crate::auth::Session;
use crate::control::{self, ControlKind};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{db, required_array, required_i64, required_str, value_as_i64};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, Allocation, RosterStudent};
use crate::resolve::resolve_subject;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

fn scope(state: &AppState) -> AppResult<(&Connection, &Session)> {
    let conn = db(state)?;
    let session = state.session.as_ref().ok_or(AppError::Unauthenticated)?;
    Ok((conn, session))
}

fn allocation(state: &AppState, params: &serde_json::Value) -> AppResult<Allocation> {
    let (conn, session) = scope(state)?;
    let allocation_id = required_str(params, "allocationId")?;
    report::load_allocation(conn, &session.user_id, &allocation_id)
}

fn cie_max_marks(conn: &Connection, branch_id: &str, cie_number: i64) -> AppResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT max_marks FROM cie_config WHERE branch_id = ? AND cie_number = ?",
            (branch_id, cie_number),
            |r| r.get(0),
        )
        .optional()?)
}

fn dashboard(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, session) = scope(state)?;
    let branch = session.branch()?;
    let department: Option<String> = conn
        .query_row("SELECT name FROM branches WHERE id = ?", [branch], |r| r.get(0))
        .optional()?;

    let allocations = report::staff_allocations(conn, &session.user_id)?;
    let semesters: BTreeSet<i64> = allocations.iter().filter_map(Allocation::semester).collect();

    let attendance_controls = control::active_controls(conn, branch, ControlKind::Attendance)?;
    let cie_controls = control::active_controls(conn, branch, ControlKind::Cie)?;
    let attendance_enabled =
        !allocations.is_empty() && control::control_enabled_for_staff(&attendance_controls, &semesters);
    let cie_enabled =
        !allocations.is_empty() && control::control_enabled_for_staff(&cie_controls, &semesters);

    let attendance = control::control_status(conn, branch, ControlKind::Attendance)?;
    let cie = control::control_status(conn, branch, ControlKind::Cie)?;
    let max_marks = match cie.cie_type.as_deref().and_then(control::extract_cie_number) {
        Some(n) => cie_max_marks(conn, branch, n)?,
        None => None,
    };

    let allocation_rows: Vec<serde_json::Value> = allocations
        .iter()
        .map(|a| {
            json!({
                "allocationId": a.id,
                "subjectName": a.subject_name,
                "className": a.class_name,
                "academicYear": a.academic_year,
                "batchName": a.batch_name,
                "semester": a.semester(),
            })
        })
        .collect();

    Ok(json!({
        "staffName": session.username,
        "departmentName": department,
        "allocations": allocation_rows,
        "attendanceEnabled": attendance_enabled,
        "cieEnabled": cie_enabled,
        "attendanceControl": {
            "month": attendance.month,
            "semesters": attendance.semesters,
        },
        "cieControl": {
            "cieType": cie.cie_type,
            "maxMarks": max_marks,
            "semesters": cie.semesters,
        },
    }))
}

fn allocation_students(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let alloc = allocation(state, params)?;
    let roster = report::allocation_roster(db(state)?, &alloc)?;
    Ok(json!({ "allocation": alloc, "students": roster }))
}

/// Pairs each entry's student with its numeric value; entries whose value is
/// null or blank are skipped.
fn parse_entries(
    entries: &[serde_json::Value],
    value_key: &str,
    roster: &[RosterStudent],
) -> AppResult<Vec<(String, i64)>> {
    let known: HashSet<&str> = roster.iter().map(|s| s.id.as_str()).collect();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            return Err(AppError::bad_params_with("entry is missing studentId", entry.clone()));
        };
        let value = match entry.get(value_key) {
            None | Some(serde_json::Value::Null) => continue,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => continue,
            Some(v) => value_as_i64(v).ok_or_else(|| {
                AppError::bad_params_with(
                    format!("{value_key} must be an integer"),
                    json!({ "studentId": student_id }),
                )
            })?,
        };
        if !known.contains(student_id) {
            return Err(AppError::bad_params_with(
                "student is not on this allocation's roster",
                json!({ "studentId": student_id }),
            ));
        }
        out.push((student_id.to_string(), value));
    }
    Ok(out)
}

fn attendance_submit(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, session) = scope(state)?;
    let alloc = allocation(state, params)?;
    let total_classes = required_i64(params, "totalClasses")?;
    let entries = required_array(params, "entries")?;
    if total_classes < 0 {
        return Err(AppError::bad_params("totalClasses must not be negative"));
    }
    if entries.is_empty() {
        return Err(AppError::bad_params("no attendance entries provided"));
    }

    control::ensure_entry_open(conn, &alloc.branch_id, ControlKind::Attendance, alloc.semester())?;
    let subject = resolve_subject(conn, &alloc.branch_id, alloc.semester(), &alloc.subject_name)?;
    let roster = report::allocation_roster(conn, &alloc)?;
    let rows = parse_entries(entries, "classesAttended", &roster)?;
    if let Some((student_id, attended)) = rows.iter().find(|(_, a)| !(0..=total_classes).contains(a)) {
        return Err(AppError::bad_params_with(
            "classesAttended must be between 0 and totalClasses",
            json!({ "studentId": student_id, "classesAttended": attended }),
        ));
    }

    let now = db::now_timestamp();
    let tx = conn.unchecked_transaction()?;
    for (student_id, attended) in &rows {
        tx.execute(
            "INSERT INTO attendance(id, student_id, staff_id, subject_id, total_classes, classes_attended, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, subject_id) DO UPDATE SET
               staff_id = excluded.staff_id,
               total_classes = excluded.total_classes,
               classes_attended = excluded.classes_attended,
               updated_at = excluded.updated_at",
            (
                db::new_id(),
                student_id,
                &session.user_id,
                &subject.id,
                total_classes,
                attended,
                &now,
            ),
        )?;
    }
    tx.commit()?;

    tracing::info!(
        allocation = %alloc.id,
        subject = %subject.code,
        saved = rows.len(),
        skipped = entries.len() - rows.len(),
        "attendance submitted"
    );
    Ok(json!({
        "saved": rows.len(),
        "skipped": entries.len() - rows.len(),
        "subjectCode": subject.code,
    }))
}

fn cie_submit(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, session) = scope(state)?;
    let alloc = allocation(state, params)?;
    let cie_type = required_str(params, "cieType")?;
    let max_marks = required_i64(params, "maxMarks")?;
    let entries = required_array(params, "entries")?;
    if max_marks < 0 {
        return Err(AppError::bad_params_with(
            "maxMarks must not be negative",
            json!({ "maxMarks": max_marks }),
        ));
    }
    if entries.is_empty() {
        return Err(AppError::bad_params("no CIE entries provided"));
    }

    control::ensure_entry_open(conn, &alloc.branch_id, ControlKind::Cie, alloc.semester())?;
    let cie_number = control::extract_cie_number(&cie_type).ok_or_else(|| {
        AppError::bad_params_with("invalid CIE type", json!({ "cieType": cie_type }))
    })?;
    let subject = resolve_subject(conn, &alloc.branch_id, alloc.semester(), &alloc.subject_name)?;
    let roster = report::allocation_roster(conn, &alloc)?;
    let rows = parse_entries(entries, "marksObtained", &roster)?;

    let tx = conn.unchecked_transaction()?;
    let existing: Option<(String, i64)> = tx
        .query_row(
            "SELECT id, max_marks FROM cie_config WHERE branch_id = ? AND cie_number = ?",
            (&alloc.branch_id, cie_number),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (cie_id, effective_max) = match existing {
        Some((id, current)) if max_marks != 0 && max_marks != current => {
            tx.execute("UPDATE cie_config SET max_marks = ? WHERE id = ?", (max_marks, &id))?;
            (id, max_marks)
        }
        Some((id, current)) => (id, current),
        None => {
            if max_marks < 1 {
                return Err(AppError::bad_params("maxMarks must be positive"));
            }
            let id = db::new_id();
            tx.execute(
                "INSERT INTO cie_config(id, branch_id, cie_number, max_marks) VALUES(?, ?, ?, ?)",
                (&id, &alloc.branch_id, cie_number, max_marks),
            )?;
            (id, max_marks)
        }
    };

    if let Some((student_id, marks)) = rows.iter().find(|(_, m)| !(0..=effective_max).contains(m)) {
        return Err(AppError::bad_params_with(
            "marksObtained must be between 0 and maxMarks",
            json!({ "studentId": student_id, "marksObtained": marks, "maxMarks": effective_max }),
        ));
    }

    let now = db::now_timestamp();
    for (student_id, marks) in &rows {
        tx.execute(
            "INSERT INTO cie_marks(id, student_id, cie_id, subject_id, marks_obtained, entered_by, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(student_id, cie_id) DO UPDATE SET
               subject_id = excluded.subject_id,
               marks_obtained = excluded.marks_obtained,
               entered_by = excluded.entered_by,
               updated_at = excluded.updated_at",
            (
                db::new_id(),
                student_id,
                &cie_id,
                &subject.id,
                marks,
                &session.user_id,
                &now,
            ),
        )?;
    }
    tx.commit()?;

    tracing::info!(
        allocation = %alloc.id,
        subject = %subject.code,
        cie = cie_number,
        saved = rows.len(),
        "CIE marks submitted"
    );
    Ok(json!({
        "saved": rows.len(),
        "skipped": entries.len() - rows.len(),
        "cieNumber": cie_number,
        "maxMarks": effective_max,
        "subjectCode": subject.code,
    }))
}

/// Runs of non-alphanumerics become `_`, trimmed at both ends.
fn safe_file_part(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn paper_file_name(semester: i64, subject: &str, academic_year: &str) -> String {
    let subject = safe_file_part(subject);
    match safe_file_part(academic_year) {
        year if year.is_empty() => format!("{semester}_{subject}.pdf"),
        year => format!("{semester}_{subject}_{year}.pdf"),
    }
}

fn cie_papers_register(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, session) = scope(state)?;
    let workspace = state.workspace.as_ref().ok_or(AppError::NoWorkspace)?;
    let alloc = allocation(state, params)?;
    let source = PathBuf::from(required_str(params, "filePath")?);

    let is_pdf = source
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if !is_pdf {
        return Err(AppError::bad_params("only PDF files are allowed"));
    }
    if !source.is_file() {
        return Err(AppError::NotFound(format!("file not found: {}", source.display())));
    }
    let semester = alloc
        .semester()
        .ok_or_else(|| AppError::bad_params("unable to determine semester"))?;
    let subject = resolve_subject(conn, &alloc.branch_id, Some(semester), &alloc.subject_name)?;

    let subject_label = if subject.name.trim().is_empty() {
        subject.code.as_str()
    } else {
        subject.name.as_str()
    };
    let dir = state
        .settings
        .uploads_dir(workspace)
        .join("cie_papers")
        .join(format!("semester_{semester}"));
    let dest = dir.join(paper_file_name(semester, subject_label, &alloc.academic_year));
    copy_into(&source, &dir, &dest)?;

    let id = db::new_id();
    conn.execute(
        "INSERT INTO cie_papers(id, staff_id, branch_id, semester, subject_code, file_path, is_displayed, uploaded_at)
         VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
        (
            &id,
            &session.user_id,
            &alloc.branch_id,
            semester,
            &subject.code,
            dest.to_string_lossy(),
            db::now_timestamp(),
        ),
    )?;
    tracing::info!(path = %dest.display(), subject = %subject.code, "CIE paper stored");
    Ok(json!({ "paperId": id, "filePath": dest.to_string_lossy() }))
}

fn copy_into(source: &Path, dir: &Path, dest: &Path) -> AppResult<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::Io(format!("failed to create {}: {e}", dir.display())))?;
    std::fs::copy(source, dest)
        .map_err(|e| AppError::Io(format!("failed to store {}: {e}", dest.display())))?;
    Ok(())
}

fn report_data(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let alloc = allocation(state, params)?;
    let report = report::staff_report(db(state)?, &alloc, &state.settings.thresholds)?;
    Ok(json!(report))
}

fn report_export(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let alloc = allocation(state, params)?;
    let out = PathBuf::from(required_str(params, "outPath")?);
    let report = report::staff_report(db(state)?, &alloc, &state.settings.thresholds)?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| AppError::Io(e.to_string()))?;
    }
    let file = std::fs::File::create(&out)
        .map_err(|e| AppError::Io(format!("failed to create {}: {e}", out.display())))?;
    report::write_csv(&report.rows, file)?;
    Ok(json!({ "rowCount": report.rows.len(), "outPath": out.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    let outcome = match req.method.as_str() {
        "staff.dashboard" => dashboard(state),
        "staff.allocation.students" => allocation_students(state, p),
        "staff.attendance.submit" => attendance_submit(state, p),
        "staff.cie.submit" => cie_submit(state, p),
        "staff.ciePapers.register" => cie_papers_register(state, p),
        "staff.report.data" => report_data(state, p),
        "staff.report.export" => report_export(state, p),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
