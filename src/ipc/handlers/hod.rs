use crate::auth::Role;
use crate::control::{self, ControlKind, ControlUpdate};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{
    db, optional_i64, optional_str, required_bool, required_i64, required_str, value_as_i64,
};
use crate::ipc::types::{AppState, Request};
use crate::resolve::{extract_semester_from_class, resolve_subject};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Connection plus the branch the calling HOD manages.
fn scope(state: &AppState) -> AppResult<(&Connection, &str)> {
    let conn = db(state)?;
    let session = state.session.as_ref().ok_or(AppError::Unauthenticated)?;
    Ok((conn, session.branch()?))
}

fn validate_semester(semester: i64) -> AppResult<i64> {
    if (1..=8).contains(&semester) {
        Ok(semester)
    } else {
        Err(AppError::bad_params_with(
            "semester must be between 1 and 8",
            json!({ "semester": semester }),
        ))
    }
}

fn class_in_branch(conn: &Connection, branch_id: &str, class_id: &str) -> AppResult<String> {
    conn.query_row(
        "SELECT class_name FROM classes WHERE id = ? AND branch_id = ?",
        (class_id, branch_id),
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("class not found: {class_id}")))
}

/// The branch class for a semester, latest academic year first.
fn class_for_semester(conn: &Connection, branch_id: &str, semester: i64) -> AppResult<String> {
    let mut stmt = conn.prepare(
        "SELECT id, class_name FROM classes WHERE branch_id = ?
         ORDER BY academic_year DESC, class_name",
    )?;
    let classes = stmt
        .query_map([branch_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    classes
        .into_iter()
        .find(|(_, name)| extract_semester_from_class(name) == Some(semester))
        .map(|(id, _)| id)
        .ok_or_else(|| AppError::NotFound(format!("no class for semester {semester}")))
}

/// Class named by `classId`, or found through `semester`.
fn target_class(conn: &Connection, branch_id: &str, params: &serde_json::Value) -> AppResult<String> {
    if let Some(class_id) = optional_str(params, "classId") {
        class_in_branch(conn, branch_id, &class_id)?;
        return Ok(class_id);
    }
    match optional_i64(params, "semester")? {
        Some(sem) => class_for_semester(conn, branch_id, validate_semester(sem)?),
        None => Err(AppError::bad_params("classId or semester is required")),
    }
}

fn batch_in_class(conn: &Connection, class_id: &str, batch_name: &str) -> AppResult<String> {
    conn.query_row(
        "SELECT id FROM batches WHERE class_id = ? AND batch_name = ?",
        (class_id, batch_name),
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("batch {batch_name} not found for class")))
}

fn dashboard(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let students: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE branch_id = ? AND is_active = 1",
        [branch],
        |r| r.get(0),
    )?;
    let staff: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE branch_id = ? AND role_id = ? AND is_active = 1",
        (branch, Role::Staff.id()),
        |r| r.get(0),
    )?;
    Ok(json!({
        "hodName": state.session.as_ref().map(|s| s.username.as_str()),
        "branchId": branch,
        "studentCount": students,
        "staffCount": staff,
        "attendanceStatus": control::control_status(conn, branch, ControlKind::Attendance)?,
        "cieStatus": control::control_status(conn, branch, ControlKind::Cie)?,
    }))
}

fn classes_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.class_name, c.academic_year,
                (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM classes c
         WHERE c.branch_id = ?
         ORDER BY c.academic_year DESC, c.class_name",
    )?;
    let rows = stmt
        .query_map([branch], |r| {
            let name: String = r.get(1)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semester": extract_semester_from_class(&name),
                "className": name,
                "academicYear": r.get::<_, String>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let class_name = required_str(params, "className")?;
    let academic_year = required_str(params, "academicYear")?;
    let id = db::new_id();
    conn.execute(
        "INSERT INTO classes(id, branch_id, class_name, academic_year) VALUES(?, ?, ?, ?)",
        (&id, branch, &class_name, &academic_year),
    )?;
    Ok(json!({ "classId": id, "semester": extract_semester_from_class(&class_name) }))
}

fn batches_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let class_id = required_str(params, "classId")?;
    let batch_name = required_str(params, "batchName")?.to_ascii_uppercase();
    class_in_branch(conn, branch, &class_id)?;
    let id = db::new_id();
    conn.execute(
        "INSERT INTO batches(id, class_id, batch_name) VALUES(?, ?, ?)",
        (&id, &class_id, &batch_name),
    )?;
    Ok(json!({ "batchId": id, "batchName": batch_name }))
}

fn students_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT s.id, s.register_no, s.name, c.class_name, b.batch_name, s.is_active
         FROM students s
         JOIN classes c ON c.id = s.class_id
         LEFT JOIN batches b ON b.id = s.batch_id
         WHERE s.branch_id = ?
         ORDER BY s.register_no",
    )?;
    let rows = stmt
        .query_map([branch], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "registerNo": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "batchName": r.get::<_, Option<String>>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": rows }))
}

fn students_add(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let register_no = required_str(params, "registerNo")?.to_ascii_uppercase();
    let name = required_str(params, "name")?;
    let class_id = target_class(conn, branch, params)?;
    let batch_id = match optional_str(params, "batchName") {
        Some(b) => Some(batch_in_class(conn, &class_id, &b.to_ascii_uppercase())?),
        None => None,
    };
    let id = db::new_id();
    conn.execute(
        "INSERT INTO students(id, register_no, name, branch_id, class_id, batch_id, is_active)
         VALUES(?, ?, ?, ?, ?, ?, 1)",
        (&id, &register_no, &name, branch, &class_id, &batch_id),
    )?;
    tracing::info!(register_no = %register_no, "student added");
    Ok(json!({ "studentId": id, "classId": class_id, "batchId": batch_id }))
}

fn subjects_list(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let semester = optional_i64(params, "semester")?;
    let mut stmt = conn.prepare(
        "SELECT id, subject_code, subject_name, semester, syllabus_name, is_active
         FROM subjects
         WHERE branch_id = ?1 AND (?2 IS NULL OR semester = ?2)
         ORDER BY semester, subject_code",
    )?;
    let rows = stmt
        .query_map((branch, semester), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "semester": r.get::<_, i64>(3)?,
                "syllabusName": r.get::<_, String>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": rows }))
}

fn subjects_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let code = required_str(params, "code")?.to_ascii_uppercase();
    let name = required_str(params, "name")?;
    let semester = validate_semester(required_i64(params, "semester")?)?;
    let syllabus = optional_str(params, "syllabusName").unwrap_or_default();
    let id = db::new_id();
    conn.execute(
        "INSERT INTO subjects(id, subject_code, subject_name, semester, syllabus_name, branch_id, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (&id, &code, &name, semester, &syllabus, branch, db::now_timestamp()),
    )?;
    Ok(json!({ "subjectId": id, "code": code }))
}

fn staff_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT id, username FROM users
         WHERE branch_id = ? AND role_id = ? AND is_active = 1
         ORDER BY username",
    )?;
    let rows = stmt
        .query_map((branch, Role::Staff.id()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "staff": rows }))
}

fn allocations_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT a.id, c.class_name, a.subject_name, u.username, b.batch_name
         FROM staff_allocations a
         JOIN users u ON u.id = a.staff_id
         JOIN classes c ON c.id = a.class_id
         LEFT JOIN batches b ON b.id = a.batch_id
         WHERE c.branch_id = ?
         ORDER BY c.class_name, a.subject_name, u.username",
    )?;
    let rows = stmt
        .query_map([branch], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "staff": r.get::<_, String>(3)?,
                "batch": r.get::<_, Option<String>>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "allocations": rows }))
}

/// `theory` binds no batch; `lab X` binds batch X.
fn allocation_batch_name(kind: &str) -> AppResult<Option<String>> {
    let lowered = kind.trim().to_ascii_lowercase();
    if lowered == "theory" {
        return Ok(None);
    }
    match lowered.strip_prefix("lab").map(str::trim) {
        Some(batch) if !batch.is_empty() => Ok(Some(batch.to_ascii_uppercase())),
        _ => Err(AppError::bad_params_with(
            "type must be theory or lab <batch>",
            json!({ "type": kind }),
        )),
    }
}

fn allocations_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let staff_id = required_str(params, "staffId")?;
    let subject = required_str(params, "subject")?;
    let kind = optional_str(params, "type").unwrap_or_else(|| "theory".into());

    let staff_ok = conn
        .query_row(
            "SELECT 1 FROM users WHERE id = ? AND branch_id = ? AND role_id = ? AND is_active = 1",
            (&staff_id, branch, Role::Staff.id()),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !staff_ok {
        return Err(AppError::NotFound(format!("staff not found in branch: {staff_id}")));
    }

    let class_id = target_class(conn, branch, params)?;
    let batch_id = match allocation_batch_name(&kind)? {
        Some(name) => Some(batch_in_class(conn, &class_id, &name)?),
        None => None,
    };

    let class_name = class_in_branch(conn, branch, &class_id)?;
    let resolved = match resolve_subject(conn, branch, extract_semester_from_class(&class_name), &subject) {
        Ok(s) => Some(s),
        Err(AppError::UnresolvedSubject(_)) => {
            tracing::warn!(subject = %subject, "allocation subject does not match any subject yet");
            None
        }
        Err(e) => return Err(e),
    };

    let id = db::new_id();
    conn.execute(
        "INSERT INTO staff_allocations(id, staff_id, class_id, batch_id, subject_name, allocated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &staff_id, &class_id, &batch_id, &subject, db::now_timestamp()),
    )?;
    Ok(json!({
        "allocationId": id,
        "classId": class_id,
        "batchId": batch_id,
        "resolvedSubject": resolved,
    }))
}

fn allocations_delete(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let allocation_id = required_str(params, "allocationId")?;
    let removed = conn.execute(
        "DELETE FROM staff_allocations
         WHERE id = ? AND class_id IN (SELECT id FROM classes WHERE branch_id = ?)",
        (&allocation_id, branch),
    )?;
    if removed == 0 {
        return Err(AppError::NotFound(format!("allocation not found: {allocation_id}")));
    }
    Ok(json!({ "deleted": allocation_id }))
}

fn controls_get(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    Ok(json!({
        "attendance": control::control_status(conn, branch, ControlKind::Attendance)?,
        "cie": control::control_status(conn, branch, ControlKind::Cie)?,
    }))
}

fn controls_update(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let kind = ControlKind::parse(&required_str(params, "type")?)?;
    let semesters = match params.get("semesters") {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                value_as_i64(v).ok_or_else(|| {
                    AppError::bad_params_with("semesters must be integers", json!({ "semester": v }))
                })
            })
            .collect::<AppResult<Vec<_>>>()?,
        Some(other) => {
            return Err(AppError::bad_params_with(
                "semesters must be a list",
                json!({ "semesters": other }),
            ))
        }
    };
    let update = ControlUpdate {
        kind,
        enabled: required_bool(params, "enabled")?,
        semesters,
        month: match params.get("month") {
            Some(serde_json::Value::String(m)) => Some(m.clone()),
            Some(v) => value_as_i64(v).map(|m| m.to_string()),
            None => None,
        },
        cie_type: optional_str(params, "cieType"),
    };
    let change = control::set_controls(conn, branch, &update)?;
    Ok(json!({
        "change": change,
        "status": control::control_status(conn, branch, kind)?,
    }))
}

fn cie_config_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT id, cie_number, max_marks FROM cie_config WHERE branch_id = ? ORDER BY cie_number",
    )?;
    let rows = stmt
        .query_map([branch], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "cieNumber": r.get::<_, i64>(1)?,
                "maxMarks": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "configs": rows }))
}

fn cie_config_set(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let cie_number = required_i64(params, "cieNumber")?;
    let max_marks = required_i64(params, "maxMarks")?;
    if cie_number < 1 || max_marks < 1 {
        return Err(AppError::bad_params("cieNumber and maxMarks must be positive"));
    }
    conn.execute(
        "INSERT INTO cie_config(id, branch_id, cie_number, max_marks) VALUES(?, ?, ?, ?)
         ON CONFLICT(branch_id, cie_number) DO UPDATE SET max_marks = excluded.max_marks",
        (db::new_id(), branch, cie_number, max_marks),
    )?;
    Ok(json!({ "cieNumber": cie_number, "maxMarks": max_marks }))
}

fn cie_papers_list(state: &AppState) -> AppResult<serde_json::Value> {
    let (conn, branch) = scope(state)?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.semester, p.subject_code, p.file_path, p.is_displayed, p.uploaded_at, u.username
         FROM cie_papers p
         JOIN users u ON u.id = p.staff_id
         WHERE p.branch_id = ?
         ORDER BY p.uploaded_at DESC",
    )?;
    let rows = stmt
        .query_map([branch], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semester": r.get::<_, i64>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "filePath": r.get::<_, String>(3)?,
                "displayed": r.get::<_, i64>(4)? != 0,
                "uploadedAt": r.get::<_, String>(5)?,
                "staff": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "papers": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    let outcome = match req.method.as_str() {
        "hod.dashboard" => dashboard(state),
        "hod.classes.list" => classes_list(state),
        "hod.classes.create" => classes_create(state, p),
        "hod.batches.create" => batches_create(state, p),
        "hod.students.list" => students_list(state),
        "hod.students.add" => students_add(state, p),
        "hod.subjects.list" => subjects_list(state, p),
        "hod.subjects.create" => subjects_create(state, p),
        "hod.staff.list" => staff_list(state),
        "hod.allocations.list" => allocations_list(state),
        "hod.allocations.create" => allocations_create(state, p),
        "hod.allocations.delete" => allocations_delete(state, p),
        "hod.controls.get" => controls_get(state),
        "hod.controls.update" => controls_update(state, p),
        "hod.cieConfig.list" => cie_config_list(state),
        "hod.cieConfig.set" => cie_config_set(state, p),
        "hod.ciePapers.list" => cie_papers_list(state),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
