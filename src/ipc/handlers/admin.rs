use crate::auth::{self, Role};
use crate::backup;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::error::respond;
use crate::ipc::helpers::{db, optional_str, required_bool, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, ReportFormat, ReportQuery, ReportType};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

use super::core::{maintenance_enabled, open_workspace, set_maintenance};

fn list_users(conn: &Connection) -> AppResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.role_id, u.branch_id, b.name, u.is_active, u.created_at
         FROM users u
         LEFT JOIN branches b ON b.id = u.branch_id
         ORDER BY u.role_id, u.username",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let role_id: i64 = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "role": Role::from_id(role_id).map(Role::as_str),
                "branchId": r.get::<_, Option<String>>(3)?,
                "branchName": r.get::<_, Option<String>>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn count(conn: &Connection, sql: &str) -> AppResult<i64> {
    Ok(conn.query_row(sql, [], |r| r.get(0))?)
}

fn dashboard(state: &AppState) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let role_count = |role: Role| -> AppResult<i64> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role_id = ?",
            [role.id()],
            |r| r.get(0),
        )?)
    };
    Ok(json!({
        "users": list_users(conn)?,
        "hodCount": role_count(Role::Hod)?,
        "staffCount": role_count(Role::Staff)?,
        "studentCount": count(conn, "SELECT COUNT(*) FROM students")?,
        "branchCount": count(conn, "SELECT COUNT(*) FROM branches")?,
    }))
}

fn branch_rows(conn: &Connection) -> AppResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare("SELECT id, code, name FROM branches ORDER BY code")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn branches_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let code = required_str(params, "code")?.to_ascii_uppercase();
    let name = required_str(params, "name")?;
    let id = db::new_id();
    conn.execute(
        "INSERT INTO branches(id, code, name) VALUES(?, ?, ?)",
        (&id, &code, &name),
    )?;
    tracing::info!(code = %code, "branch created");
    Ok(json!({ "branchId": id, "code": code, "name": name }))
}

fn users_create(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let username = required_str(params, "username")?;
    let password = required_str(params, "password")?;
    let role_raw = required_str(params, "role")?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        AppError::bad_params_with(
            "role must be one of: admin, hod, staff",
            json!({ "role": role_raw }),
        )
    })?;
    let branch_id = optional_str(params, "branchId");

    if let Some(b) = branch_id.as_deref() {
        let exists = conn
            .query_row("SELECT 1 FROM branches WHERE id = ?", [b], |r| r.get::<_, i64>(0))
            .optional()?
            .is_some();
        if !exists {
            return Err(AppError::NotFound(format!("branch not found: {b}")));
        }
    } else if role != Role::Admin {
        return Err(AppError::bad_params(format!(
            "branchId is required for {} accounts",
            role.as_str().to_uppercase()
        )));
    }

    if role == Role::Hod {
        let existing: Option<String> = conn
            .query_row(
                "SELECT username FROM users WHERE branch_id = ? AND role_id = ? AND is_active = 1",
                (&branch_id, Role::Hod.id()),
                |r| r.get(0),
            )
            .optional()?;
        if let Some(holder) = existing {
            return Err(AppError::Conflict(format!(
                "an HOD for this branch already exists ({holder})"
            )));
        }
    }

    let id = db::new_id();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role_id, branch_id, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &id,
            &username,
            auth::hash_password(&password),
            role.id(),
            &branch_id,
            db::now_timestamp(),
        ),
    )?;
    tracing::info!(username = %username, role = %role, "user created");
    Ok(json!({ "userId": id, "username": username, "role": role.as_str() }))
}

fn users_delete(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let username = required_str(params, "username")?;
    if state
        .session
        .as_ref()
        .is_some_and(|s| s.username == username)
    {
        return Err(AppError::bad_params("you cannot delete your own admin account"));
    }
    let user_id: String = conn
        .query_row("SELECT id FROM users WHERE username = ?", [&username], |r| r.get(0))
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("user not found: {username}")))?;

    let tx = conn.unchecked_transaction()?;
    let allocations = tx.execute("DELETE FROM staff_allocations WHERE staff_id = ?", [&user_id])?;
    tx.execute("DELETE FROM users WHERE id = ?", [&user_id])?;
    tx.commit()?;
    tracing::info!(username = %username, allocations, "user deleted");
    Ok(json!({ "deleted": username, "allocationsRemoved": allocations }))
}

fn maintenance_get(state: &AppState) -> AppResult<serde_json::Value> {
    Ok(json!({ "enabled": maintenance_enabled(db(state)?)? }))
}

fn maintenance_set(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let enabled = required_bool(params, "enabled")?;
    set_maintenance(db(state)?, enabled)?;
    tracing::info!(enabled, "maintenance mode changed");
    Ok(json!({ "enabled": enabled }))
}

fn report_options(state: &AppState) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let strings = |sql: &str| -> AppResult<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    };
    let years = strings("SELECT DISTINCT academic_year FROM classes ORDER BY academic_year DESC")?;
    let semesters = strings("SELECT DISTINCT class_name FROM classes ORDER BY class_name")?;
    Ok(json!({
        "years": years,
        "branches": branch_rows(conn)?,
        "semesters": semesters,
    }))
}

fn reports_generate(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let query = ReportQuery {
        report_type: ReportType::parse(&required_str(params, "reportType")?)?,
        academic_year: required_str(params, "year")?,
        branch_id: required_str(params, "branchId")?,
        semester: required_str(params, "semester")?,
    };
    let format = ReportFormat::parse(&optional_str(params, "format").unwrap_or_else(|| "json".into()))?;

    let report = report::branch_report(conn, &query, &state.settings.thresholds)?;
    let row_count = report.len();
    match format {
        ReportFormat::Json => Ok(json!({ "rowCount": row_count, "rows": report.to_json() })),
        ReportFormat::Csv => match optional_str(params, "outPath").map(PathBuf::from) {
            Some(out) => {
                if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| AppError::Io(e.to_string()))?;
                }
                let file = std::fs::File::create(&out)
                    .map_err(|e| AppError::Io(format!("failed to create {}: {e}", out.display())))?;
                report.write_csv(file)?;
                Ok(json!({ "rowCount": row_count, "outPath": out.to_string_lossy() }))
            }
            None => {
                let mut buf = Vec::new();
                report.write_csv(&mut buf)?;
                Ok(json!({
                    "rowCount": row_count,
                    "csv": String::from_utf8_lossy(&buf),
                }))
            }
        },
    }
}

fn log_backup(conn: &Connection, kind: &str, path: &std::path::Path) -> AppResult<()> {
    conn.execute(
        "INSERT INTO backup_logs(id, backup_type, backup_path, created_at) VALUES(?, ?, ?, ?)",
        (db::new_id(), kind, path.to_string_lossy(), db::now_timestamp()),
    )?;
    Ok(())
}

fn backup_export(state: &AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let workspace = state.workspace.as_ref().ok_or(AppError::NoWorkspace)?;
    let now = chrono::Local::now();
    let out = match optional_str(params, "outPath") {
        Some(p) => PathBuf::from(p),
        None => state
            .settings
            .backup_dir(workspace)
            .join(format!("Backup_{}.zip", now.format("%Y-%m-%d_%H-%M-%S"))),
    };
    let summary = backup::export_workspace_bundle(workspace, &out, &now.to_rfc3339())
        .map_err(|e| AppError::Io(format!("{e:#}")))?;
    log_backup(conn, "export", &out)?;
    tracing::info!(path = %out.display(), bytes = summary.db_bytes, "backup exported");
    Ok(json!({
        "outPath": out.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "sha256": summary.db_sha256,
    }))
}

fn backup_import(state: &mut AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let in_path = PathBuf::from(required_str(params, "inPath")?);
    let workspace = state.workspace.clone().ok_or(AppError::NoWorkspace)?;

    let session = state.session.take();
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace);
    let reopened = open_workspace(state, workspace);
    let summary = match imported {
        Ok(s) => s,
        Err(e) => {
            // Old database untouched; keep the caller signed in.
            state.session = session;
            if let Err(reopen) = reopened {
                tracing::error!(error = %reopen, "workspace could not be reopened after a failed import");
            }
            return Err(AppError::Io(format!("{e:#}")));
        }
    };
    reopened?;

    log_backup(db(state)?, "import", &in_path)?;
    tracing::info!(path = %in_path.display(), format = %summary.bundle_format_detected, "backup imported");
    Ok(json!({
        "bundleFormatDetected": summary.bundle_format_detected,
        "sessionCleared": true,
    }))
}

fn backup_list(state: &AppState) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let mut stmt = conn.prepare(
        "SELECT id, backup_type, backup_path, created_at FROM backup_logs
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "backupType": r.get::<_, String>(1)?,
                "backupPath": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "backups": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let p = &req.params;
    let outcome = match req.method.as_str() {
        "admin.dashboard" => dashboard(state),
        "admin.branches.list" => db(state)
            .and_then(branch_rows)
            .map(|branches| json!({ "branches": branches })),
        "admin.branches.create" => branches_create(state, p),
        "admin.users.list" => db(state)
            .and_then(list_users)
            .map(|users| json!({ "users": users })),
        "admin.users.create" => users_create(state, p),
        "admin.users.delete" => users_delete(state, p),
        "admin.maintenance.get" => maintenance_get(state),
        "admin.maintenance.set" => maintenance_set(state, p),
        "admin.reports.options" => report_options(state),
        "admin.reports.generate" => reports_generate(state, p),
        "admin.backup.export" => backup_export(state, p),
        "admin.backup.import" => backup_import(state, p),
        "admin.backup.list" => backup_list(state),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
