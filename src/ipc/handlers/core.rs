use crate::auth::{self, Role};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::ipc::error::{ok, respond};
use crate::ipc::helpers::{db, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

const MAINTENANCE_KEY: &str = "maintenance";

pub(crate) fn maintenance_enabled(conn: &Connection) -> AppResult<bool> {
    Ok(db::settings_get_json(conn, MAINTENANCE_KEY)?
        .and_then(|v| v.get("enabled").and_then(|e| e.as_bool()))
        .unwrap_or(false))
}

pub(crate) fn set_maintenance(conn: &Connection, enabled: bool) -> AppResult<()> {
    db::settings_set_json(conn, MAINTENANCE_KEY, &json!({ "enabled": enabled }))?;
    Ok(())
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

/// Opens (or creates) the workspace database and drops any session tied to
/// the previous one.
pub(crate) fn open_workspace(state: &mut AppState, path: PathBuf) -> AppResult<()> {
    let conn = db::open_db(&path).map_err(|e| AppError::Io(format!("{e:#}")))?;
    tracing::info!(workspace = %path.display(), "workspace opened");
    state.db = Some(conn);
    state.workspace = Some(path);
    state.session = None;
    Ok(())
}

fn workspace_select(state: &mut AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let path = PathBuf::from(required_str(params, "path")?);
    // Release the old handle before opening, the path may be the same file.
    state.db = None;
    open_workspace(state, path.clone())?;
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

fn bootstrap_admin(state: &mut AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let username = required_str(params, "username")?;
    let password = required_str(params, "password")?;
    let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if users > 0 {
        return Err(AppError::Conflict("accounts already exist; log in as an admin".into()));
    }
    let id = db::new_id();
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role_id, branch_id, is_active, created_at)
         VALUES(?, ?, ?, ?, NULL, 1, ?)",
        (
            &id,
            &username,
            auth::hash_password(&password),
            Role::Admin.id(),
            db::now_timestamp(),
        ),
    )?;
    tracing::info!(username = %username, "bootstrap admin created");
    Ok(json!({ "userId": id, "username": username }))
}

fn login(state: &mut AppState, params: &serde_json::Value) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let username = required_str(params, "username")?;
    let password = optional_str(params, "password").unwrap_or_default();

    let session = match auth::authenticate(conn, &username, &password) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(username = %username, "login failed");
            return Err(e);
        }
    };
    if session.role != Role::Admin && maintenance_enabled(conn)? {
        tracing::warn!(username = %username, "login refused during maintenance");
        return Err(AppError::Maintenance);
    }

    let result = session_json(conn, &session)?;
    tracing::info!(username = %username, role = %session.role, "login");
    state.session = Some(session);
    Ok(result)
}

fn session_json(conn: &Connection, s: &auth::Session) -> AppResult<serde_json::Value> {
    let branch_name: Option<String> = match s.branch_id.as_deref() {
        Some(b) => conn
            .query_row("SELECT name FROM branches WHERE id = ?", [b], |r| r.get(0))
            .optional()?,
        None => None,
    };
    Ok(json!({
        "userId": s.user_id,
        "username": s.username,
        "role": s.role.as_str(),
        "branchId": s.branch_id,
        "branchName": branch_name,
    }))
}

fn whoami(state: &mut AppState) -> AppResult<serde_json::Value> {
    let conn = db(state)?;
    let session = state.session.as_ref().ok_or(AppError::Unauthenticated)?;
    session_json(conn, session)
}

fn logout(state: &mut AppState) -> AppResult<serde_json::Value> {
    if let Some(s) = state.session.take() {
        tracing::info!(username = %s.username, "logout");
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let outcome = match req.method.as_str() {
        "health" => return Some(handle_health(state, req)),
        "workspace.select" => workspace_select(state, &req.params),
        "setup.bootstrapAdmin" => bootstrap_admin(state, &req.params),
        "session.login" => login(state, &req.params),
        "session.logout" => logout(state),
        "session.whoami" => whoami(state),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
