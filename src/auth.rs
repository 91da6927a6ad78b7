use crate::error::{AppError, AppResult};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Hod,
    Staff,
}

impl Role {
    pub fn id(self) -> i64 {
        match self {
            Role::Admin => 1,
            Role::Hod => 2,
            Role::Staff => 3,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Role::Admin),
            2 => Some(Role::Hod),
            3 => Some(Role::Staff),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "hod" => Some(Role::Hod),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Hod => "hod",
            Role::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logged-in user for the lifetime of the sidecar process.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub branch_id: Option<String>,
}

impl Session {
    /// Branch the HOD/staff handlers are scoped to.
    pub fn branch(&self) -> AppResult<&str> {
        self.branch_id
            .as_deref()
            .ok_or_else(|| AppError::Forbidden("account is not assigned to a branch".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    Role(Role),
    Denied,
}

pub fn required_access(method: &str) -> Access {
    match method {
        "health" | "workspace.select" | "setup.bootstrapAdmin" | "session.login" => Access::Public,
        _ => match method.split_once('.').map(|(ns, _)| ns) {
            Some("session") => Access::Authenticated,
            Some("admin") => Access::Role(Role::Admin),
            Some("hod") => Access::Role(Role::Hod),
            Some("staff") => Access::Role(Role::Staff),
            _ => Access::Denied,
        },
    }
}

pub fn authorize(method: &str, session: Option<&Session>) -> AppResult<()> {
    match required_access(method) {
        Access::Public => Ok(()),
        Access::Denied => Err(AppError::Forbidden(format!("method {method} is not available"))),
        Access::Authenticated => session.map(|_| ()).ok_or(AppError::Unauthenticated),
        Access::Role(role) => {
            let s = session.ok_or(AppError::Unauthenticated)?;
            if s.role == role {
                Ok(())
            } else {
                Err(AppError::Forbidden(format!(
                    "{} access required",
                    role.as_str().to_uppercase()
                )))
            }
        }
    }
}

const HASH_SCHEME: &str = "sha256";

pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    format!("{HASH_SCHEME}${salt}${}", digest_hex(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_SCHEME), Some(salt), Some(hex)) => digest_hex(salt, password) == hex,
        _ => false,
    }
}

fn digest_hex(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Looks the user up and checks the password and active flag.
pub fn authenticate(conn: &Connection, username: &str, password: &str) -> AppResult<Session> {
    let row: Option<(String, String, i64, Option<String>, bool)> = conn
        .query_row(
            "SELECT id, password_hash, role_id, branch_id, is_active FROM users WHERE username = ?",
            [username],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get::<_, i64>(4)? != 0,
                ))
            },
        )
        .optional()?;

    let invalid = || AppError::bad_params("invalid username or password");
    let Some((user_id, hash, role_id, branch_id, active)) = row else {
        return Err(invalid());
    };
    if !active || !verify_password(password, &hash) {
        return Err(invalid());
    }
    let role = Role::from_id(role_id)
        .ok_or_else(|| AppError::Forbidden(format!("unauthorized role {role_id}")))?;

    Ok(Session {
        user_id,
        username: username.to_string(),
        role,
        branch_id,
    })
}
