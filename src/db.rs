use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "academic.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    seed_roles(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory_db() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    seed_roles(&conn)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS roles(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS branches(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role_id INTEGER NOT NULL,
            branch_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(role_id) REFERENCES roles(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_branch_role ON users(branch_id, role_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            class_name TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            UNIQUE(branch_id, class_name, academic_year),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            batch_name TEXT NOT NULL,
            UNIQUE(class_id, batch_name),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            register_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            batch_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(branch_id) REFERENCES branches(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            subject_code TEXT NOT NULL UNIQUE,
            subject_name TEXT NOT NULL,
            semester INTEGER NOT NULL,
            syllabus_name TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_branch_semester ON subjects(branch_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff_allocations(
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            batch_id TEXT,
            subject_name TEXT NOT NULL,
            allocated_at TEXT NOT NULL,
            FOREIGN KEY(staff_id) REFERENCES users(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_allocations_staff ON staff_allocations(staff_id)",
        [],
    )?;

    // One record per (branch, kind, semester); a NULL semester is the
    // branch-wide record.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS controls(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            control_type TEXT NOT NULL,
            semester INTEGER,
            month TEXT,
            cie_type TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_controls_state
         ON controls(branch_id, control_type, IFNULL(semester, 0))",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            total_classes INTEGER NOT NULL,
            classes_attended INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, subject_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(staff_id) REFERENCES users(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cie_config(
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            cie_number INTEGER NOT NULL,
            max_marks INTEGER NOT NULL,
            UNIQUE(branch_id, cie_number),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cie_marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            cie_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            marks_obtained INTEGER NOT NULL,
            entered_by TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(student_id, cie_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(cie_id) REFERENCES cie_config(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(entered_by) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cie_papers(
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            subject_code TEXT NOT NULL,
            file_path TEXT NOT NULL,
            is_displayed INTEGER NOT NULL DEFAULT 0,
            uploaded_at TEXT NOT NULL,
            FOREIGN KEY(staff_id) REFERENCES users(id),
            FOREIGN KEY(branch_id) REFERENCES branches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS backup_logs(
            id TEXT PRIMARY KEY,
            backup_type TEXT NOT NULL,
            backup_path TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn seed_roles(conn: &Connection) -> anyhow::Result<()> {
    for (id, name) in [(1, "ADMIN"), (2, "HOD"), (3, "STAFF")] {
        conn.execute(
            "INSERT OR IGNORE INTO roles(id, name) VALUES(?, ?)",
            (id, name),
        )?;
    }
    Ok(())
}

pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    // A corrupt value reads as unset rather than failing the caller.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, value.to_string()),
    )?;
    Ok(())
}
