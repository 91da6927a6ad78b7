#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    pub fn spawn() -> Self {
        let exe = env!("CARGO_BIN_EXE_academicd");
        let mut child = Command::new(exe)
            .env("ACADEMICD_CONFIG", "academicd-test-does-not-exist.toml")
            .env_remove("ACADEMICD_WORKSPACE__PATH")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn academicd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    /// Sends one request and returns the whole response envelope.
    pub fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        assert!(!line.trim().is_empty(), "empty response for {}", method);
        let value: serde_json::Value =
            serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    /// Sends a request that must succeed and returns its result.
    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.call(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
        resp["result"].clone()
    }

    /// Sends a request that must fail and returns the error code.
    pub fn err_code(&mut self, method: &str, params: serde_json::Value) -> String {
        let resp = self.call(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        resp["error"]["code"].as_str().unwrap_or("missing").to_string()
    }

    pub fn login(&mut self, username: &str, password: &str) -> serde_json::Value {
        self.ok(
            "session.login",
            json!({ "username": username, "password": password }),
        )
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub struct Fixture {
    pub workspace: PathBuf,
    pub branch_id: String,
    pub staff_id: String,
    pub class_id: String,
    pub allocation_id: String,
    pub students: Vec<String>,
}

impl Fixture {
    pub fn db_path(&self) -> PathBuf {
        self.workspace.join("academic.sqlite3")
    }
}

pub fn open_db(workspace: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(workspace.join("academic.sqlite3")).expect("open sqlite")
}

/// Builds a CSE branch with an HOD, one staff member, a "Semester 3" class
/// with two students (one in batch A) and a DBMS theory allocation. Leaves
/// the sidecar logged out.
pub fn seed_branch(sc: &mut Sidecar, prefix: &str) -> Fixture {
    let workspace = temp_dir(prefix);
    sc.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    sc.ok(
        "setup.bootstrapAdmin",
        json!({ "username": "admin", "password": "admin-pw" }),
    );
    sc.login("admin", "admin-pw");
    let branch = sc.ok(
        "admin.branches.create",
        json!({ "code": "cse", "name": "Computer Science" }),
    );
    let branch_id = branch["branchId"].as_str().expect("branch id").to_string();
    sc.ok(
        "admin.users.create",
        json!({ "username": "hod.cse", "password": "hod-pw", "role": "hod", "branchId": branch_id }),
    );
    let staff = sc.ok(
        "admin.users.create",
        json!({ "username": "staff.cse", "password": "staff-pw", "role": "staff", "branchId": branch_id }),
    );
    let staff_id = staff["userId"].as_str().expect("staff id").to_string();
    sc.ok("session.logout", json!({}));

    sc.login("hod.cse", "hod-pw");
    let class = sc.ok(
        "hod.classes.create",
        json!({ "className": "Semester 3", "academicYear": "2024-25" }),
    );
    let class_id = class["classId"].as_str().expect("class id").to_string();
    sc.ok(
        "hod.batches.create",
        json!({ "classId": class_id, "batchName": "A" }),
    );
    sc.ok(
        "hod.subjects.create",
        json!({ "code": "DBMS", "name": "Database Management Systems", "semester": 3 }),
    );
    sc.ok(
        "hod.subjects.create",
        json!({ "code": "20CS32", "name": "Data Structures", "semester": 3 }),
    );
    let mut students = Vec::new();
    for (reg, name, batch) in [("1cs001", "Asha", Some("A")), ("1cs002", "Bala", None)] {
        let added = sc.ok(
            "hod.students.add",
            json!({ "registerNo": reg, "name": name, "semester": 3, "batchName": batch }),
        );
        students.push(added["studentId"].as_str().expect("student id").to_string());
    }
    let alloc = sc.ok(
        "hod.allocations.create",
        json!({ "staffId": staff_id, "semester": 3, "subject": "DBMS - Semester 3", "type": "theory" }),
    );
    let allocation_id = alloc["allocationId"].as_str().expect("allocation id").to_string();
    sc.ok("session.logout", json!({}));

    Fixture {
        workspace,
        branch_id,
        staff_id,
        class_id,
        allocation_id,
        students,
    }
}
