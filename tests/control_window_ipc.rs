mod common;

use common::{open_db, seed_branch, Sidecar};
use serde_json::json;

fn active_semesters(fx: &common::Fixture, kind: &str) -> Vec<Option<i64>> {
    let conn = open_db(&fx.workspace);
    let mut stmt = conn
        .prepare(
            "SELECT semester FROM controls
             WHERE branch_id = ? AND control_type = ? AND is_active = 1
             ORDER BY IFNULL(semester, 0)",
        )
        .expect("prepare");
    stmt.query_map((&fx.branch_id, kind), |r| r.get(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
}

#[test]
fn disabling_attendance_closes_every_semester() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-controls-disable");
    sc.login("hod.cse", "hod-pw");

    let opened = sc.ok(
        "hod.controls.update",
        json!({ "type": "attendance", "enabled": true, "semesters": [3, 4], "month": "10" }),
    );
    assert_eq!(opened["status"]["enabled"], true);
    assert_eq!(opened["status"]["semesters"], json!([3, 4]));
    assert_eq!(opened["status"]["month"], "10");
    sc.ok(
        "hod.controls.update",
        json!({ "type": "cie", "enabled": true, "semesters": [3], "cieType": "CIE 1" }),
    );
    assert_eq!(active_semesters(&fx, "attendance"), vec![Some(3), Some(4)]);

    let closed = sc.ok(
        "hod.controls.update",
        json!({ "type": "attendance", "enabled": false }),
    );
    assert_eq!(closed["change"]["deactivated"], 2);
    assert!(active_semesters(&fx, "attendance").is_empty());
    assert_eq!(active_semesters(&fx, "cie"), vec![Some(3)]);

    let status = sc.ok("hod.controls.get", json!({}));
    assert_eq!(status["attendance"]["enabled"], false);
    assert_eq!(status["cie"]["cieType"], "CIE 1");

    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn staff_dashboard_follows_the_window() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-controls-staff");

    sc.login("hod.cse", "hod-pw");
    sc.ok(
        "hod.controls.update",
        json!({ "type": "attendance", "enabled": true, "semesters": [5], "month": 9 }),
    );
    sc.ok("session.logout", json!({}));

    sc.login("staff.cse", "staff-pw");
    let dash = sc.ok("staff.dashboard", json!({}));
    assert_eq!(dash["allocations"][0]["semester"], 3);
    assert_eq!(dash["attendanceEnabled"], false);
    assert_eq!(dash["cieEnabled"], false);
    sc.ok("session.logout", json!({}));

    sc.login("hod.cse", "hod-pw");
    sc.ok(
        "hod.controls.update",
        json!({ "type": "attendance", "enabled": true, "semesters": [], "month": 9 }),
    );
    assert_eq!(active_semesters(&fx, "attendance"), vec![None]);
    sc.ok("session.logout", json!({}));

    sc.login("staff.cse", "staff-pw");
    let dash = sc.ok("staff.dashboard", json!({}));
    assert_eq!(dash["attendanceEnabled"], true);
    assert_eq!(dash["attendanceControl"]["month"], "09");

    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn invalid_toggles_are_rejected() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-controls-invalid");
    sc.login("hod.cse", "hod-pw");

    assert_eq!(
        sc.err_code("hod.controls.update", json!({ "type": "exam", "enabled": true })),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "hod.controls.update",
            json!({ "type": "attendance", "enabled": true, "semesters": [3] })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code(
            "hod.controls.update",
            json!({ "type": "cie", "enabled": true, "cieType": "mid term" })
        ),
        "bad_params"
    );
    assert!(active_semesters(&fx, "attendance").is_empty());
    assert!(active_semesters(&fx, "cie").is_empty());

    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn hod_dashboard_counts_only_active_students() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-controls-dashboard");
    open_db(&fx.workspace)
        .execute("UPDATE students SET is_active = 0 WHERE id = ?", [&fx.students[1]])
        .expect("deactivate student");

    sc.login("hod.cse", "hod-pw");
    let dash = sc.ok("hod.dashboard", json!({}));
    assert_eq!(dash["studentCount"], 1);
    assert_eq!(dash["staffCount"], 1);
    assert_eq!(dash["attendanceStatus"]["enabled"], false);

    let _ = std::fs::remove_dir_all(fx.workspace);
}
