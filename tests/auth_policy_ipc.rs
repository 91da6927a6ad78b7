mod common;

use common::{seed_branch, temp_dir, Sidecar};
use serde_json::json;

#[test]
fn methods_need_workspace_and_session() {
    let mut sc = Sidecar::spawn();

    let health = sc.ok("health", json!({}));
    assert!(health["workspacePath"].is_null());
    assert_eq!(
        sc.err_code("session.login", json!({ "username": "a", "password": "b" })),
        "no_workspace"
    );

    let ws = temp_dir("academicd-auth-gate");
    sc.ok("workspace.select", json!({ "path": ws.to_string_lossy() }));
    assert_eq!(sc.err_code("admin.dashboard", json!({})), "unauthenticated");
    assert_eq!(sc.err_code("session.whoami", json!({})), "unauthenticated");
    assert_eq!(sc.err_code("grid.get", json!({})), "forbidden");

    sc.ok(
        "setup.bootstrapAdmin",
        json!({ "username": "admin", "password": "pw" }),
    );
    assert_eq!(
        sc.err_code(
            "setup.bootstrapAdmin",
            json!({ "username": "admin2", "password": "pw" })
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code("session.login", json!({ "username": "admin", "password": "wrong" })),
        "bad_params"
    );

    let me = sc.login("admin", "pw");
    assert_eq!(me["role"], "admin");
    assert_eq!(sc.err_code("admin.nope", json!({})), "not_implemented");

    let _ = std::fs::remove_dir_all(ws);
}

#[test]
fn roles_are_confined_to_their_namespace() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-auth-roles");

    sc.login("staff.cse", "staff-pw");
    assert_eq!(sc.err_code("hod.dashboard", json!({})), "forbidden");
    assert_eq!(sc.err_code("admin.users.list", json!({})), "forbidden");
    sc.ok("staff.dashboard", json!({}));
    let me = sc.ok("session.whoami", json!({}));
    assert_eq!(me["role"], "staff");
    assert_eq!(me["branchName"], "Computer Science");
    sc.ok("session.logout", json!({}));

    sc.login("hod.cse", "hod-pw");
    assert_eq!(sc.err_code("staff.dashboard", json!({})), "forbidden");
    assert_eq!(sc.err_code("admin.maintenance.set", json!({ "enabled": true })), "forbidden");
    sc.ok("session.logout", json!({}));
    assert_eq!(sc.err_code("hod.dashboard", json!({})), "unauthenticated");

    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn admin_user_rules() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-auth-users");
    sc.login("admin", "admin-pw");

    assert_eq!(
        sc.err_code(
            "admin.users.create",
            json!({ "username": "hod2", "password": "x", "role": "hod", "branchId": fx.branch_id })
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "admin.users.create",
            json!({ "username": "staff.cse", "password": "x", "role": "staff", "branchId": fx.branch_id })
        ),
        "conflict"
    );
    assert_eq!(
        sc.err_code(
            "admin.users.create",
            json!({ "username": "floating", "password": "x", "role": "staff" })
        ),
        "bad_params"
    );
    assert_eq!(
        sc.err_code("admin.branches.create", json!({ "code": "CSE", "name": "Again" })),
        "conflict"
    );

    assert_eq!(
        sc.err_code("admin.users.delete", json!({ "username": "admin" })),
        "bad_params"
    );
    assert_eq!(
        sc.err_code("admin.users.delete", json!({ "username": "ghost" })),
        "not_found"
    );

    let dash = sc.ok("admin.dashboard", json!({}));
    assert_eq!(dash["hodCount"], 1);
    assert_eq!(dash["staffCount"], 1);
    assert_eq!(dash["studentCount"], 2);
    assert_eq!(dash["branchCount"], 1);

    let deleted = sc.ok("admin.users.delete", json!({ "username": "staff.cse" }));
    assert_eq!(deleted["allocationsRemoved"], 1);
    let dash = sc.ok("admin.dashboard", json!({}));
    assert_eq!(dash["staffCount"], 0);

    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn maintenance_blocks_non_admin_logins() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-auth-maintenance");

    sc.login("admin", "admin-pw");
    assert_eq!(sc.ok("admin.maintenance.get", json!({}))["enabled"], false);
    sc.ok("admin.maintenance.set", json!({ "enabled": true }));
    sc.ok("session.logout", json!({}));

    assert_eq!(
        sc.err_code("session.login", json!({ "username": "staff.cse", "password": "staff-pw" })),
        "maintenance"
    );
    assert_eq!(
        sc.err_code("session.login", json!({ "username": "hod.cse", "password": "hod-pw" })),
        "maintenance"
    );
    sc.login("admin", "admin-pw");
    sc.ok("admin.maintenance.set", json!({ "enabled": false }));
    sc.ok("session.logout", json!({}));
    sc.login("staff.cse", "staff-pw");

    let _ = std::fs::remove_dir_all(fx.workspace);
}
