mod common;

use common::{seed_branch, Sidecar};
use serde_json::json;

#[test]
fn export_then_import_restores_workspace_and_clears_session() {
    let mut sc = Sidecar::spawn();
    let fx = seed_branch(&mut sc, "academicd-admin-backup");
    sc.login("admin", "admin-pw");

    let exported = sc.ok("admin.backup.export", json!({}));
    let out = exported["outPath"].as_str().expect("outPath").to_string();
    assert!(out.starts_with(&*fx.workspace.join("backups").to_string_lossy()));
    assert_eq!(exported["bundleFormat"], "academicd-workspace-v1");
    assert!(std::path::Path::new(&out).is_file());

    let listed = sc.ok("admin.backup.list", json!({}));
    assert_eq!(listed["backups"][0]["backupType"], "export");
    assert_eq!(listed["backups"][0]["backupPath"], out.as_str());

    sc.ok("admin.branches.create", json!({ "code": "ece", "name": "Electronics" }));
    let branches = sc.ok("admin.branches.list", json!({}));
    assert_eq!(branches["branches"].as_array().map(|b| b.len()), Some(2));

    let bogus = fx.workspace.join("not-a-backup.zip");
    std::fs::write(&bogus, b"nope").expect("write bogus");
    assert_eq!(
        sc.err_code("admin.backup.import", json!({ "inPath": bogus.to_string_lossy() })),
        "io_failed"
    );
    // A failed import keeps the caller signed in.
    sc.ok("admin.dashboard", json!({}));

    let imported = sc.ok("admin.backup.import", json!({ "inPath": out }));
    assert_eq!(imported["bundleFormatDetected"], "academicd-workspace-v1");
    assert_eq!(imported["sessionCleared"], true);
    assert_eq!(sc.err_code("admin.dashboard", json!({})), "unauthenticated");

    sc.login("admin", "admin-pw");
    let branches = sc.ok("admin.branches.list", json!({}));
    assert_eq!(branches["branches"].as_array().map(|b| b.len()), Some(1));
    assert_eq!(branches["branches"][0]["code"], "CSE");

    let listed = sc.ok("admin.backup.list", json!({}));
    assert_eq!(listed["backups"][0]["backupType"], "import");

    let _ = std::fs::remove_dir_all(fx.workspace);
}
