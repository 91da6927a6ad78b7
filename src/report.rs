//! Attendance and CIE report rows for a branch or a single allocation.

use crate::error::{AppError, AppResult};
use crate::resolve::{extract_semester_from_class, resolve_subject, SubjectRow};
use crate::settings::Thresholds;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::io::Write;

pub fn ratio_percent(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    100.0 * part as f64 / whole as f64
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

pub fn attendance_status(percent: f64, t: &Thresholds) -> &'static str {
    if percent >= t.attendance_good_percent {
        "Good"
    } else {
        "Shortage"
    }
}

pub fn cie_status(percent: f64, t: &Thresholds) -> &'static str {
    if percent >= t.cie_pass_percent {
        "Pass"
    } else {
        "Fail"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Attendance,
    Cie,
}

impl ReportType {
    pub fn parse(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attendance" => Ok(ReportType::Attendance),
            "cie" => Ok(ReportType::Cie),
            other => Err(AppError::bad_params_with(
                "reportType must be one of: attendance, cie",
                json!({ "reportType": other }),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
}

impl ReportFormat {
    pub fn parse(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "excel" | "xlsx" | "pdf" => Err(AppError::Unsupported(format!(
                "{s} export is not available; use csv"
            ))),
            other => Err(AppError::bad_params_with(
                "format must be one of: json, csv",
                json!({ "format": other }),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportQuery {
    pub report_type: ReportType,
    pub academic_year: String,
    pub branch_id: String,
    /// Class label as shown in the options list, e.g. `"Semester 3"` or `"3"`.
    pub semester: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    pub class_name: String,
}

/// Rows that can be written as a CSV record.
pub trait CsvRow {
    const HEADERS: &'static [&'static str];
    fn fields(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReportRow {
    pub register_no: String,
    pub name: String,
    pub subject_code: String,
    pub subject_name: String,
    pub total_classes: i64,
    pub classes_attended: i64,
    pub percentage: f64,
    pub status: &'static str,
}

impl CsvRow for AttendanceReportRow {
    const HEADERS: &'static [&'static str] = &[
        "Register No",
        "Name",
        "Subject Code",
        "Subject Name",
        "Total Classes",
        "Attended",
        "Percentage",
        "Status",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.register_no.clone(),
            self.name.clone(),
            self.subject_code.clone(),
            self.subject_name.clone(),
            self.total_classes.to_string(),
            self.classes_attended.to_string(),
            format!("{:.2}", self.percentage),
            self.status.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CieReportRow {
    pub register_no: String,
    pub name: String,
    pub subject_code: String,
    pub subject_name: String,
    pub cie_number: i64,
    pub marks: i64,
    pub max_marks: i64,
    pub percentage: f64,
    pub status: &'static str,
}

impl CsvRow for CieReportRow {
    const HEADERS: &'static [&'static str] = &[
        "Register No",
        "Name",
        "Subject Code",
        "Subject Name",
        "CIE",
        "Marks",
        "Max Marks",
        "Percentage",
        "Status",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.register_no.clone(),
            self.name.clone(),
            self.subject_code.clone(),
            self.subject_name.clone(),
            self.cie_number.to_string(),
            self.marks.to_string(),
            self.max_marks.to_string(),
            format!("{:.2}", self.percentage),
            self.status.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffReportRow {
    pub student_id: String,
    pub register_no: String,
    pub name: String,
    pub total_classes: i64,
    pub classes_attended: i64,
    pub attendance_percentage: f64,
    pub attendance_status: &'static str,
    pub cie_total: i64,
    pub cie_max: i64,
    pub cie_percentage: f64,
    pub cie_status: &'static str,
}

impl CsvRow for StaffReportRow {
    const HEADERS: &'static [&'static str] = &[
        "Register No",
        "Name",
        "Total Classes",
        "Attended",
        "Attendance %",
        "Attendance Status",
        "CIE Total",
        "CIE Max",
        "CIE %",
        "CIE Status",
    ];

    fn fields(&self) -> Vec<String> {
        vec![
            self.register_no.clone(),
            self.name.clone(),
            self.total_classes.to_string(),
            self.classes_attended.to_string(),
            format!("{:.2}", self.attendance_percentage),
            self.attendance_status.to_string(),
            self.cie_total.to_string(),
            self.cie_max.to_string(),
            format!("{:.2}", self.cie_percentage),
            self.cie_status.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BranchReport {
    Attendance(Vec<AttendanceReportRow>),
    Cie(Vec<CieReportRow>),
}

impl BranchReport {
    pub fn len(&self) -> usize {
        match self {
            BranchReport::Attendance(rows) => rows.len(),
            BranchReport::Cie(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BranchReport::Attendance(rows) => json!(rows),
            BranchReport::Cie(rows) => json!(rows),
        }
    }

    pub fn write_csv<W: Write>(&self, out: W) -> anyhow::Result<()> {
        match self {
            BranchReport::Attendance(rows) => write_csv(rows, out),
            BranchReport::Cie(rows) => write_csv(rows, out),
        }
    }
}

pub fn write_csv<R: CsvRow, W: Write>(rows: &[R], out: W) -> anyhow::Result<()> {
    let mut w = csv::Writer::from_writer(out);
    w.write_record(R::HEADERS)?;
    for row in rows {
        w.write_record(row.fields())?;
    }
    w.flush()?;
    Ok(())
}

/// Classes of the branch and year whose name is the requested label, or
/// whose semester matches the label's semester.
pub fn resolve_class_set(
    conn: &Connection,
    branch_id: &str,
    academic_year: &str,
    semester: &str,
) -> AppResult<Vec<ClassRef>> {
    let label = semester.trim();
    let wanted = extract_semester_from_class(label);
    let mut stmt = conn.prepare(
        "SELECT id, class_name FROM classes
         WHERE branch_id = ? AND academic_year = ?
         ORDER BY class_name",
    )?;
    let classes = stmt
        .query_map((branch_id, academic_year), |r| {
            Ok(ClassRef {
                id: r.get(0)?,
                class_name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(classes
        .into_iter()
        .filter(|c| {
            c.class_name.eq_ignore_ascii_case(label)
                || (wanted.is_some() && extract_semester_from_class(&c.class_name) == wanted)
        })
        .collect())
}

pub fn branch_report(conn: &Connection, q: &ReportQuery, t: &Thresholds) -> AppResult<BranchReport> {
    let classes = resolve_class_set(conn, &q.branch_id, &q.academic_year, &q.semester)?;
    if classes.is_empty() {
        return Err(AppError::NotFound(format!(
            "No classes found for {} in {}.",
            q.semester, q.academic_year
        )));
    }
    let placeholders = vec!["?"; classes.len()].join(", ");
    let class_ids = classes.iter().map(|c| c.id.as_str());

    let report = match q.report_type {
        ReportType::Attendance => {
            let sql = format!(
                "SELECT s.register_no, s.name, sub.subject_code, sub.subject_name,
                        a.total_classes, a.classes_attended
                 FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 JOIN subjects sub ON sub.id = a.subject_id
                 WHERE s.class_id IN ({placeholders})
                 ORDER BY s.register_no, sub.subject_code"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(class_ids), |r| {
                    let total: i64 = r.get(4)?;
                    let attended: i64 = r.get(5)?;
                    let pct = ratio_percent(attended, total);
                    Ok(AttendanceReportRow {
                        register_no: r.get(0)?,
                        name: r.get(1)?,
                        subject_code: r.get(2)?,
                        subject_name: r.get(3)?,
                        total_classes: total,
                        classes_attended: attended,
                        percentage: round2(pct),
                        status: attendance_status(pct, t),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            BranchReport::Attendance(rows)
        }
        ReportType::Cie => {
            let sql = format!(
                "SELECT s.register_no, s.name, sub.subject_code, sub.subject_name,
                        c.cie_number, m.marks_obtained, c.max_marks
                 FROM cie_marks m
                 JOIN students s ON s.id = m.student_id
                 JOIN subjects sub ON sub.id = m.subject_id
                 JOIN cie_config c ON c.id = m.cie_id
                 WHERE s.class_id IN ({placeholders})
                 ORDER BY s.register_no, sub.subject_code, c.cie_number"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(class_ids), |r| {
                    let marks: i64 = r.get(5)?;
                    let max: i64 = r.get(6)?;
                    let pct = ratio_percent(marks, max);
                    Ok(CieReportRow {
                        register_no: r.get(0)?,
                        name: r.get(1)?,
                        subject_code: r.get(2)?,
                        subject_name: r.get(3)?,
                        cie_number: r.get(4)?,
                        marks,
                        max_marks: max,
                        percentage: round2(pct),
                        status: cie_status(pct, t),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            BranchReport::Cie(rows)
        }
    };

    if report.is_empty() {
        return Err(AppError::NotFound("No data found for this report.".into()));
    }
    Ok(report)
}

/// A staff allocation as loaded for entry and reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: String,
    pub staff_id: String,
    pub branch_id: String,
    pub class_id: String,
    pub class_name: String,
    pub academic_year: String,
    pub batch_id: Option<String>,
    pub batch_name: Option<String>,
    pub subject_name: String,
}

impl Allocation {
    pub fn semester(&self) -> Option<i64> {
        extract_semester_from_class(&self.class_name)
    }
}

const ALLOCATION_SELECT: &str =
    "SELECT a.id, a.staff_id, c.branch_id, a.class_id, c.class_name, c.academic_year,
            a.batch_id, b.batch_name, a.subject_name
     FROM staff_allocations a
     JOIN classes c ON c.id = a.class_id
     LEFT JOIN batches b ON b.id = a.batch_id";

fn allocation_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: r.get(0)?,
        staff_id: r.get(1)?,
        branch_id: r.get(2)?,
        class_id: r.get(3)?,
        class_name: r.get(4)?,
        academic_year: r.get(5)?,
        batch_id: r.get(6)?,
        batch_name: r.get(7)?,
        subject_name: r.get(8)?,
    })
}

/// Loads an allocation that belongs to `staff_id`. Other staff members'
/// allocations read as missing.
pub fn load_allocation(conn: &Connection, staff_id: &str, allocation_id: &str) -> AppResult<Allocation> {
    conn.query_row(
        &format!("{ALLOCATION_SELECT} WHERE a.id = ? AND a.staff_id = ?"),
        (allocation_id, staff_id),
        allocation_from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound("allocation not found".into()))
}

pub fn staff_allocations(conn: &Connection, staff_id: &str) -> AppResult<Vec<Allocation>> {
    let mut stmt = conn.prepare(&format!(
        "{ALLOCATION_SELECT} WHERE a.staff_id = ? ORDER BY c.class_name, a.subject_name"
    ))?;
    let rows = stmt
        .query_map([staff_id], allocation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStudent {
    pub id: String,
    pub register_no: String,
    pub name: String,
}

/// Active students of the allocation's class, narrowed to its batch.
pub fn allocation_roster(conn: &Connection, alloc: &Allocation) -> AppResult<Vec<RosterStudent>> {
    let mut stmt = conn.prepare(
        "SELECT id, register_no, name FROM students
         WHERE class_id = ?1 AND is_active = 1 AND (?2 IS NULL OR batch_id = ?2)
         ORDER BY register_no",
    )?;
    let rows = stmt
        .query_map((&alloc.class_id, &alloc.batch_id), |r| {
            Ok(RosterStudent {
                id: r.get(0)?,
                register_no: r.get(1)?,
                name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffReport {
    pub subject: SubjectRow,
    pub class_name: String,
    pub batch_name: Option<String>,
    pub rows: Vec<StaffReportRow>,
}

pub fn staff_report(conn: &Connection, alloc: &Allocation, t: &Thresholds) -> AppResult<StaffReport> {
    let subject = resolve_subject(conn, &alloc.branch_id, alloc.semester(), &alloc.subject_name)?;
    let roster = allocation_roster(conn, alloc)?;

    let mut attendance_stmt = conn.prepare(
        "SELECT total_classes, classes_attended FROM attendance
         WHERE student_id = ? AND subject_id = ?",
    )?;
    let mut cie_stmt = conn.prepare(
        "SELECT COALESCE(SUM(m.marks_obtained), 0), COALESCE(SUM(c.max_marks), 0)
         FROM cie_marks m
         JOIN cie_config c ON c.id = m.cie_id
         WHERE m.student_id = ? AND m.subject_id = ?",
    )?;

    let mut rows = Vec::with_capacity(roster.len());
    for student in roster {
        let (total, attended): (i64, i64) = attendance_stmt
            .query_row((&student.id, &subject.id), |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?
            .unwrap_or((0, 0));
        let (cie_total, cie_max): (i64, i64) =
            cie_stmt.query_row((&student.id, &subject.id), |r| Ok((r.get(0)?, r.get(1)?)))?;
        let att_pct = ratio_percent(attended, total);
        let cie_pct = ratio_percent(cie_total, cie_max);
        rows.push(StaffReportRow {
            student_id: student.id,
            register_no: student.register_no,
            name: student.name,
            total_classes: total,
            classes_attended: attended,
            attendance_percentage: round2(att_pct),
            attendance_status: attendance_status(att_pct, t),
            cie_total,
            cie_max,
            cie_percentage: round2(cie_pct),
            cie_status: cie_status(cie_pct, t),
        });
    }

    Ok(StaffReport {
        subject,
        class_name: alloc.class_name.clone(),
        batch_name: alloc.batch_name.clone(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    fn seed(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO branches(id, code, name) VALUES('b1', 'CSE', 'Computer Science');
             INSERT INTO users(id, username, password_hash, role_id, branch_id, created_at)
               VALUES('st1', 'staff1', 'x', 3, 'b1', 'now');
             INSERT INTO classes(id, branch_id, class_name, academic_year) VALUES
               ('c3', 'b1', 'Semester 3', '2024-25'),
               ('c3b', 'b1', 'III Sem B', '2024-25'),
               ('c5', 'b1', 'Semester 5', '2024-25'),
               ('c3old', 'b1', 'Semester 3', '2023-24');
             INSERT INTO batches(id, class_id, batch_name) VALUES('bA', 'c3', 'A');
             INSERT INTO students(id, register_no, name, branch_id, class_id, batch_id) VALUES
               ('s1', '1CS001', 'Asha', 'b1', 'c3', 'bA'),
               ('s2', '1CS002', 'Bala', 'b1', 'c3', NULL),
               ('s3', '1CS003', 'Chen', 'b1', 'c5', NULL);
             INSERT INTO subjects(id, subject_code, subject_name, semester, syllabus_name, branch_id, created_at) VALUES
               ('dbms', 'DBMS', 'Database Management Systems', 3, '2022', 'b1', 'now'),
               ('os', 'OS5', 'Operating Systems', 5, '2022', 'b1', 'now');
             INSERT INTO cie_config(id, branch_id, cie_number, max_marks) VALUES
               ('k1', 'b1', 1, 40), ('k2', 'b1', 2, 20);",
        )
        .expect("seed");
    }

    fn query(kind: ReportType) -> ReportQuery {
        ReportQuery {
            report_type: kind,
            academic_year: "2024-25".into(),
            branch_id: "b1".into(),
            semester: "Semester 3".into(),
        }
    }

    #[test]
    fn zero_denominators_give_zero_percent() {
        assert_eq!(ratio_percent(0, 0), 0.0);
        assert_eq!(ratio_percent(5, 0), 0.0);
        assert_eq!(round2(ratio_percent(2, 3)), 66.67);
    }

    #[test]
    fn status_boundaries() {
        let t = thresholds();
        assert_eq!(cie_status(ratio_percent(35, 100), &t), "Pass");
        assert_eq!(cie_status(ratio_percent(7, 20), &t), "Pass");
        assert_eq!(cie_status(34.99, &t), "Fail");
        assert_eq!(cie_status(ratio_percent(0, 0), &t), "Fail");
        assert_eq!(attendance_status(75.0, &t), "Good");
        assert_eq!(attendance_status(74.999, &t), "Shortage");
    }

    #[test]
    fn formats_reject_excel_and_pdf() {
        assert_eq!(ReportFormat::parse("CSV").expect("csv"), ReportFormat::Csv);
        assert_eq!(ReportFormat::parse("excel").expect_err("excel").code(), "unsupported");
        assert_eq!(ReportFormat::parse("pdf").expect_err("pdf").code(), "unsupported");
        assert_eq!(ReportFormat::parse("doc").expect_err("doc").code(), "bad_params");
    }

    #[test]
    fn class_set_matches_label_or_semester() {
        let conn = db::open_memory_db().expect("db");
        seed(&conn);
        let ids: Vec<String> = resolve_class_set(&conn, "b1", "2024-25", "Semester 3")
            .expect("classes")
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c3b".to_string(), "c3".to_string()]);
        assert!(resolve_class_set(&conn, "b1", "2022-23", "Semester 3")
            .expect("classes")
            .is_empty());
    }

    #[test]
    fn attendance_report_scopes_to_class_set() {
        let conn = db::open_memory_db().expect("db");
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO attendance(id, student_id, staff_id, subject_id, total_classes, classes_attended, updated_at) VALUES
               ('a1', 's2', 'st1', 'dbms', 40, 29, 'now'),
               ('a2', 's1', 'st1', 'dbms', 0, 0, 'now'),
               ('a3', 's3', 'st1', 'os', 40, 40, 'now');",
        )
        .expect("attendance");

        let report = branch_report(&conn, &query(ReportType::Attendance), &thresholds()).expect("report");
        let BranchReport::Attendance(rows) = &report else {
            panic!("expected attendance rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].register_no, "1CS001");
        assert_eq!(rows[0].percentage, 0.0);
        assert_eq!(rows[0].status, "Shortage");
        assert_eq!(rows[1].percentage, 72.5);

        let mut out = Vec::new();
        report.write_csv(&mut out).expect("csv");
        let text = String::from_utf8(out).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Register No,Name,Subject Code,Subject Name,Total Classes,Attended,Percentage,Status")
        );
        assert_eq!(
            lines.next(),
            Some("1CS001,Asha,DBMS,Database Management Systems,0,0,0.00,Shortage")
        );
    }

    #[test]
    fn empty_reports_are_not_found() {
        let conn = db::open_memory_db().expect("db");
        seed(&conn);
        let e = branch_report(&conn, &query(ReportType::Cie), &thresholds()).expect_err("empty");
        assert_eq!(e.code(), "not_found");
        assert_eq!(e.to_string(), "No data found for this report.");

        let mut q = query(ReportType::Cie);
        q.semester = "Semester 8".into();
        assert_eq!(branch_report(&conn, &q, &thresholds()).expect_err("no class").code(), "not_found");
    }

    #[test]
    fn staff_report_sums_cie_for_the_subject() {
        let conn = db::open_memory_db().expect("db");
        seed(&conn);
        conn.execute_batch(
            "INSERT INTO staff_allocations(id, staff_id, class_id, batch_id, subject_name, allocated_at)
               VALUES('al1', 'st1', 'c3', 'bA', 'DBMS - Semester 3', 'now');
             INSERT INTO attendance(id, student_id, staff_id, subject_id, total_classes, classes_attended, updated_at)
               VALUES('a1', 's1', 'st1', 'dbms', 20, 15, 'now');
             INSERT INTO cie_marks(id, student_id, cie_id, subject_id, marks_obtained, entered_by, updated_at) VALUES
               ('m1', 's1', 'k1', 'dbms', 10, 'st1', 'now'),
               ('m2', 's1', 'k2', 'dbms', 11, 'st1', 'now');",
        )
        .expect("entries");

        let alloc = load_allocation(&conn, "st1", "al1").expect("allocation");
        assert_eq!(alloc.semester(), Some(3));
        let report = staff_report(&conn, &alloc, &thresholds()).expect("report");
        assert_eq!(report.subject.code, "DBMS");
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row.attendance_percentage, 75.0);
        assert_eq!(row.attendance_status, "Good");
        assert_eq!((row.cie_total, row.cie_max), (21, 60));
        assert_eq!(row.cie_percentage, 35.0);
        assert_eq!(row.cie_status, "Pass");

        assert_eq!(
            load_allocation(&conn, "someone-else", "al1").expect_err("foreign").code(),
            "not_found"
        );
    }
}
