use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::money;
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const COURSE_STATUSES: [&str; 2] = ["active", "inactive"];
const BATCH_STATUSES: [&str; 4] = ["upcoming", "ongoing", "completed", "cancelled"];

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_u64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as i64)
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_amount_cents(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    let raw = req
        .params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    match money::to_cents(raw) {
        Some(c) if c >= 0 => Ok(c),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a non-negative amount", key),
            None,
        )),
    }
}

fn optional_amount_cents(req: &Request, key: &str) -> Result<Option<i64>, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let raw = v.as_f64().ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be a number", key),
            None,
        )
    })?;
    match money::to_cents(raw) {
        Some(c) if c >= 0 => Ok(Some(c)),
        _ => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a non-negative amount", key),
            None,
        )),
    }
}

fn required_date(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = required_str(req, key)?;
    if NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be YYYY-MM-DD", key),
            None,
        ));
    }
    Ok(raw)
}

fn status_param(
    req: &Request,
    key: &str,
    allowed: &[&str],
    default: &str,
) -> Result<String, serde_json::Value> {
    let raw = optional_str(req, key).unwrap_or_else(|| default.to_string());
    if !allowed.contains(&raw.as_str()) {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be one of: {}", key, allowed.join(", ")),
            Some(json!({ key: raw })),
        ));
    }
    Ok(raw)
}

// ---------------------------------------------------------------------------
// Courses

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Include batch counts so the UI can show a useful dashboard.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id, c.name, c.duration_hours, c.price_cents,
           c.admission_fee_cents, c.registration_fee_cents, c.exam_fee_cents,
           c.max_students, c.status,
           (SELECT COUNT(*) FROM course_batches b WHERE b.course_id = c.id) AS batch_count
         FROM courses c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "duration": row.get::<_, i64>(2)?,
                "price": money::from_cents(row.get::<_, i64>(3)?),
                "admissionFee": row.get::<_, Option<i64>>(4)?.map(money::from_cents),
                "registrationFee": row.get::<_, Option<i64>>(5)?.map(money::from_cents),
                "examFee": row.get::<_, Option<i64>>(6)?.map(money::from_cents),
                "maxStudents": row.get::<_, i64>(7)?,
                "status": row.get::<_, String>(8)?,
                "batchCount": row.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let duration = match required_u64(req, "duration") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let price_cents = match required_amount_cents(req, "price") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission = match optional_amount_cents(req, "admissionFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let registration = match optional_amount_cents(req, "registrationFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match optional_amount_cents(req, "examFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_students = match required_u64(req, "maxStudents") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match status_param(req, "status", &COURSE_STATUSES, "active") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, duration_hours, price_cents,
           admission_fee_cents, registration_fee_cents, exam_fee_cents,
           max_students, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &name,
            duration,
            price_cents,
            admission,
            registration,
            exam,
            max_students,
            &status,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "name": name }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let duration = match required_u64(req, "duration") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let price_cents = match required_amount_cents(req, "price") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission = match optional_amount_cents(req, "admissionFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let registration = match optional_amount_cents(req, "registrationFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam = match optional_amount_cents(req, "examFee") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_students = match required_u64(req, "maxStudents") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match status_param(req, "status", &COURSE_STATUSES, "active") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let updated = match conn.execute(
        "UPDATE courses SET name = ?, duration_hours = ?, price_cents = ?,
           admission_fee_cents = ?, registration_fee_cents = ?, exam_fee_cents = ?,
           max_students = ?, status = ?
         WHERE id = ?",
        (
            &name,
            duration,
            price_cents,
            admission,
            registration,
            exam,
            max_students,
            &status,
            &course_id,
        ),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "courses" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "course not found", None);
    }

    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let batch_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM course_batches WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if batch_count > 0 {
        return err(
            &req.id,
            "validation_failed",
            "course has batches; delete them first",
            Some(json!({ "batchCount": batch_count })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM courses WHERE id = ?", [&course_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// Batches

fn handle_batches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "batches": [] }));
    };

    // currentStudents is derived from active enrollments so it can never
    // drift from the ledger.
    let mut stmt = match conn.prepare(
        "SELECT
           b.id, b.course_id, c.name, b.batch_name, b.start_date, b.end_date,
           b.schedule, b.max_students, b.status,
           (SELECT COUNT(*) FROM enrollments e
             WHERE e.batch_id = b.id AND e.status = 'active') AS current_students
         FROM course_batches b
         JOIN courses c ON c.id = b.course_id
         ORDER BY b.start_date, b.batch_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "courseId": row.get::<_, String>(1)?,
                "courseName": row.get::<_, String>(2)?,
                "batchName": row.get::<_, String>(3)?,
                "startDate": row.get::<_, String>(4)?,
                "endDate": row.get::<_, String>(5)?,
                "schedule": row.get::<_, String>(6)?,
                "maxStudents": row.get::<_, i64>(7)?,
                "status": row.get::<_, String>(8)?,
                "currentStudents": row.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(batches) => ok(&req.id, json!({ "batches": batches })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_batches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let batch_name = match required_str(req, "batchName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match required_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match required_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let schedule = match required_str(req, "schedule") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_students = match required_u64(req, "maxStudents") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match status_param(req, "status", &BATCH_STATUSES, "upcoming") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let course_status: Option<String> = match conn
        .query_row("SELECT status FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    match course_status.as_deref() {
        None => return err(&req.id, "not_found", "course not found", None),
        Some("active") => {}
        Some(other) => {
            return err(
                &req.id,
                "validation_failed",
                "batches may only be created for active courses",
                Some(json!({ "courseStatus": other })),
            )
        }
    }

    let batch_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO course_batches(id, course_id, batch_name, start_date,
           end_date, schedule, max_students, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &batch_id,
            &course_id,
            &batch_name,
            &start_date,
            &end_date,
            &schedule,
            max_students,
            &status,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "course_batches" })),
        );
    }

    ok(&req.id, json!({ "batchId": batch_id, "batchName": batch_name }))
}

fn handle_batches_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let batch_name = match required_str(req, "batchName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match required_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match required_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let schedule = match required_str(req, "schedule") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_students = match required_u64(req, "maxStudents") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match status_param(req, "status", &BATCH_STATUSES, "upcoming") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let updated = match conn.execute(
        "UPDATE course_batches SET batch_name = ?, start_date = ?, end_date = ?,
           schedule = ?, max_students = ?, status = ?
         WHERE id = ?",
        (
            &batch_name,
            &start_date,
            &end_date,
            &schedule,
            max_students,
            &status,
            &batch_id,
        ),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "course_batches" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "batch not found", None);
    }

    ok(&req.id, json!({ "batchId": batch_id }))
}

fn handle_batches_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM course_batches WHERE id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "batch not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records
         WHERE session_id IN (SELECT id FROM attendance_sessions WHERE batch_id = ?)",
        [&batch_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM attendance_sessions WHERE batch_id = ?",
        [&batch_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_sessions" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM course_payments
         WHERE enrollment_id IN (SELECT id FROM enrollments WHERE batch_id = ?)",
        [&batch_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "course_payments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE batch_id = ?", [&batch_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM course_batches WHERE id = ?", [&batch_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "course_batches" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

// ---------------------------------------------------------------------------
// Students

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id, s.name, s.email, s.phone, s.address,
           s.date_of_birth, s.emergency_contact, s.created_at,
           (SELECT COUNT(*) FROM enrollments e
             WHERE e.student_id = s.id AND e.status = 'active') AS active_enrollments
         FROM students s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "phone": row.get::<_, String>(3)?,
                "address": row.get::<_, String>(4)?,
                "dateOfBirth": row.get::<_, Option<String>>(5)?,
                "emergencyContact": row.get::<_, Option<String>>(6)?,
                "createdAt": row.get::<_, String>(7)?,
                "activeEnrollments": row.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone = match required_str(req, "phone") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match required_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match optional_str(req, "dateOfBirth") {
        Some(raw) => {
            if NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
                return err(&req.id, "bad_params", "dateOfBirth must be YYYY-MM-DD", None);
            }
            Some(raw)
        }
        None => None,
    };
    let emergency_contact = optional_str(req, "emergencyContact");
    let created_at = chrono::Utc::now().to_rfc3339();

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, email, phone, address,
           date_of_birth, emergency_contact, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &email,
            &phone,
            &address,
            &date_of_birth,
            &emergency_contact,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "name": name }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone = match required_str(req, "phone") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match required_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match optional_str(req, "dateOfBirth") {
        Some(raw) => {
            if NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
                return err(&req.id, "bad_params", "dateOfBirth must be YYYY-MM-DD", None);
            }
            Some(raw)
        }
        None => None,
    };
    let emergency_contact = optional_str(req, "emergencyContact");

    let updated = match conn.execute(
        "UPDATE students SET name = ?, email = ?, phone = ?, address = ?,
           date_of_birth = ?, emergency_contact = ?
         WHERE id = ?",
        (
            &name,
            &email,
            &phone,
            &address,
            &date_of_birth,
            &emergency_contact,
            &student_id,
        ),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let enrollment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if enrollment_count > 0 {
        return err(
            &req.id,
            "validation_failed",
            "student has enrollments; delete them first",
            Some(json!({ "enrollmentCount": enrollment_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Stray attendance rows may remain for a student with no enrollments.
    if let Err(e) = tx.execute(
        "DELETE FROM attendance_records WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_records" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.update" => Some(handle_batches_update(state, req)),
        "batches.delete" => Some(handle_batches_delete(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
