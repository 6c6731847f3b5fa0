use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const ATTENDANCE_STATUSES: [&str; 4] = ["present", "absent", "late", "excused"];
const DEFAULT_SESSION_MINUTES: i64 = 120;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_required_date(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: format!("{} must be YYYY-MM-DD", key),
        details: None,
    })?;
    Ok(raw)
}

fn get_optional_date(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match get_optional_str(params, key) {
        Some(raw) => {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| HandlerErr {
                code: "bad_params",
                message: format!("{} must be YYYY-MM-DD", key),
                details: None,
            })?;
            Ok(Some(raw))
        }
        None => Ok(None),
    }
}

fn get_status(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let status = get_required_str(params, "status")?;
    if !ATTENDANCE_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("status must be one of: {}", ATTENDANCE_STATUSES.join(", ")),
            details: Some(json!({ "status": status })),
        });
    }
    Ok(status)
}

/// present + late over total, as a percentage with one decimal. Zero
/// sessions means zero percent, never a division error.
fn attendance_percentage(attended: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (1000.0 * attended as f64 / total as f64).round() / 10.0
}

#[derive(Debug, Default, Clone, Copy)]
struct StatusTally {
    present: i64,
    late: i64,
    excused: i64,
}

impl StatusTally {
    fn bump(&mut self, status: &str) {
        match status {
            "present" => self.present += 1,
            "late" => self.late += 1,
            "excused" => self.excused += 1,
            // Explicit 'absent' rows fold into the implicit default.
            _ => {}
        }
    }

    fn to_json(self, total_sessions: i64) -> serde_json::Value {
        let absent = total_sessions - self.present - self.late - self.excused;
        json!({
            "totalSessions": total_sessions,
            "present": self.present,
            "late": self.late,
            "excused": self.excused,
            "absent": absent,
            "attendancePercentage": attendance_percentage(self.present + self.late, total_sessions),
        })
    }
}

fn sessions_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let date = get_required_date(params, "date")?;
    let topic = get_required_str(params, "topic")?;
    let instructor = get_required_str(params, "instructor")?;
    let duration = match params.get("duration") {
        None | Some(serde_json::Value::Null) => DEFAULT_SESSION_MINUTES,
        Some(v) => v.as_u64().map(|n| n as i64).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "duration must be minutes".to_string(),
            details: None,
        })?,
    };

    // Sessions may only be scheduled for batches currently running.
    let batch_status: Option<String> = conn
        .query_row(
            "SELECT status FROM course_batches WHERE id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    match batch_status.as_deref() {
        None => {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "batch does not exist".to_string(),
                details: Some(json!({ "batchId": batch_id })),
            })
        }
        Some("ongoing") => {}
        Some(other) => {
            return Err(HandlerErr {
                code: "validation_failed",
                message: "sessions may only be created for ongoing batches".to_string(),
                details: Some(json!({ "batchStatus": other })),
            })
        }
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_sessions(id, batch_id, date, topic,
           duration_minutes, instructor)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&session_id, &batch_id, &date, &topic, duration, &instructor),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_sessions" })),
    })?;

    Ok(json!({
        "session": {
            "id": session_id,
            "batchId": batch_id,
            "date": date,
            "topic": topic,
            "duration": duration,
            "instructor": instructor,
            "attendanceRecords": [],
        }
    }))
}

fn sessions_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let from = get_optional_date(params, "from")?;
    let to = get_optional_date(params, "to")?;

    let mut sql = String::from(
        "SELECT s.id, s.batch_id, b.batch_name, s.date, s.topic,
           s.duration_minutes, s.instructor,
           (SELECT COUNT(*) FROM attendance_records ar
             WHERE ar.session_id = s.id AND ar.status IN ('present', 'late'))
             AS present_count,
           (SELECT COUNT(*) FROM enrollments e
             WHERE e.batch_id = s.batch_id AND e.status = 'active')
             AS enrolled_count
         FROM attendance_sessions s
         JOIN course_batches b ON b.id = s.batch_id",
    );
    let mut args: Vec<Value> = Vec::new();
    let mut conds: Vec<&str> = Vec::new();
    if let Some(batch_id) = get_optional_str(params, "batchId") {
        conds.push("s.batch_id = ?");
        args.push(Value::Text(batch_id));
    }
    if let Some(from) = from {
        conds.push("s.date >= ?");
        args.push(Value::Text(from));
    }
    if let Some(to) = to {
        conds.push("s.date <= ?");
        args.push(Value::Text(to));
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    sql.push_str(" ORDER BY s.date, s.id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "batchId": r.get::<_, String>(1)?,
                "batchName": r.get::<_, String>(2)?,
                "date": r.get::<_, String>(3)?,
                "topic": r.get::<_, String>(4)?,
                "duration": r.get::<_, i64>(5)?,
                "instructor": r.get::<_, String>(6)?,
                "presentCount": r.get::<_, i64>(7)?,
                "enrolledCount": r.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "sessions": rows }))
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status = get_status(params)?;
    let notes = get_optional_str(params, "notes");

    let session_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if session_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }

    // The student must be in the catalog; batch membership is the
    // caller's concern and deliberately unchecked here.
    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if student_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    conn.execute(
        "INSERT INTO attendance_records(session_id, student_id, status, notes)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(session_id, student_id) DO UPDATE SET
           status = excluded.status,
           notes = excluded.notes",
        (&session_id, &student_id, &status, &notes),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_records" })),
    })?;

    Ok(json!({
        "sessionId": session_id,
        "studentId": student_id,
        "status": status,
    }))
}

fn attendance_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;

    let session_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if session_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "session not found".to_string(),
            details: None,
        });
    }

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, notes FROM attendance_records
             WHERE session_id = ? AND student_id = ?",
            (&session_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    // Unmarked reads as the implicit default.
    let (status, notes) = row.unwrap_or_else(|| ("absent".to_string(), None));
    Ok(json!({
        "sessionId": session_id,
        "studentId": student_id,
        "status": status,
        "notes": notes,
    }))
}

#[derive(Debug, Clone)]
struct SessionRow {
    id: String,
    date: String,
    topic: String,
    duration_minutes: i64,
}

fn sessions_in_range(
    conn: &Connection,
    batch_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<SessionRow>, HandlerErr> {
    let mut sql = String::from(
        "SELECT id, date, topic, duration_minutes
         FROM attendance_sessions WHERE batch_id = ?",
    );
    let mut args: Vec<Value> = vec![Value::Text(batch_id.to_string())];
    if let Some(from) = from {
        sql.push_str(" AND date >= ?");
        args.push(Value::Text(from.to_string()));
    }
    if let Some(to) = to {
        sql.push_str(" AND date <= ?");
        args.push(Value::Text(to.to_string()));
    }
    sql.push_str(" ORDER BY date, id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    stmt.query_map(rusqlite::params_from_iter(args), |r| {
        Ok(SessionRow {
            id: r.get(0)?,
            date: r.get(1)?,
            topic: r.get(2)?,
            duration_minutes: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn records_for_sessions(
    conn: &Connection,
    sessions: &[SessionRow],
) -> Result<HashMap<(String, String), (String, Option<String>)>, HandlerErr> {
    let mut by_key = HashMap::new();
    if sessions.is_empty() {
        return Ok(by_key);
    }

    let placeholders = vec!["?"; sessions.len()].join(", ");
    let sql = format!(
        "SELECT session_id, student_id, status, notes
         FROM attendance_records WHERE session_id IN ({})",
        placeholders
    );
    let args: Vec<Value> = sessions
        .iter()
        .map(|s| Value::Text(s.id.clone()))
        .collect();

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                (r.get::<_, String>(2)?, r.get::<_, Option<String>>(3)?),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    for (key, value) in rows {
        by_key.insert(key, value);
    }
    Ok(by_key)
}

fn aggregate_batch(
    conn: &Connection,
    batch_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM course_batches WHERE id = ?",
            [batch_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if batch_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "batch not found".to_string(),
            details: None,
        });
    }

    let sessions = sessions_in_range(conn, batch_id, from, to)?;
    let records = records_for_sessions(conn, &sessions)?;
    let total_sessions = sessions.len() as i64;

    let mut stmt = conn
        .prepare(
            "SELECT e.student_id, s.name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.batch_id = ? AND e.status = 'active'
             ORDER BY s.name",
        )
        .map_err(HandlerErr::db)?;
    let enrollees = stmt
        .query_map([batch_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let students: Vec<serde_json::Value> = enrollees
        .into_iter()
        .map(|(student_id, name)| {
            let mut tally = StatusTally::default();
            for session in &sessions {
                if let Some((status, _)) = records.get(&(session.id.clone(), student_id.clone())) {
                    tally.bump(status);
                }
            }
            let mut row = tally.to_json(total_sessions);
            row["studentId"] = json!(student_id);
            row["studentName"] = json!(name);
            row
        })
        .collect();

    Ok(json!({
        "batchId": batch_id,
        "totalSessions": total_sessions,
        "students": students,
    }))
}

fn aggregate_student(
    conn: &Connection,
    student_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<serde_json::Value, HandlerErr> {
    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if student_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.batch_id, b.batch_name, c.name
             FROM enrollments e
             JOIN course_batches b ON b.id = e.batch_id
             JOIN courses c ON c.id = e.course_id
             WHERE e.student_id = ? AND e.status = 'active'
             ORDER BY c.name, b.batch_name",
        )
        .map_err(HandlerErr::db)?;
    let active_enrollments = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut enrollment_reports = Vec::new();
    for (enrollment_id, batch_id, batch_name, course_name) in active_enrollments {
        let sessions = sessions_in_range(conn, &batch_id, from, to)?;
        let records = records_for_sessions(conn, &sessions)?;
        let total_sessions = sessions.len() as i64;

        let mut tally = StatusTally::default();
        let mut session_rows = Vec::new();
        for session in &sessions {
            let record = records.get(&(session.id.clone(), student_id.to_string()));
            if let Some((status, _)) = record {
                tally.bump(status);
            }
            let (status, notes) = match record {
                Some((status, notes)) => (status.clone(), notes.clone()),
                None => ("absent".to_string(), None),
            };
            session_rows.push(json!({
                "sessionId": session.id,
                "date": session.date,
                "topic": session.topic,
                "duration": session.duration_minutes,
                "status": status,
                "notes": notes,
            }));
        }

        let mut report = tally.to_json(total_sessions);
        report["enrollmentId"] = json!(enrollment_id);
        report["batchId"] = json!(batch_id);
        report["batchName"] = json!(batch_name);
        report["courseName"] = json!(course_name);
        report["sessions"] = json!(session_rows);
        enrollment_reports.push(report);
    }

    Ok(json!({
        "studentId": student_id,
        "enrollments": enrollment_reports,
    }))
}

fn attendance_aggregate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let from = get_optional_date(params, "from")?;
    let to = get_optional_date(params, "to")?;
    let batch_id = get_optional_str(params, "batchId");
    let student_id = get_optional_str(params, "studentId");

    match (batch_id, student_id) {
        (Some(batch_id), None) => aggregate_batch(conn, &batch_id, from.as_deref(), to.as_deref()),
        (None, Some(student_id)) => {
            aggregate_student(conn, &student_id, from.as_deref(), to.as_deref())
        }
        _ => Err(HandlerErr {
            code: "bad_params",
            message: "provide exactly one of batchId or studentId".to_string(),
            details: None,
        }),
    }
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(with_conn(state, req, sessions_create)),
        "sessions.list" => Some(with_conn(state, req, sessions_list)),
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.status" => Some(with_conn(state, req, attendance_status)),
        "attendance.aggregate" => Some(with_conn(state, req, attendance_aggregate)),
        _ => None,
    }
}
