use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_trainingd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn trainingd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("trainingd-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({
            "name": "Smoke Course",
            "duration": 40,
            "price": 1000.0,
            "maxStudents": 20
        }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "4", "courses.list", json!({}));

    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batches.create",
        json!({
            "courseId": course_id,
            "batchName": "Smoke Batch",
            "startDate": "2026-01-05",
            "endDate": "2026-03-27",
            "schedule": "Mon/Wed 18:00",
            "maxStudents": 20,
            "status": "ongoing"
        }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "6", "batches.list", json!({}));

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({
            "name": "Smoke Student",
            "email": "smoke@example.test",
            "phone": "555-0100",
            "address": "1 Test Lane"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "8", "students.list", json!({}));

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "enrollments.create",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "batchId": batch_id,
            "initialPayment": 200.0
        }),
    );
    let enrollment_id = enrolled
        .get("enrollment")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("enrollment id")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "10", "enrollments.list", json!({}));

    let payment = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 100.0 }),
    );
    let voucher = payment
        .get("voucherNumber")
        .and_then(|v| v.as_str())
        .expect("voucherNumber")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "12", "payments.list", json!({}));
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "payments.voucher",
        json!({ "voucherNumber": voucher }),
    );

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "sessions.create",
        json!({
            "batchId": batch_id,
            "date": "2026-01-05",
            "topic": "Orientation",
            "instructor": "Lee"
        }),
    );
    let session_id = session
        .get("session")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("session id")
        .to_string();
    let _ = request_ok(&mut stdin, &mut reader, "15", "sessions.list", json!({}));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "attendance.mark",
        json!({
            "sessionId": session_id,
            "studentId": student_id,
            "status": "present"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "attendance.status",
        json!({ "sessionId": session_id, "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "attendance.aggregate",
        json!({ "batchId": batch_id }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "enrollments.updateStatus",
        json!({ "enrollmentId": enrollment_id, "status": "completed" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "backup.export",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "backup.import",
        json!({
            "inPath": bundle_out.to_string_lossy(),
            "workspacePath": workspace.to_string_lossy()
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "23",
        "batches.delete",
        json!({ "batchId": batch_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "students.delete",
        json!({ "studentId": student_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "courses.delete",
        json!({ "courseId": course_id }),
    );

    let still_alive = request(&mut stdin, &mut reader, "26", "health", json!({}));
    assert_eq!(still_alive.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_method_reports_not_implemented() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let payload = json!({ "id": "x1", "method": "nope.nothing", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
}
