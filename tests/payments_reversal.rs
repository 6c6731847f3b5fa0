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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn setup_enrollment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "c",
        "courses.create",
        json!({ "name": "Tailoring", "duration": 50, "price": 900.0, "maxStudents": 15 }),
    );
    let course_id = course.get("courseId").and_then(|v| v.as_str()).expect("courseId").to_string();
    let batch = request_ok(
        stdin,
        reader,
        "b",
        "batches.create",
        json!({
            "courseId": course_id,
            "batchName": "T-1",
            "startDate": "2026-01-12",
            "endDate": "2026-04-03",
            "schedule": "Sun/Tue 16:00",
            "maxStudents": 15,
            "status": "ongoing"
        }),
    );
    let batch_id = batch.get("batchId").and_then(|v| v.as_str()).expect("batchId").to_string();
    let student = request_ok(
        stdin,
        reader,
        "s",
        "students.create",
        json!({
            "name": "Gila Seventh",
            "email": "gila@example.test",
            "phone": "555-0103",
            "address": "4 Pine Road"
        }),
    );
    let student_id = student.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();

    let created = request_ok(
        stdin,
        reader,
        "e",
        "enrollments.create",
        json!({ "studentId": student_id, "courseId": course_id, "batchId": batch_id }),
    );
    created
        .get("enrollment")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("enrollment id")
        .to_string()
}

#[test]
fn deleting_a_payment_restores_the_balance() {
    let workspace = temp_dir("trainingd-reversal");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 250.0 }),
    );
    let payment_id = recorded
        .get("paymentId")
        .and_then(|v| v.as_str())
        .expect("paymentId")
        .to_string();
    assert_eq!(
        recorded
            .get("enrollment")
            .and_then(|v| v.get("paidAmount"))
            .and_then(|v| v.as_f64()),
        Some(250.0)
    );

    let reversed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.delete",
        json!({ "paymentId": payment_id }),
    );
    let enrollment = reversed.get("enrollment").expect("enrollment");
    assert_eq!(enrollment.get("paidAmount").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(enrollment.get("remainingAmount").and_then(|v| v.as_f64()), Some(900.0));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "payments.list",
        json!({ "enrollmentId": enrollment_id }),
    );
    assert_eq!(
        listed.get("payments").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    // The freed headroom is usable again.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 900.0 }),
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_an_unknown_payment_is_not_found() {
    let workspace = temp_dir("trainingd-reversal-unknown");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = setup_enrollment(&mut stdin, &mut reader, &workspace);

    let rejected = request(
        &mut stdin,
        &mut reader,
        "1",
        "payments.delete",
        json!({ "paymentId": "no-such-payment" }),
    );
    assert_eq!(error_code(&rejected), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn voucher_numbers_are_sequential_and_never_reused() {
    let workspace = temp_dir("trainingd-vouchers");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 100.0 }),
    );
    let first_voucher = first
        .get("voucherNumber")
        .and_then(|v| v.as_str())
        .expect("voucherNumber")
        .to_string();
    assert_eq!(first_voucher, "PAY-000001");
    let first_payment = first
        .get("paymentId")
        .and_then(|v| v.as_str())
        .expect("paymentId")
        .to_string();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 100.0 }),
    );
    assert_eq!(
        second.get("voucherNumber").and_then(|v| v.as_str()),
        Some("PAY-000002")
    );

    // Reversal retires the voucher; the counter never walks backwards.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "payments.delete",
        json!({ "paymentId": first_payment }),
    );
    let third = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "payments.record",
        json!({ "enrollmentId": enrollment_id, "amount": 50.0 }),
    );
    assert_eq!(
        third.get("voucherNumber").and_then(|v| v.as_str()),
        Some("PAY-000003")
    );

    let retired = request(
        &mut stdin,
        &mut reader,
        "5",
        "payments.voucher",
        json!({ "voucherNumber": first_voucher }),
    );
    assert_eq!(error_code(&retired), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn voucher_lookup_projects_the_full_receipt() {
    let workspace = temp_dir("trainingd-voucher-lookup");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let enrollment_id = setup_enrollment(&mut stdin, &mut reader, &workspace);

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "payments.record",
        json!({
            "enrollmentId": enrollment_id,
            "amount": 300.0,
            "paymentMethod": "card",
            "paymentDate": "2026-02-14",
            "description": "Second installment",
            "receivedBy": "Front desk"
        }),
    );
    let voucher = recorded
        .get("voucherNumber")
        .and_then(|v| v.as_str())
        .expect("voucherNumber")
        .to_string();

    let receipt = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.voucher",
        json!({ "voucherNumber": voucher }),
    );
    assert_eq!(receipt.get("amount").and_then(|v| v.as_f64()), Some(300.0));
    assert_eq!(receipt.get("paymentMethod").and_then(|v| v.as_str()), Some("card"));
    assert_eq!(receipt.get("paymentDate").and_then(|v| v.as_str()), Some("2026-02-14"));
    assert_eq!(receipt.get("receivedBy").and_then(|v| v.as_str()), Some("Front desk"));
    assert_eq!(
        receipt
            .get("student")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("Gila Seventh")
    );
    assert_eq!(
        receipt
            .get("course")
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("Tailoring")
    );
    assert_eq!(
        receipt
            .get("enrollment")
            .and_then(|v| v.get("remainingAmount"))
            .and_then(|v| v.as_f64()),
        Some(600.0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
