use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::money;
use chrono::NaiveDate;
use rusqlite::{types::Value, Connection, OptionalExtension};
use serde_json::json;

const ENROLLMENT_STATUSES: [&str; 4] = ["active", "completed", "dropped", "suspended"];
const PAYMENT_METHODS: [&str; 4] = ["cash", "card", "transfer", "cheque"];

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

    fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    fn validation(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "validation_failed",
            message: message.into(),
            details,
        }
    }

    fn invariant(message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
        HandlerErr {
            code: "invariant_violation",
            message: message.into(),
            details,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_amount_cents(params: &serde_json::Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let raw = v
        .as_f64()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))?;
    let cents = money::to_cents(raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} is not a valid amount", key)))?;
    Ok(Some(cents))
}

fn get_payment_date(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match get_optional_str(params, "paymentDate") {
        Some(raw) => {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map_err(|_| HandlerErr::bad_params("paymentDate must be YYYY-MM-DD"))?;
            Ok(raw)
        }
        None => Ok(chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()),
    }
}

fn get_payment_method(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let method = get_optional_str(params, "paymentMethod").unwrap_or_else(|| "cash".to_string());
    if !PAYMENT_METHODS.contains(&method.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "paymentMethod must be one of: {}",
            PAYMENT_METHODS.join(", ")
        )));
    }
    Ok(method)
}

#[derive(Debug, Clone)]
struct EnrollmentRow {
    id: String,
    student_id: String,
    course_id: String,
    batch_id: String,
    total_fee_cents: i64,
    paid_amount_cents: i64,
    status: String,
    plan_total_installments: Option<i64>,
    plan_installment_cents: Option<i64>,
    plan_paid_installments: Option<i64>,
}

impl EnrollmentRow {
    fn remaining_cents(&self) -> i64 {
        self.total_fee_cents - self.paid_amount_cents
    }

    fn to_json(&self) -> serde_json::Value {
        let plan = self.plan_total_installments.map(|total| {
            json!({
                "totalInstallments": total,
                "installmentAmount": money::from_cents(self.plan_installment_cents.unwrap_or(0)),
                "paidInstallments": self.plan_paid_installments.unwrap_or(0),
            })
        });
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "courseId": self.course_id,
            "batchId": self.batch_id,
            "totalFee": money::from_cents(self.total_fee_cents),
            "paidAmount": money::from_cents(self.paid_amount_cents),
            "remainingAmount": money::from_cents(self.remaining_cents()),
            "status": self.status,
            "installmentPlan": plan,
        })
    }
}

fn load_enrollment(conn: &Connection, id: &str) -> Result<Option<EnrollmentRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, course_id, batch_id, total_fee_cents,
           paid_amount_cents, status, plan_total_installments,
           plan_installment_cents, plan_paid_installments
         FROM enrollments WHERE id = ?",
        [id],
        |r| {
            Ok(EnrollmentRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                course_id: r.get(2)?,
                batch_id: r.get(3)?,
                total_fee_cents: r.get(4)?,
                paid_amount_cents: r.get(5)?,
                status: r.get(6)?,
                plan_total_installments: r.get(7)?,
                plan_installment_cents: r.get(8)?,
                plan_paid_installments: r.get(9)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn active_enrollment_count(conn: &Connection, batch_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE batch_id = ? AND status = 'active'",
        [batch_id],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

/// Inserts a payment row. Caller supplies the open transaction and the
/// enrollment the payment belongs to; student_id is always copied from
/// that row so the denormalized column cannot drift.
#[allow(clippy::too_many_arguments)]
fn insert_payment(
    conn: &Connection,
    enrollment: &EnrollmentRow,
    amount_cents: i64,
    method: &str,
    payment_date: &str,
    description: &str,
    received_by: &str,
    installment_number: Option<i64>,
) -> Result<(String, String), HandlerErr> {
    let voucher_number = db::next_voucher_number(conn).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: format!("{e:?}"),
        details: Some(json!({ "table": "settings" })),
    })?;
    let payment_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO course_payments(id, enrollment_id, student_id, amount_cents,
           method, payment_date, voucher_number, description, received_by,
           installment_number)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &payment_id,
            &enrollment.id,
            &enrollment.student_id,
            amount_cents,
            method,
            payment_date,
            &voucher_number,
            description,
            received_by,
            installment_number,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "course_payments" })),
    })?;
    Ok((payment_id, voucher_number))
}

fn enrollments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let batch_id = get_required_str(params, "batchId")?;

    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if student_exists.is_none() {
        return Err(HandlerErr::not_found("student not found"));
    }

    let course_price: Option<i64> = conn
        .query_row(
            "SELECT price_cents FROM courses WHERE id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(course_price) = course_price else {
        return Err(HandlerErr::not_found("course not found"));
    };

    let batch: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT course_id, max_students, status FROM course_batches WHERE id = ?",
            [&batch_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((batch_course_id, max_students, batch_status)) = batch else {
        return Err(HandlerErr::not_found("batch not found"));
    };
    if batch_course_id != course_id {
        return Err(HandlerErr::validation(
            "batch does not belong to the selected course",
            Some(json!({ "batchCourseId": batch_course_id })),
        ));
    }
    if batch_status == "completed" || batch_status == "cancelled" {
        return Err(HandlerErr::validation(
            "batch is no longer accepting enrollments",
            Some(json!({ "batchStatus": batch_status })),
        ));
    }

    // The course price is the fee unless an explicit override is given.
    let total_fee_cents = match get_amount_cents(params, "totalFee")? {
        Some(v) if v >= 0 => v,
        Some(_) => return Err(HandlerErr::bad_params("totalFee must not be negative")),
        None => course_price,
    };
    let initial_cents = match get_amount_cents(params, "initialPayment")? {
        Some(v) if v >= 0 => v,
        Some(_) => return Err(HandlerErr::bad_params("initialPayment must not be negative")),
        None => 0,
    };
    if initial_cents > total_fee_cents {
        return Err(HandlerErr::validation(
            "initial payment exceeds total fee",
            Some(json!({
                "totalFee": money::from_cents(total_fee_cents),
                "initialPayment": money::from_cents(initial_cents),
            })),
        ));
    }

    let plan = match params.get("installmentPlan") {
        None | Some(serde_json::Value::Null) => None,
        Some(p) => {
            let total = p
                .get("totalInstallments")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    HandlerErr::bad_params("installmentPlan.totalInstallments must be a count")
                })?;
            if total < 1 {
                return Err(HandlerErr::validation(
                    "installment plan needs at least one installment",
                    None,
                ));
            }
            let amount_raw = p
                .get("installmentAmount")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| {
                    HandlerErr::bad_params("installmentPlan.installmentAmount must be a number")
                })?;
            let amount_cents = money::to_cents(amount_raw)
                .filter(|c| *c > 0)
                .ok_or_else(|| {
                    HandlerErr::bad_params("installmentPlan.installmentAmount must be positive")
                })?;
            Some((total as i64, amount_cents))
        }
    };

    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments
             WHERE student_id = ? AND course_id = ? AND batch_id = ?",
            (&student_id, &course_id, &batch_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if duplicate.is_some() {
        return Err(HandlerErr::validation(
            "student is already enrolled in this batch",
            None,
        ));
    }

    let method = get_payment_method(params)?;
    let payment_date = get_payment_date(params)?;
    let received_by = get_optional_str(params, "receivedBy").unwrap_or_else(|| "Admin".to_string());

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Capacity is re-counted inside the transaction so the check can
    // never run against a stale head count.
    let current_students = active_enrollment_count(&tx, &batch_id)?;
    if current_students >= max_students {
        return Err(HandlerErr::validation(
            "batch is full",
            Some(json!({
                "currentStudents": current_students,
                "maxStudents": max_students,
            })),
        ));
    }

    let enrollment = EnrollmentRow {
        id: uuid::Uuid::new_v4().to_string(),
        student_id,
        course_id,
        batch_id,
        total_fee_cents,
        paid_amount_cents: initial_cents,
        status: "active".to_string(),
        plan_total_installments: plan.map(|(t, _)| t),
        plan_installment_cents: plan.map(|(_, a)| a),
        plan_paid_installments: plan.map(|_| 0),
    };
    let created_at = chrono::Utc::now().to_rfc3339();

    tx.execute(
        "INSERT INTO enrollments(id, student_id, course_id, batch_id,
           total_fee_cents, paid_amount_cents, status,
           plan_total_installments, plan_installment_cents,
           plan_paid_installments, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &enrollment.id,
            &enrollment.student_id,
            &enrollment.course_id,
            &enrollment.batch_id,
            enrollment.total_fee_cents,
            enrollment.paid_amount_cents,
            &enrollment.status,
            enrollment.plan_total_installments,
            enrollment.plan_installment_cents,
            enrollment.plan_paid_installments,
            &created_at,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "enrollments" })),
    })?;

    // The payment references the id generated above, inside the same
    // transaction; it is never rediscovered by re-querying the list.
    let initial_voucher = if initial_cents > 0 {
        let (_, voucher) = insert_payment(
            &tx,
            &enrollment,
            initial_cents,
            &method,
            &payment_date,
            "Initial payment",
            &received_by,
            None,
        )?;
        Some(voucher)
    } else {
        None
    };

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut result = json!({ "enrollment": enrollment.to_json() });
    if let Some(voucher) = initial_voucher {
        result["initialVoucherNumber"] = json!(voucher);
    }
    Ok(result)
}

fn enrollments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT e.id, e.student_id, s.name, e.course_id, c.name,
           e.batch_id, b.batch_name, e.total_fee_cents, e.paid_amount_cents,
           e.status, e.plan_total_installments, e.plan_installment_cents,
           e.plan_paid_installments, e.created_at
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN courses c ON c.id = e.course_id
         JOIN course_batches b ON b.id = e.batch_id",
    );
    let mut args: Vec<Value> = Vec::new();
    let mut conds: Vec<&str> = Vec::new();
    if let Some(batch_id) = get_optional_str(params, "batchId") {
        conds.push("e.batch_id = ?");
        args.push(Value::Text(batch_id));
    }
    if let Some(student_id) = get_optional_str(params, "studentId") {
        conds.push("e.student_id = ?");
        args.push(Value::Text(student_id));
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    sql.push_str(" ORDER BY e.created_at");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            let total: i64 = r.get(7)?;
            let paid: i64 = r.get(8)?;
            let plan_total: Option<i64> = r.get(10)?;
            let plan_amount: Option<i64> = r.get(11)?;
            let plan_paid: Option<i64> = r.get(12)?;
            let plan = plan_total.map(|t| {
                json!({
                    "totalInstallments": t,
                    "installmentAmount": money::from_cents(plan_amount.unwrap_or(0)),
                    "paidInstallments": plan_paid.unwrap_or(0),
                })
            });
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "courseId": r.get::<_, String>(3)?,
                "courseName": r.get::<_, String>(4)?,
                "batchId": r.get::<_, String>(5)?,
                "batchName": r.get::<_, String>(6)?,
                "totalFee": money::from_cents(total),
                "paidAmount": money::from_cents(paid),
                "remainingAmount": money::from_cents(total - paid),
                "status": r.get::<_, String>(9)?,
                "installmentPlan": plan,
                "createdAt": r.get::<_, String>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "enrollments": rows }))
}

fn enrollments_update_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let status = get_required_str(params, "status")?;
    if !ENROLLMENT_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of: {}",
            ENROLLMENT_STATUSES.join(", ")
        )));
    }

    let updated = conn
        .execute(
            "UPDATE enrollments SET status = ? WHERE id = ?",
            (&status, &enrollment_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "enrollments" })),
        })?;
    if updated == 0 {
        return Err(HandlerErr::not_found("enrollment not found"));
    }

    Ok(json!({ "enrollmentId": enrollment_id, "status": status }))
}

fn enrollments_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    if load_enrollment(conn, &enrollment_id)?.is_none() {
        return Err(HandlerErr::not_found("enrollment not found"));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Payments belong to their enrollment; they go with it.
    tx.execute(
        "DELETE FROM course_payments WHERE enrollment_id = ?",
        [&enrollment_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_delete_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "course_payments" })),
    })?;
    tx.execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "enrollments" })),
        })?;

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true }))
}

fn payments_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let amount_cents = get_amount_cents(params, "amount")?
        .ok_or_else(|| HandlerErr::bad_params("missing amount"))?;
    if amount_cents <= 0 {
        return Err(HandlerErr::validation("amount must be positive", None));
    }
    let method = get_payment_method(params)?;
    let payment_date = get_payment_date(params)?;
    let description = get_optional_str(params, "description").unwrap_or_default();
    let received_by = get_optional_str(params, "receivedBy").unwrap_or_else(|| "Admin".to_string());
    let installment_number = match params.get("installmentNumber") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(v.as_u64().map(|n| n as i64).ok_or_else(|| {
            HandlerErr::bad_params("installmentNumber must be a positive integer")
        })?),
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    // Balance is read inside the transaction; a competing payment cannot
    // slip in between the check and the update.
    let Some(enrollment) = load_enrollment(&tx, &enrollment_id)? else {
        return Err(HandlerErr::not_found("enrollment not found"));
    };
    if amount_cents > enrollment.remaining_cents() {
        return Err(HandlerErr::validation(
            "payment exceeds remaining balance",
            Some(json!({
                "remainingAmount": money::from_cents(enrollment.remaining_cents()),
                "amount": money::from_cents(amount_cents),
            })),
        ));
    }

    if let Some(n) = installment_number {
        let Some(plan_total) = enrollment.plan_total_installments else {
            return Err(HandlerErr::validation(
                "enrollment has no installment plan",
                None,
            ));
        };
        if n < 1 || n > plan_total {
            return Err(HandlerErr::validation(
                "installmentNumber is outside the plan",
                Some(json!({ "totalInstallments": plan_total })),
            ));
        }
        let paid_installments = enrollment.plan_paid_installments.unwrap_or(0);
        if paid_installments >= plan_total {
            return Err(HandlerErr::validation(
                "all installments are already paid",
                None,
            ));
        }
    }

    let (payment_id, voucher_number) = insert_payment(
        &tx,
        &enrollment,
        amount_cents,
        &method,
        &payment_date,
        &description,
        &received_by,
        installment_number,
    )?;

    tx.execute(
        "UPDATE enrollments SET paid_amount_cents = paid_amount_cents + ? WHERE id = ?",
        (amount_cents, &enrollment.id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "enrollments" })),
    })?;
    if installment_number.is_some() {
        // Whole installments only; a partial amount never advances the
        // counter unless explicitly tagged.
        tx.execute(
            "UPDATE enrollments
             SET plan_paid_installments = plan_paid_installments + 1
             WHERE id = ?",
            [&enrollment.id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "enrollments" })),
        })?;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let updated = load_enrollment(conn, &enrollment_id)?
        .ok_or_else(|| HandlerErr::invariant("enrollment vanished after payment", None))?;
    Ok(json!({
        "paymentId": payment_id,
        "voucherNumber": voucher_number,
        "enrollment": updated.to_json(),
    }))
}

fn payments_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = get_required_str(params, "paymentId")?;

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let payment: Option<(String, i64, Option<i64>)> = tx
        .query_row(
            "SELECT enrollment_id, amount_cents, installment_number
             FROM course_payments WHERE id = ?",
            [&payment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((enrollment_id, amount_cents, installment_number)) = payment else {
        return Err(HandlerErr::not_found("payment not found"));
    };

    let Some(enrollment) = load_enrollment(&tx, &enrollment_id)? else {
        return Err(HandlerErr::invariant(
            "payment references a missing enrollment",
            Some(json!({ "enrollmentId": enrollment_id })),
        ));
    };

    // A reversal that would drive the balance negative means the books
    // were already wrong; refuse rather than clamp.
    if enrollment.paid_amount_cents - amount_cents < 0 {
        return Err(HandlerErr::invariant(
            "reversal would drive paidAmount negative",
            Some(json!({
                "paidAmount": money::from_cents(enrollment.paid_amount_cents),
                "amount": money::from_cents(amount_cents),
            })),
        ));
    }
    if installment_number.is_some() && enrollment.plan_paid_installments.unwrap_or(0) < 1 {
        return Err(HandlerErr::invariant(
            "reversal would drive paidInstallments negative",
            None,
        ));
    }

    tx.execute("DELETE FROM course_payments WHERE id = ?", [&payment_id])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "course_payments" })),
        })?;
    tx.execute(
        "UPDATE enrollments SET paid_amount_cents = paid_amount_cents - ? WHERE id = ?",
        (amount_cents, &enrollment_id),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "enrollments" })),
    })?;
    if installment_number.is_some() {
        tx.execute(
            "UPDATE enrollments
             SET plan_paid_installments = plan_paid_installments - 1
             WHERE id = ?",
            [&enrollment_id],
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "enrollments" })),
        })?;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let updated = load_enrollment(conn, &enrollment_id)?
        .ok_or_else(|| HandlerErr::invariant("enrollment vanished after reversal", None))?;
    Ok(json!({ "enrollment": updated.to_json() }))
}

fn payments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut sql = String::from(
        "SELECT p.id, p.enrollment_id, p.student_id, s.name, p.amount_cents,
           p.method, p.payment_date, p.voucher_number, p.description,
           p.received_by, p.installment_number
         FROM course_payments p
         JOIN students s ON s.id = p.student_id",
    );
    let mut args: Vec<Value> = Vec::new();
    let mut conds: Vec<&str> = Vec::new();
    if let Some(enrollment_id) = get_optional_str(params, "enrollmentId") {
        conds.push("p.enrollment_id = ?");
        args.push(Value::Text(enrollment_id));
    }
    if let Some(student_id) = get_optional_str(params, "studentId") {
        conds.push("p.student_id = ?");
        args.push(Value::Text(student_id));
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    sql.push_str(" ORDER BY p.voucher_number");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "enrollmentId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "studentName": r.get::<_, String>(3)?,
                "amount": money::from_cents(r.get::<_, i64>(4)?),
                "paymentMethod": r.get::<_, String>(5)?,
                "paymentDate": r.get::<_, String>(6)?,
                "voucherNumber": r.get::<_, String>(7)?,
                "description": r.get::<_, String>(8)?,
                "receivedBy": r.get::<_, String>(9)?,
                "installmentNumber": r.get::<_, Option<i64>>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    Ok(json!({ "payments": rows }))
}

/// Read-only receipt projection for external rendering. No state is
/// touched.
fn payments_voucher(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let voucher_number = get_required_str(params, "voucherNumber")?;

    let row = conn
        .query_row(
            "SELECT p.amount_cents, p.method, p.payment_date, p.description,
               p.received_by, p.installment_number,
               s.id, s.name, s.email, s.phone,
               c.id, c.name,
               b.id, b.batch_name, b.schedule,
               e.id, e.total_fee_cents, e.paid_amount_cents,
               e.plan_total_installments, e.plan_paid_installments
             FROM course_payments p
             JOIN enrollments e ON e.id = p.enrollment_id
             JOIN students s ON s.id = p.student_id
             JOIN courses c ON c.id = e.course_id
             JOIN course_batches b ON b.id = e.batch_id
             WHERE p.voucher_number = ?",
            [&voucher_number],
            |r| {
                let total: i64 = r.get(16)?;
                let paid: i64 = r.get(17)?;
                Ok(json!({
                    "voucherNumber": voucher_number,
                    "amount": money::from_cents(r.get::<_, i64>(0)?),
                    "paymentMethod": r.get::<_, String>(1)?,
                    "paymentDate": r.get::<_, String>(2)?,
                    "description": r.get::<_, String>(3)?,
                    "receivedBy": r.get::<_, String>(4)?,
                    "installmentNumber": r.get::<_, Option<i64>>(5)?,
                    "student": {
                        "id": r.get::<_, String>(6)?,
                        "name": r.get::<_, String>(7)?,
                        "email": r.get::<_, String>(8)?,
                        "phone": r.get::<_, String>(9)?,
                    },
                    "course": {
                        "id": r.get::<_, String>(10)?,
                        "name": r.get::<_, String>(11)?,
                    },
                    "batch": {
                        "id": r.get::<_, String>(12)?,
                        "batchName": r.get::<_, String>(13)?,
                        "schedule": r.get::<_, String>(14)?,
                    },
                    "enrollment": {
                        "id": r.get::<_, String>(15)?,
                        "totalFee": money::from_cents(total),
                        "paidAmount": money::from_cents(paid),
                        "remainingAmount": money::from_cents(total - paid),
                        "totalInstallments": r.get::<_, Option<i64>>(18)?,
                        "paidInstallments": r.get::<_, Option<i64>>(19)?,
                    },
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::db)?;

    row.ok_or_else(|| HandlerErr::not_found("no payment carries this voucher number"))
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
        "enrollments.create" => Some(with_conn(state, req, enrollments_create)),
        "enrollments.list" => Some(with_conn(state, req, enrollments_list)),
        "enrollments.updateStatus" => Some(with_conn(state, req, enrollments_update_status)),
        "enrollments.delete" => Some(with_conn(state, req, enrollments_delete)),
        "payments.record" => Some(with_conn(state, req, payments_record)),
        "payments.delete" => Some(with_conn(state, req, payments_delete)),
        "payments.list" => Some(with_conn(state, req, payments_list)),
        "payments.voucher" => Some(with_conn(state, req, payments_voucher)),
        _ => None,
    }
}
