use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILENAME: &str = "training.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILENAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            duration_hours INTEGER NOT NULL,
            price_cents INTEGER NOT NULL,
            admission_fee_cents INTEGER,
            registration_fee_cents INTEGER,
            exam_fee_cents INTEGER,
            max_students INTEGER NOT NULL,
            status TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_batches(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            batch_name TEXT NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            schedule TEXT NOT NULL,
            max_students INTEGER NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_batches_course ON course_batches(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT NOT NULL,
            address TEXT NOT NULL,
            date_of_birth TEXT,
            emergency_contact TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // paid_amount_cents is the stored running total; remaining is always
    // derived as total_fee_cents - paid_amount_cents. One enrollment per
    // (student, course, batch) triple.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            total_fee_cents INTEGER NOT NULL,
            paid_amount_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            plan_total_installments INTEGER,
            plan_installment_cents INTEGER,
            plan_paid_installments INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(batch_id) REFERENCES course_batches(id),
            UNIQUE(student_id, course_id, batch_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_batch ON enrollments(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    // student_id is denormalized from the enrollment for query convenience
    // and is always written from the enrollment row, never from params.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_payments(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            method TEXT NOT NULL,
            payment_date TEXT NOT NULL,
            voucher_number TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            received_by TEXT NOT NULL,
            installment_number INTEGER,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_payments_enrollment ON course_payments(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_payments_student ON course_payments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_sessions(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            date TEXT NOT NULL,
            topic TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            instructor TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES course_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_batch ON attendance_sessions(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_date ON attendance_sessions(batch_id, date)",
        [],
    )?;

    // A missing row reads as 'absent'; rows are upserted in place and
    // never deleted individually.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES attendance_sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let v = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get::<_, String>(0)
        })
        .optional()?;
    Ok(v)
}

pub fn settings_set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, value),
    )?;
    Ok(())
}

const VOUCHER_SEQ_KEY: &str = "ledger.voucher_seq";

/// Allocates the next voucher number. Must be called inside the same
/// transaction as the payment insert so the counter can never skip or
/// repeat on a failed write.
pub fn next_voucher_number(conn: &Connection) -> anyhow::Result<String> {
    let current: u64 = settings_get(conn, VOUCHER_SEQ_KEY)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let next = current + 1;
    settings_set(conn, VOUCHER_SEQ_KEY, &next.to_string())?;
    Ok(crate::money::format_voucher_number(next))
}
