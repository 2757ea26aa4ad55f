use rusqlite::Connection;
use std::path::Path;

use crate::auth;

pub const DB_FILE: &str = "studentspark.sqlite3";

pub fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS credentials(
            id TEXT PRIMARY KEY,
            realm TEXT NOT NULL CHECK(realm IN ('staff','student')),
            username TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('master','admin','student')),
            approved INTEGER NOT NULL DEFAULT 0,
            last_login TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(realm, username)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            student_id TEXT NOT NULL,
            points INTEGER NOT NULL DEFAULT 0 CHECK(points >= 0),
            section TEXT,
            batch TEXT,
            git_link TEXT,
            owner_admin_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(owner_admin_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_owner ON students(owner_admin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_student_id ON students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS point_transactions(
            id TEXT PRIMARY KEY,
            student_ref TEXT NOT NULL,
            points_delta INTEGER NOT NULL,
            reason TEXT NOT NULL,
            owner_admin_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_point_transactions_student ON point_transactions(student_ref)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_point_transactions_owner ON point_transactions(owner_admin_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_ref TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('present','absent','on-duty')),
            owner_admin_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            UNIQUE(owner_admin_id, student_ref, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_owner_date ON attendance(owner_admin_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback(
            id TEXT PRIMARY KEY,
            student_ref TEXT NOT NULL,
            student_name TEXT NOT NULL,
            category TEXT NOT NULL CHECK(category IN ('general','question','concern','suggestion')),
            message TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new' CHECK(status IN ('new','reviewed')),
            read INTEGER NOT NULL DEFAULT 0,
            owner_admin_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_owner ON feedback(owner_admin_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_student ON feedback(student_ref)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS spun_students(
            owner_admin_id TEXT NOT NULL,
            student_ref TEXT NOT NULL,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(owner_admin_id, student_ref)
        )",
        [],
    )?;

    // Workspaces created before ownership scoping may carry NULL-owner rows.
    backfill_attendance_owner(&conn)?;
    backfill_feedback_owner(&conn)?;

    ensure_master_credential(&conn)?;

    Ok(conn)
}

/// Assign owners to pre-scoping attendance rows by resolving the student's
/// owning admin. Rows whose register number no longer matches any student
/// stay unscoped and are invisible to every scope.
fn backfill_attendance_owner(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE attendance SET owner_admin_id = (
            SELECT s.owner_admin_id FROM students s
            WHERE s.student_id = attendance.student_ref
            ORDER BY s.created_at LIMIT 1
         )
         WHERE owner_admin_id IS NULL
           AND EXISTS (SELECT 1 FROM students s WHERE s.student_id = attendance.student_ref)",
        [],
    )?;
    Ok(())
}

fn backfill_feedback_owner(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE feedback SET owner_admin_id = (
            SELECT s.owner_admin_id FROM students s
            WHERE s.student_id = feedback.student_ref
            ORDER BY s.created_at LIMIT 1
         )
         WHERE owner_admin_id IS NULL
           AND EXISTS (SELECT 1 FROM students s WHERE s.student_id = feedback.student_ref)",
        [],
    )?;
    Ok(())
}

/// Fresh workspaces get a master account so admin approval is possible at
/// all. The password matches the original seed and is expected to be rotated
/// through master.updateAdminUser.
fn ensure_master_credential(conn: &Connection) -> anyhow::Result<()> {
    let masters: i64 = conn.query_row(
        "SELECT COUNT(*) FROM credentials WHERE role = 'master'",
        [],
        |r| r.get(0),
    )?;
    if masters > 0 {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO credentials(id, realm, username, password_hash, role, approved, created_at)
         VALUES(?, 'staff', 'master', ?, 'master', 1, ?)",
        (
            uuid::Uuid::new_v4().to_string(),
            auth::hash_password("master123"),
            now(),
        ),
    )?;
    Ok(())
}
