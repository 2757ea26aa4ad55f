use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Caller, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("bad_params", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> HandlerErr {
        HandlerErr::new("conflict", message)
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

// Uniqueness violations surface as conflict; everything else is a generic
// datastore failure.
impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> HandlerErr {
        if let rusqlite::Error::SqliteFailure(f, _) = &e {
            if f.code == rusqlite::ErrorCode::ConstraintViolation {
                return HandlerErr::conflict(e.to_string());
            }
        }
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the session token in params to its authenticated caller.
pub fn require_caller(state: &AppState, params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let token = params
        .get("session")
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::unauthorized("missing session"))?;
    state
        .sessions
        .get(token)
        .cloned()
        .ok_or_else(|| HandlerErr::unauthorized("unknown or expired session"))
}

pub fn require_admin(state: &AppState, params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let caller = require_caller(state, params)?;
    if caller.role != Role::Admin {
        return Err(HandlerErr::forbidden("admin session required"));
    }
    Ok(caller)
}

pub fn require_master(state: &AppState, params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let caller = require_caller(state, params)?;
    if caller.role != Role::Master {
        return Err(HandlerErr::forbidden("master session required"));
    }
    Ok(caller)
}

pub fn require_student(state: &AppState, params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let caller = require_caller(state, params)?;
    if caller.role != Role::Student {
        return Err(HandlerErr::forbidden("student session required"));
    }
    Ok(caller)
}

/// Calendar day key, no time component.
pub fn parse_date_key(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    let bytes = t.as_bytes();
    let shape_ok = bytes.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-';
    if !shape_ok || chrono::NaiveDate::parse_from_str(t, "%Y-%m-%d").is_err() {
        return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
    }
    Ok(t.to_string())
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub student_id: String,
    pub points: i64,
    pub section: Option<String>,
    pub batch: Option<String>,
    pub git_link: Option<String>,
    pub created_at: String,
}

pub fn student_json(s: &StudentRow) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "studentId": s.student_id,
        "points": s.points,
        "section": s.section,
        "batch": s.batch,
        "gitLink": s.git_link,
        "createdAt": s.created_at,
    })
}

pub fn find_scoped_student(
    conn: &Connection,
    admin_id: &str,
    student_ref: &str,
) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, student_id, points, section, batch, git_link, created_at
         FROM students
         WHERE owner_admin_id = ? AND student_id = ?",
        (admin_id, student_ref),
        row_to_student,
    )
    .optional()
    .map_err(HandlerErr::from)
}

/// Scoped lookup that distinguishes "someone else's student" (forbidden)
/// from "no such student anywhere" (not_found).
pub fn require_scoped_student(
    conn: &Connection,
    admin_id: &str,
    student_ref: &str,
) -> Result<StudentRow, HandlerErr> {
    if let Some(s) = find_scoped_student(conn, admin_id, student_ref)? {
        return Ok(s);
    }
    let elsewhere: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ? LIMIT 1",
            [student_ref],
            |r| r.get(0),
        )
        .optional()?;
    if elsewhere.is_some() {
        Err(HandlerErr::forbidden("not authorized for this student"))
    } else {
        Err(HandlerErr::not_found("student not found"))
    }
}

pub fn row_to_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        name: r.get(1)?,
        student_id: r.get(2)?,
        points: r.get(3)?,
        section: r.get(4)?,
        batch: r.get(5)?,
        git_link: r.get(6)?,
        created_at: r.get(7)?,
    })
}
