use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_admin, require_student, HandlerErr};
use crate::ipc::types::{AppState, Request};

const CATEGORIES: [&str; 4] = ["general", "question", "concern", "suggestion"];
const MAX_MESSAGE_LEN: usize = 1000;

fn feedback_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "category": r.get::<_, String>(3)?,
        "message": r.get::<_, String>(4)?,
        "status": r.get::<_, String>(5)?,
        "read": r.get::<_, i64>(6)? != 0,
        "date": r.get::<_, String>(7)?,
    }))
}

fn fetch_feedback(conn: &Connection, id: &str) -> Result<Option<serde_json::Value>, HandlerErr> {
    conn.query_row(
        "SELECT id, student_ref, student_name, category, message, status, read, created_at
         FROM feedback WHERE id = ?",
        [id],
        feedback_row_json,
    )
    .optional()
    .map_err(HandlerErr::from)
}

/// Submission resolves the owning admin through the student's profile at
/// submission time; the display name is denormalized alongside.
fn submit(
    conn: &Connection,
    student_username: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let category = get_required_str(params, "category")?;
    if !CATEGORIES.contains(&category.as_str()) {
        return Err(HandlerErr::bad_params(
            "category must be general, question, concern or suggestion",
        ));
    }
    let message = get_required_str(params, "message")?;
    if message.chars().count() > MAX_MESSAGE_LEN {
        return Err(HandlerErr::bad_params("message is too long"));
    }

    let profile: Option<(String, String)> = conn
        .query_row(
            "SELECT name, owner_admin_id FROM students
             WHERE student_id = ?
             ORDER BY created_at LIMIT 1",
            [student_username],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((student_name, owner_admin_id)) = profile else {
        return Err(HandlerErr::not_found("no student profile for this login"));
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO feedback(id, student_ref, student_name, category, message, status, read, owner_admin_id, created_at)
         VALUES(?, ?, ?, ?, ?, 'new', 0, ?, ?)",
        (
            &id,
            student_username,
            &student_name,
            &category,
            &message,
            &owner_admin_id,
            db::now(),
        ),
    )?;

    fetch_feedback(conn, &id)?.ok_or_else(|| HandlerErr::not_found("feedback not found"))
}

fn list(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, student_ref, student_name, category, message, status, read, created_at
         FROM feedback
         WHERE owner_admin_id = ?
         ORDER BY created_at DESC",
    )?;
    let feedbacks = stmt
        .query_map([admin_id], feedback_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "feedbacks": feedbacks }))
}

/// Distinguish someone else's feedback (forbidden) from a missing id
/// (not_found) after a scoped update matched nothing.
fn owned_update_guard(conn: &Connection, id: &str, changed: usize) -> Result<(), HandlerErr> {
    if changed > 0 {
        return Ok(());
    }
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM feedback WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        Err(HandlerErr::forbidden("not authorized for this feedback"))
    } else {
        Err(HandlerErr::not_found("feedback not found"))
    }
}

/// Idempotent: a second call is a no-op that reports the same end state.
fn mark_read(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "UPDATE feedback SET read = 1, status = 'reviewed'
         WHERE id = ? AND owner_admin_id = ?",
        (&id, admin_id),
    )?;
    owned_update_guard(conn, &id, changed)?;
    fetch_feedback(conn, &id)?.ok_or_else(|| HandlerErr::not_found("feedback not found"))
}

fn delete(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "DELETE FROM feedback WHERE id = ? AND owner_admin_id = ?",
        (&id, admin_id),
    )?;
    owned_update_guard(conn, &id, changed)?;
    Ok(json!({ "success": true, "id": id }))
}

fn bulk_delete(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(ids) = params.get("ids").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing ids"));
    };
    let ids: Vec<String> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(HandlerErr::bad_params("no ids provided"));
    }

    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0usize;
    let mut errors = 0usize;
    let mut error_details: Vec<serde_json::Value> = Vec::new();
    for id in &ids {
        let changed = tx.execute(
            "DELETE FROM feedback WHERE id = ? AND owner_admin_id = ?",
            (id, admin_id),
        )?;
        if changed == 0 {
            errors += 1;
            error_details.push(json!({ "id": id, "message": "not found in scope" }));
        } else {
            deleted += changed;
        }
    }
    tx.commit()?;

    Ok(json!({
        "success": true,
        "deleted": deleted,
        "errors": errors,
        "errorDetails": error_details,
    }))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_student(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match submit(conn, &caller.username, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_scoped(
    state: &mut AppState,
    req: &Request,
    run: fn(&Connection, &str, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match run(conn, &caller.credential_id, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feedback.submit" => Some(handle_submit(state, req)),
        "feedback.list" => Some(handle_scoped(state, req, list)),
        "feedback.markRead" => Some(handle_scoped(state, req, mark_read)),
        "feedback.delete" => Some(handle_scoped(state, req, delete)),
        "feedback.bulkDelete" => Some(handle_scoped(state, req, bulk_delete)),
        _ => None,
    }
}
