use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, parse_date_key, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};

const STATUSES: [&str; 3] = ["present", "absent", "on-duty"];

/// A date is locked for a scope once every student in that scope has a
/// record for it. Derived, never stored.
fn is_locked(conn: &Connection, admin_id: &str, date: &str) -> Result<bool, HandlerErr> {
    let students: i64 = conn.query_row(
        "SELECT COUNT(*) FROM students WHERE owner_admin_id = ?",
        [admin_id],
        |r| r.get(0),
    )?;
    if students == 0 {
        return Ok(false);
    }
    let records: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attendance WHERE owner_admin_id = ? AND date = ?",
        (admin_id, date),
        |r| r.get(0),
    )?;
    Ok(records >= students)
}

fn get_for_date(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_key(&get_required_str(params, "date")?)?;

    let mut stmt = conn.prepare(
        "SELECT id, student_ref, status, updated_at, created_at
         FROM attendance
         WHERE owner_admin_id = ? AND date = ?
         ORDER BY student_ref",
    )?;
    let records = stmt
        .query_map((admin_id, &date), |r| {
            let updated: Option<String> = r.get(3)?;
            let created: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "recordedAt": updated.unwrap_or(created),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(json!({
        "date": date,
        "records": records,
        "locked": is_locked(conn, admin_id, &date)?,
    }))
}

fn upsert_batch(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_key(&get_required_str(params, "date")?)?;
    let Some(items) = params.get("items").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing items"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("no items provided"));
    }

    if is_locked(conn, admin_id, &date)? {
        return Err(HandlerErr {
            code: "conflict",
            message: "attendance for this date is locked".to_string(),
            details: Some(json!({ "reason": "attendance_locked", "date": date })),
        });
    }

    let tx = conn.unchecked_transaction()?;
    let mut processed = 0usize;
    let mut errors = 0usize;
    let mut error_details: Vec<serde_json::Value> = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let student_ref = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_uppercase())
            .unwrap_or_default();
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if student_ref.is_empty() {
            errors += 1;
            error_details.push(json!({ "index": i, "message": "missing studentId" }));
            continue;
        }
        if !STATUSES.contains(&status) {
            errors += 1;
            error_details.push(json!({
                "index": i,
                "message": "status must be present, absent or on-duty"
            }));
            continue;
        }
        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM students WHERE owner_admin_id = ? AND student_id = ?",
                (admin_id, &student_ref),
                |r| r.get(0),
            )
            .optional()?;
        if owned.is_none() {
            errors += 1;
            error_details.push(json!({ "index": i, "message": "student not in scope" }));
            continue;
        }

        let upsert = tx.execute(
            "INSERT INTO attendance(id, student_ref, date, status, owner_admin_id, created_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_admin_id, student_ref, date) DO UPDATE SET
               status = excluded.status,
               updated_at = excluded.created_at",
            (
                Uuid::new_v4().to_string(),
                &student_ref,
                &date,
                status,
                admin_id,
                db::now(),
            ),
        );
        if let Err(e) = upsert {
            errors += 1;
            error_details.push(json!({ "index": i, "message": e.to_string() }));
            continue;
        }
        processed += 1;
    }
    tx.commit()?;

    Ok(json!({
        "success": true,
        "date": date,
        "processed": processed,
        "errors": errors,
        "errorDetails": error_details,
        "locked": is_locked(conn, admin_id, &date)?,
    }))
}

fn summary(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT date, COUNT(*)
         FROM attendance
         WHERE owner_admin_id = ?
         GROUP BY date
         ORDER BY date DESC",
    )?;
    let dates = stmt
        .query_map([admin_id], |r| {
            Ok(json!({
                "date": r.get::<_, String>(0)?,
                "count": r.get::<_, i64>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "dates": dates }))
}

fn delete_for_date(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_key(&get_required_str(params, "date")?)?;
    let deleted = conn.execute(
        "DELETE FROM attendance WHERE owner_admin_id = ? AND date = ?",
        (admin_id, &date),
    )?;
    Ok(json!({ "success": true, "date": date, "deleted": deleted }))
}

fn locked(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = parse_date_key(&get_required_str(params, "date")?)?;
    Ok(json!({ "date": date, "locked": is_locked(conn, admin_id, &date)? }))
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
        "attendance.getForDate" => Some(handle_scoped(state, req, get_for_date)),
        "attendance.upsertBatch" => Some(handle_scoped(state, req, upsert_batch)),
        "attendance.summary" => Some(handle_scoped(state, req, summary)),
        "attendance.deleteForDate" => Some(handle_scoped(state, req, delete_for_date)),
        "attendance.isLocked" => Some(handle_scoped(state, req, locked)),
        _ => None,
    }
}
