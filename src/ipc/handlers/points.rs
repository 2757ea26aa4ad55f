use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, require_admin, require_scoped_student, student_json,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn record_transaction(
    conn: &Connection,
    admin_id: &str,
    student_ref: &str,
    delta: i64,
    reason: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO point_transactions(id, student_ref, points_delta, reason, owner_admin_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            student_ref,
            delta,
            reason,
            admin_id,
            db::now(),
        ),
    )?;
    Ok(())
}

fn get_amount(params: &serde_json::Value) -> Result<i64, HandlerErr> {
    let amount = params
        .get("amount")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("amount must be an integer"))?;
    if amount <= 0 {
        return Err(HandlerErr::bad_params("positive amount is required"));
    }
    Ok(amount)
}

/// Overwrite the running total. The ledger records the true signed delta
/// (new minus old), so set/add stay additive.
fn set_points(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let reason = get_required_str(params, "reason")?;
    let new_points = params
        .get("points")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("points must be an integer"))?;
    if new_points < 0 {
        return Err(HandlerErr::bad_params("points must not be negative"));
    }

    let tx = conn.unchecked_transaction()?;
    let current = require_scoped_student(&tx, admin_id, &student_ref)?;
    tx.execute(
        "UPDATE students SET points = ?, updated_at = ? WHERE owner_admin_id = ? AND student_id = ?",
        (new_points, db::now(), admin_id, &student_ref),
    )?;
    record_transaction(&tx, admin_id, &student_ref, new_points - current.points, &reason)?;
    tx.commit()?;

    let updated = require_scoped_student(conn, admin_id, &student_ref)?;
    Ok(student_json(&updated))
}

fn add_points(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let amount = get_amount(params)?;
    let reason = get_optional_str(params, "reason").unwrap_or_else(|| "Added by admin".to_string());

    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE students SET points = points + ?, updated_at = ?
         WHERE owner_admin_id = ? AND student_id = ?",
        (amount, db::now(), admin_id, &student_ref),
    )?;
    if changed == 0 {
        // Distinguish someone else's student from a missing one.
        return Err(require_scoped_student(&tx, admin_id, &student_ref)
            .err()
            .unwrap_or_else(|| HandlerErr::not_found("student not found")));
    }
    record_transaction(&tx, admin_id, &student_ref, amount, &reason)?;
    tx.commit()?;

    let updated = require_scoped_student(conn, admin_id, &student_ref)?;
    Ok(student_json(&updated))
}

/// Deduct with a floor of zero. The ledger keeps the full -amount even when
/// the balance clamps; the running total is the source of truth.
fn minus_points(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let amount = get_amount(params)?;
    let reason =
        get_optional_str(params, "reason").unwrap_or_else(|| "Deducted by admin".to_string());

    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE students SET points = MAX(0, points - ?), updated_at = ?
         WHERE owner_admin_id = ? AND student_id = ?",
        (amount, db::now(), admin_id, &student_ref),
    )?;
    if changed == 0 {
        return Err(require_scoped_student(&tx, admin_id, &student_ref)
            .err()
            .unwrap_or_else(|| HandlerErr::not_found("student not found")));
    }
    record_transaction(&tx, admin_id, &student_ref, -amount, &reason)?;
    tx.commit()?;

    let updated = require_scoped_student(conn, admin_id, &student_ref)?;
    Ok(student_json(&updated))
}

fn list_transactions(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_filter = get_optional_str(params, "studentId").map(|s| s.to_uppercase());

    let mut stmt;
    let rows = match &student_filter {
        Some(student_ref) => {
            stmt = conn.prepare(
                "SELECT id, student_ref, points_delta, reason, created_at
                 FROM point_transactions
                 WHERE owner_admin_id = ? AND student_ref = ?
                 ORDER BY created_at DESC",
            )?;
            stmt.query_map((admin_id, student_ref), tx_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?
        }
        None => {
            stmt = conn.prepare(
                "SELECT id, student_ref, points_delta, reason, created_at
                 FROM point_transactions
                 WHERE owner_admin_id = ?
                 ORDER BY created_at DESC",
            )?;
            stmt.query_map([admin_id], tx_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())?
        }
    };
    Ok(json!({ "transactions": rows }))
}

fn tx_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "pointsDelta": r.get::<_, i64>(2)?,
        "reason": r.get::<_, String>(3)?,
        "date": r.get::<_, String>(4)?,
    }))
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
        "points.set" => Some(handle_scoped(state, req, set_points)),
        "points.add" => Some(handle_scoped(state, req, add_points)),
        "points.minus" => Some(handle_scoped(state, req, minus_points)),
        "transactions.list" => Some(handle_scoped(state, req, list_transactions)),
        _ => None,
    }
}
