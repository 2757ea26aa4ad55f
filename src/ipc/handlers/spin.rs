use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_admin, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// Scope students minus the spun set, re-derived fresh on every call.
fn eligible_pool(conn: &Connection, admin_id: &str) -> Result<Vec<(String, String)>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.student_id, s.name
         FROM students s
         WHERE s.owner_admin_id = ?
           AND NOT EXISTS (
             SELECT 1 FROM spun_students sp
             WHERE sp.owner_admin_id = s.owner_admin_id
               AND sp.student_ref = s.student_id
           )
         ORDER BY s.student_id",
    )?;
    stmt.query_map([admin_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::from)
}

fn pick(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tx = conn.unchecked_transaction()?;
    let pool = eligible_pool(&tx, admin_id)?;
    if pool.is_empty() {
        return Err(HandlerErr::new(
            "no_eligible_students",
            "every student has already been selected",
        ));
    }

    let idx = rand::rng().random_range(0..pool.len());
    let (student_ref, name) = pool[idx].clone();

    // The primary key makes a concurrent double-pick fail closed instead of
    // crowning the same winner twice.
    tx.execute(
        "INSERT INTO spun_students(owner_admin_id, student_ref, name, created_at)
         VALUES(?, ?, ?, ?)",
        (admin_id, &student_ref, &name, db::now()),
    )
    .map_err(|e| match HandlerErr::from(e) {
        e if e.code == "conflict" => HandlerErr::conflict("student was already selected"),
        e => e,
    })?;
    tx.commit()?;

    Ok(json!({
        "winner": { "studentId": student_ref, "name": name },
        "remaining": pool.len() - 1,
    }))
}

fn reset(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let cleared = conn.execute(
        "DELETE FROM spun_students WHERE owner_admin_id = ?",
        [admin_id],
    )?;
    Ok(json!({ "success": true, "cleared": cleared }))
}

fn eligible(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let pool = eligible_pool(conn, admin_id)?;
    let students: Vec<serde_json::Value> = pool
        .into_iter()
        .map(|(student_ref, name)| json!({ "studentId": student_ref, "name": name }))
        .collect();
    Ok(json!({ "students": students }))
}

fn history(
    conn: &Connection,
    admin_id: &str,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT student_ref, name, created_at
         FROM spun_students
         WHERE owner_admin_id = ?
         ORDER BY created_at DESC",
    )?;
    let entries = stmt
        .query_map([admin_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "spunAt": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "entries": entries }))
}

/// Exclude marks students ineligible without a win; include restores
/// eligibility.
fn exclusions(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mode = get_required_str(params, "mode")?;
    if mode != "exclude" && mode != "include" {
        return Err(HandlerErr::bad_params("mode must be exclude or include"));
    }
    let Some(ids) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing studentIds"));
    };
    let student_refs: Vec<String> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if student_refs.is_empty() {
        return Err(HandlerErr::bad_params("no studentIds provided"));
    }

    let tx = conn.unchecked_transaction()?;
    let mut changed = 0usize;
    for student_ref in &student_refs {
        if mode == "exclude" {
            let name: Option<String> = tx
                .query_row(
                    "SELECT name FROM students WHERE owner_admin_id = ? AND student_id = ?",
                    (admin_id, student_ref),
                    |r| r.get(0),
                )
                .optional()?;
            let Some(name) = name else {
                // Only scope students can be excluded; skip unknowns.
                continue;
            };
            changed += tx.execute(
                "INSERT OR IGNORE INTO spun_students(owner_admin_id, student_ref, name, created_at)
                 VALUES(?, ?, ?, ?)",
                (admin_id, student_ref, &name, db::now()),
            )?;
        } else {
            changed += tx.execute(
                "DELETE FROM spun_students WHERE owner_admin_id = ? AND student_ref = ?",
                (admin_id, student_ref),
            )?;
        }
    }
    tx.commit()?;

    Ok(json!({ "success": true, "mode": mode, "changed": changed }))
}

fn remove_history(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let removed = conn.execute(
        "DELETE FROM spun_students WHERE owner_admin_id = ? AND student_ref = ?",
        (admin_id, &student_ref),
    )?;
    if removed == 0 {
        return Err(HandlerErr::not_found("no spin entry for this student"));
    }
    Ok(json!({ "success": true, "studentId": student_ref }))
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
        "spin.pick" => Some(handle_scoped(state, req, pick)),
        "spin.reset" => Some(handle_scoped(state, req, reset)),
        "spin.eligible" => Some(handle_scoped(state, req, eligible)),
        "spin.history" => Some(handle_scoped(state, req, history)),
        "spin.exclusions" => Some(handle_scoped(state, req, exclusions)),
        "spin.removeHistory" => Some(handle_scoped(state, req, remove_history)),
        _ => None,
    }
}
