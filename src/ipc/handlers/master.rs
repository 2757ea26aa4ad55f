use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, require_master, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn admins_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, username, approved, last_login
         FROM credentials
         WHERE role = 'admin'
         ORDER BY username",
    )?;
    let admins = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "role": "admin",
                "approved": r.get::<_, i64>(2)? != 0,
                "lastLogin": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "admins": admins }))
}

fn admin_approve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let changed = conn.execute(
        "UPDATE credentials SET approved = 1 WHERE id = ? AND role = 'admin'",
        [&id],
    )?;
    if changed == 0 {
        return Err(HandlerErr::not_found("admin not found"));
    }
    let username: String = conn.query_row(
        "SELECT username FROM credentials WHERE id = ?",
        [&id],
        |r| r.get(0),
    )?;
    Ok(json!({ "id": id, "username": username, "approved": true }))
}

fn scope_students(conn: &Connection, admin_id: &str) -> Result<Vec<(String, String)>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT name, student_id FROM students WHERE owner_admin_id = ? ORDER BY student_id",
    )?;
    stmt.query_map([admin_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::from)
}

fn find_admin(conn: &Connection, id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT username FROM credentials WHERE id = ? AND role = 'admin'",
        [id],
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::from)
}

fn admin_preview_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let Some(username) = find_admin(conn, &id)? else {
        return Err(HandlerErr::not_found("admin not found"));
    };
    let students: Vec<serde_json::Value> = scope_students(conn, &id)?
        .into_iter()
        .map(|(name, student_ref)| json!({ "name": name, "studentId": student_ref }))
        .collect();
    Ok(json!({
        "admin": { "id": id, "username": username },
        "students": students,
    }))
}

/// Deleting an admin removes the whole scope: students, their logins where
/// no other admin still references them, feedback, transactions, attendance
/// and spin history.
fn admin_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let Some(username) = find_admin(conn, &id)? else {
        return Err(HandlerErr::not_found("admin not found"));
    };
    let student_refs: Vec<String> = scope_students(conn, &id)?
        .into_iter()
        .map(|(_, student_ref)| student_ref)
        .collect();

    let tx = conn.unchecked_transaction()?;
    let students_deleted = tx.execute("DELETE FROM students WHERE owner_admin_id = ?", [&id])?;
    let mut student_users_deleted = 0usize;
    for student_ref in &student_refs {
        student_users_deleted += tx.execute(
            "DELETE FROM credentials
             WHERE realm = 'student' AND username = ?
               AND NOT EXISTS (SELECT 1 FROM students s WHERE s.student_id = ?)",
            (student_ref, student_ref),
        )?;
    }
    let feedbacks_deleted = tx.execute("DELETE FROM feedback WHERE owner_admin_id = ?", [&id])?;
    let transactions_deleted = tx.execute(
        "DELETE FROM point_transactions WHERE owner_admin_id = ?",
        [&id],
    )?;
    let attendance_deleted =
        tx.execute("DELETE FROM attendance WHERE owner_admin_id = ?", [&id])?;
    tx.execute("DELETE FROM spun_students WHERE owner_admin_id = ?", [&id])?;
    tx.execute("DELETE FROM credentials WHERE id = ?", [&id])?;
    tx.commit()?;

    Ok(json!({
        "success": true,
        "deleted": {
            "admin": { "id": id, "username": username },
            "students": student_refs,
        },
        "meta": {
            "studentsDeleted": students_deleted,
            "studentUsersDeleted": student_users_deleted,
            "feedbacksDeleted": feedbacks_deleted,
            "transactionsDeleted": transactions_deleted,
            "attendanceDeleted": attendance_deleted,
        }
    }))
}

fn update_user(
    conn: &Connection,
    realm: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let mut username = get_optional_str(params, "username");
    let password = get_optional_str(params, "password");
    if username.is_none() && password.is_none() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    if realm == "student" {
        username = username.map(|u| u.to_uppercase());
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM credentials WHERE id = ? AND realm = ?",
            (&id, realm),
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("user not found"));
    }

    if let Some(u) = &username {
        conn.execute("UPDATE credentials SET username = ? WHERE id = ?", (u, &id))
            .map_err(|e| match HandlerErr::from(e) {
                e if e.code == "conflict" => HandlerErr::conflict("username already exists"),
                e => e,
            })?;
    }
    if let Some(p) = &password {
        conn.execute(
            "UPDATE credentials SET password_hash = ? WHERE id = ?",
            (auth::hash_password(p), &id),
        )?;
    }

    conn.query_row(
        "SELECT id, username, role, approved FROM credentials WHERE id = ?",
        [&id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "role": r.get::<_, String>(2)?,
                "approved": r.get::<_, i64>(3)? != 0,
            }))
        },
    )
    .map_err(HandlerErr::from)
}

fn update_admin_user(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    update_user(conn, "staff", params)
}

fn update_student_user(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    update_user(conn, "student", params)
}

fn stats(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let total_students: i64 =
        conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
    let total_admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM credentials WHERE role = 'admin'",
        [],
        |r| r.get(0),
    )?;
    let pending_admins: i64 = conn.query_row(
        "SELECT COUNT(*) FROM credentials WHERE role = 'admin' AND approved = 0",
        [],
        |r| r.get(0),
    )?;
    let total_feedback: i64 =
        conn.query_row("SELECT COUNT(*) FROM feedback", [], |r| r.get(0))?;
    Ok(json!({
        "totalStudents": total_students,
        "totalAdmins": total_admins,
        "pendingAdmins": pending_admins,
        "totalFeedback": total_feedback,
    }))
}

fn handle_master(
    state: &mut AppState,
    req: &Request,
    run: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    if let Err(e) = require_master(state, &req.params) {
        return e.response(&req.id);
    }
    let outcome = {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        run(conn, &req.params)
    };
    match outcome {
        Ok(result) => {
            // A deleted or renamed credential must not keep a live session.
            if req.method == "master.adminDelete" {
                if let Some(deleted_id) = result
                    .get("deleted")
                    .and_then(|d| d.get("admin"))
                    .and_then(|a| a.get("id"))
                    .and_then(|v| v.as_str())
                {
                    state
                        .sessions
                        .retain(|_, caller| caller.credential_id != deleted_id);
                }
            }
            ok(&req.id, result)
        }
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "master.adminsList" => Some(handle_master(state, req, admins_list)),
        "master.adminApprove" => Some(handle_master(state, req, admin_approve)),
        "master.adminPreviewDelete" => Some(handle_master(state, req, admin_preview_delete)),
        "master.adminDelete" => Some(handle_master(state, req, admin_delete)),
        "master.updateAdminUser" => Some(handle_master(state, req, update_admin_user)),
        "master.updateStudentUser" => Some(handle_master(state, req, update_student_user)),
        "master.stats" => Some(handle_master(state, req, stats)),
        _ => None,
    }
}
