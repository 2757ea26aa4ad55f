use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    find_scoped_student, get_optional_str, get_required_str, require_admin, require_caller,
    require_scoped_student, row_to_student, student_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request, Role};

fn list_students(
    conn: &Connection,
    admin_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, name, student_id, points, section, batch, git_link, created_at
         FROM students
         WHERE owner_admin_id = ?
         ORDER BY student_id",
    )?;
    let students = stmt
        .query_map([admin_id], row_to_student)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({
        "students": students.iter().map(student_json).collect::<Vec<_>>()
    }))
}

/// Create or reset the student login for a register number. Returns the
/// plaintext that was stored so the caller can hand it to the student.
fn upsert_student_login(
    conn: &Connection,
    student_ref: &str,
    plain: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO credentials(id, realm, username, password_hash, role, approved, created_at)
         VALUES(?, 'student', ?, ?, 'student', 1, ?)
         ON CONFLICT(realm, username) DO UPDATE SET
           password_hash = excluded.password_hash",
        (
            Uuid::new_v4().to_string(),
            student_ref,
            auth::hash_password(plain),
            db::now(),
        ),
    )?;
    Ok(())
}

fn student_login_exists(conn: &Connection, student_ref: &str) -> Result<bool, HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM credentials WHERE realm = 'student' AND username = ?",
            [student_ref],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn create_student(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let section = get_optional_str(params, "section");
    let batch = get_optional_str(params, "batch");
    let git_link = get_optional_str(params, "gitLink");
    let provided_password = get_optional_str(params, "password").filter(|p| p.len() >= 6);

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, student_id, points, section, batch, git_link, owner_admin_id, created_at)
         VALUES(?, ?, ?, 0, ?, ?, ?, ?, ?)",
        (
            &id, &name, &student_ref, &section, &batch, &git_link, admin_id,
            db::now(),
        ),
    )
    .map_err(|e| match HandlerErr::from(e) {
        e if e.code == "conflict" => {
            HandlerErr::conflict("student already exists for this admin")
        }
        e => e,
    })?;

    let initial_password = provided_password
        .unwrap_or_else(|| auth::generate_password(&name, batch.as_deref()));
    upsert_student_login(conn, &student_ref, &initial_password)?;

    let created = require_scoped_student(conn, admin_id, &student_ref)?;
    let mut result = student_json(&created);
    result["initialPassword"] = json!(initial_password);
    Ok(result)
}

fn get_student(
    conn: &Connection,
    caller_role: Role,
    caller_name: &str,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    match caller_role {
        Role::Admin => {
            let s = require_scoped_student(conn, admin_id, &student_ref)?;
            Ok(student_json(&s))
        }
        Role::Student => {
            if student_ref != caller_name {
                return Err(HandlerErr::forbidden("students may only fetch themselves"));
            }
            // A shared login resolves against the oldest profile row.
            let s = conn
                .query_row(
                    "SELECT id, name, student_id, points, section, batch, git_link, created_at
                     FROM students
                     WHERE student_id = ?
                     ORDER BY created_at LIMIT 1",
                    [&student_ref],
                    row_to_student,
                )
                .optional()?
                .ok_or_else(|| HandlerErr::not_found("student not found"))?;
            Ok(student_json(&s))
        }
        Role::Master => Err(HandlerErr::forbidden("admin or student session required")),
    }
}

fn set_student_password(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let password = get_required_str(params, "password")?;
    if password.len() < 6 {
        return Err(HandlerErr::bad_params(
            "password must be at least 6 characters",
        ));
    }
    require_scoped_student(conn, admin_id, &student_ref)?;
    upsert_student_login(conn, &student_ref, &password)?;
    Ok(json!({ "success": true, "username": student_ref }))
}

fn delete_student(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_ref = get_required_str(params, "studentId")?.to_uppercase();
    let student = require_scoped_student(conn, admin_id, &student_ref)?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM students WHERE owner_admin_id = ? AND student_id = ?",
        (admin_id, &student_ref),
    )?;
    let feedbacks = tx.execute(
        "DELETE FROM feedback WHERE owner_admin_id = ? AND student_ref = ?",
        (admin_id, &student_ref),
    )?;
    let transactions = tx.execute(
        "DELETE FROM point_transactions WHERE owner_admin_id = ? AND student_ref = ?",
        (admin_id, &student_ref),
    )?;
    let attendance = tx.execute(
        "DELETE FROM attendance WHERE owner_admin_id = ? AND student_ref = ?",
        (admin_id, &student_ref),
    )?;
    tx.execute(
        "DELETE FROM spun_students WHERE owner_admin_id = ? AND student_ref = ?",
        (admin_id, &student_ref),
    )?;
    // The login is shared across scopes; drop it only when no other admin
    // still has a profile under this register number.
    let still_referenced: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM students WHERE student_id = ? LIMIT 1",
            [&student_ref],
            |r| r.get(0),
        )
        .optional()?;
    let mut deleted_user = false;
    if still_referenced.is_none() {
        deleted_user = tx.execute(
            "DELETE FROM credentials WHERE realm = 'student' AND username = ?",
            [&student_ref],
        )? > 0;
    }
    tx.commit()?;

    Ok(json!({
        "success": true,
        "deleted": { "id": student.id, "studentId": student_ref },
        "meta": {
            "deletedUser": deleted_user,
            "feedbacksDeleted": feedbacks,
            "transactionsDeleted": transactions,
            "attendanceDeleted": attendance,
        }
    }))
}

fn import_rows(
    conn: &Connection,
    admin_id: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(rows) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing rows"));
    };
    if rows.is_empty() {
        return Err(HandlerErr::bad_params("no rows provided"));
    }

    let tx = conn.unchecked_transaction()?;
    let mut processed = 0usize;
    let mut errors = 0usize;
    let mut error_details: Vec<serde_json::Value> = Vec::new();
    let mut usernames: Vec<String> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        let register = row
            .get("registerNumber")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        if name.is_empty() || register.is_empty() {
            errors += 1;
            error_details.push(json!({
                "index": i,
                "message": "missing name or registerNumber"
            }));
            continue;
        }
        let section = row
            .get("section")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let batch = row
            .get("batch")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let student_ref = register.to_uppercase();

        let upsert = tx.execute(
            "INSERT INTO students(id, name, student_id, points, section, batch, owner_admin_id, created_at)
             VALUES(?, ?, ?, 0, ?, ?, ?, ?)
             ON CONFLICT(owner_admin_id, student_id) DO UPDATE SET
               name = excluded.name,
               section = excluded.section,
               batch = excluded.batch,
               updated_at = excluded.created_at",
            (
                Uuid::new_v4().to_string(),
                name,
                &student_ref,
                section,
                batch,
                admin_id,
                db::now(),
            ),
        );
        if let Err(e) = upsert {
            errors += 1;
            error_details.push(json!({ "index": i, "message": e.to_string() }));
            continue;
        }

        // Existing logins keep their password; only fresh imports get the
        // generated one.
        match student_login_exists(&tx, &student_ref) {
            Ok(false) => {
                let generated = auth::generate_password(name, batch);
                if let Err(e) = upsert_student_login(&tx, &student_ref, &generated) {
                    errors += 1;
                    error_details.push(json!({ "index": i, "message": e.message }));
                    continue;
                }
            }
            Ok(true) => {}
            Err(e) => {
                errors += 1;
                error_details.push(json!({ "index": i, "message": e.message }));
                continue;
            }
        }

        usernames.push(student_ref);
        processed += 1;
    }
    tx.commit()?;

    Ok(json!({
        "success": true,
        "processed": processed,
        "errors": errors,
        "errorDetails": error_details,
        "usernames": usernames,
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_students(conn, &caller.credential_id) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match create_student(conn, &caller.credential_id, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_caller(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match get_student(
        conn,
        caller.role,
        &caller.username,
        &caller.credential_id,
        &req.params,
    ) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_set_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match set_student_password(conn, &caller.credential_id, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match delete_student(conn, &caller.credential_id, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_import_rows(state: &mut AppState, req: &Request) -> serde_json::Value {
    let caller = match require_admin(state, &req.params) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match import_rows(conn, &caller.credential_id, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.get" => Some(handle_get(state, req)),
        "students.setPassword" => Some(handle_set_password(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        "roster.importRows" => Some(handle_import_rows(state, req)),
        _ => None,
    }
}
