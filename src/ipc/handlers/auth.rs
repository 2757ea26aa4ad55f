use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Caller, Request, Role};

struct CredentialRow {
    id: String,
    username: String,
    password_hash: String,
    role: Role,
    approved: bool,
}

fn find_credential(
    conn: &Connection,
    realm: &str,
    username: &str,
) -> Result<Option<CredentialRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, username, password_hash, role, approved
         FROM credentials
         WHERE realm = ? AND username = ?",
        (realm, username),
        |r| {
            let role_raw: String = r.get(3)?;
            Ok(CredentialRow {
                id: r.get(0)?,
                username: r.get(1)?,
                password_hash: r.get(2)?,
                role: Role::parse(&role_raw).unwrap_or(Role::Student),
                approved: r.get::<_, i64>(4)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::from)
}

fn normalize_username(role: Role, raw: &str) -> String {
    // Student logins are the register number, stored uppercased.
    match role {
        Role::Student => raw.trim().to_uppercase(),
        _ => raw.trim().to_string(),
    }
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<(Caller, serde_json::Value), HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be master, admin or student"))?;

    let normalized = normalize_username(role, &username);
    let Some(cred) = find_credential(conn, role.realm(), &normalized)? else {
        return Err(HandlerErr::unauthorized("invalid credentials"));
    };
    if cred.role != role {
        return Err(HandlerErr::unauthorized("invalid credentials"));
    }
    if !auth::verify_password(password.trim(), &cred.password_hash) {
        return Err(HandlerErr::unauthorized("invalid credentials"));
    }
    if cred.role == Role::Admin && !cred.approved {
        return Err(HandlerErr::forbidden("admin not yet approved by master"));
    }

    if matches!(cred.role, Role::Admin | Role::Master) {
        conn.execute(
            "UPDATE credentials SET last_login = ? WHERE id = ?",
            (db::now(), &cred.id),
        )?;
    }

    let user = json!({
        "id": cred.id,
        "username": cred.username,
        "role": cred.role.as_str(),
    });
    Ok((
        Caller {
            credential_id: cred.id,
            username: cred.username,
            role: cred.role,
        },
        user,
    ))
}

/// Admin self-registration; the account stays unusable until a master
/// approves it.
fn register(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    if username.len() < 3 {
        return Err(HandlerErr::bad_params(
            "username must be at least 3 characters",
        ));
    }
    if password.len() < 6 {
        return Err(HandlerErr::bad_params(
            "password must be at least 6 characters",
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO credentials(id, realm, username, password_hash, role, approved, created_at)
         VALUES(?, 'staff', ?, ?, 'admin', 0, ?)",
        (&id, &username, auth::hash_password(&password), db::now()),
    )
    .map_err(|e| match HandlerErr::from(e) {
        e if e.code == "conflict" => HandlerErr::conflict("username already exists"),
        e => e,
    })?;

    Ok(json!({
        "id": id,
        "username": username,
        "message": "registration submitted, awaiting master approval"
    }))
}

fn change_password(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let username = get_required_str(params, "username")?;
    let old_password = get_required_str(params, "oldPassword")?;
    let new_password = get_required_str(params, "newPassword")?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be master, admin or student"))?;
    if new_password.len() < 6 {
        return Err(HandlerErr::bad_params(
            "new password must be at least 6 characters",
        ));
    }

    let normalized = normalize_username(role, &username);
    let Some(cred) = find_credential(conn, role.realm(), &normalized)? else {
        return Err(HandlerErr::not_found("user not found"));
    };
    if !auth::verify_password(old_password.trim(), &cred.password_hash) {
        return Err(HandlerErr::unauthorized("old password incorrect"));
    }

    conn.execute(
        "UPDATE credentials SET password_hash = ? WHERE id = ?",
        (auth::hash_password(&new_password), &cred.id),
    )?;
    Ok(json!({ "success": true }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let outcome = {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        login(conn, &req.params)
    };
    match outcome {
        Ok((caller, user)) => {
            let token = Uuid::new_v4().to_string();
            state.sessions.insert(token.clone(), caller);
            ok(&req.id, json!({ "session": token, "user": user }))
        }
        Err(error) => error.response(&req.id),
    }
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match register(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match change_password(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(token) = req.params.get("session").and_then(|v| v.as_str()) {
        state.sessions.remove(token.trim());
    }
    ok(&req.id, json!({ "success": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.register" => Some(handle_register(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        _ => None,
    }
}
