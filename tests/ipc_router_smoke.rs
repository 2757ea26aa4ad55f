use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_sparkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn sparkd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn admin_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    username: &str,
) -> String {
    let reg = request(
        stdin,
        reader,
        "reg",
        "auth.register",
        json!({ "username": username, "password": "secret123" }),
    );
    let admin_id = reg["result"]["id"].as_str().expect("admin id").to_string();
    let master = request(
        stdin,
        reader,
        "ml",
        "auth.login",
        json!({ "username": "master", "password": "master123", "role": "master" }),
    );
    let master_session = master["result"]["session"]
        .as_str()
        .expect("master session")
        .to_string();
    request(
        stdin,
        reader,
        "ap",
        "master.adminApprove",
        json!({ "session": master_session, "id": admin_id }),
    );
    let login = request(
        stdin,
        reader,
        "al",
        "auth.login",
        json!({ "username": username, "password": "secret123", "role": "admin" }),
    );
    login["result"]["session"]
        .as_str()
        .expect("admin session")
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("spark-router-smoke");
    let bundle_out = workspace.join("smoke-backup.spark.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let session = admin_session(&mut stdin, &mut reader, "smokeadmin");

    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "session": session,
            "name": "Ram S",
            "studentId": "23cs001",
            "batch": "2023-2027",
            "section": "A"
        }),
    );
    assert_eq!(
        created["result"]["studentId"].as_str(),
        Some("23CS001"),
        "register number is uppercased"
    );
    let student_password = created["result"]["initialPassword"]
        .as_str()
        .expect("initialPassword")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.list",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "session": session, "studentId": "23CS001" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "points.add",
        json!({ "session": session, "studentId": "23CS001", "amount": 5 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "transactions.list",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.upsertBatch",
        json!({
            "session": session,
            "date": "2026-03-02",
            "items": [{ "studentId": "23CS001", "status": "present" }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.getForDate",
        json!({ "session": session, "date": "2026-03-02" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.summary",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "attendance.isLocked",
        json!({ "session": session, "date": "2026-03-02" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "spin.eligible",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "spin.history",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "spin.reset",
        json!({ "session": session }),
    );

    let student_login = request(
        &mut stdin,
        &mut reader,
        "15",
        "auth.login",
        json!({ "username": "23cs001", "password": student_password, "role": "student" }),
    );
    let student_session = student_login["result"]["session"]
        .as_str()
        .expect("student session")
        .to_string();
    let submitted = request(
        &mut stdin,
        &mut reader,
        "16",
        "feedback.submit",
        json!({
            "session": student_session,
            "category": "general",
            "message": "router smoke feedback"
        }),
    );
    let feedback_id = submitted["result"]["id"]
        .as_str()
        .expect("feedback id")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "feedback.list",
        json!({ "session": session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "feedback.markRead",
        json!({ "session": session, "id": feedback_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "feedback.delete",
        json!({ "session": session, "id": feedback_id }),
    );

    let master = request(
        &mut stdin,
        &mut reader,
        "20",
        "auth.login",
        json!({ "username": "master", "password": "master123", "role": "master" }),
    );
    let master_session = master["result"]["session"]
        .as_str()
        .expect("master session")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "master.adminsList",
        json!({ "session": master_session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "master.stats",
        json!({ "session": master_session }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "backup.exportBundle",
        json!({ "session": master_session, "outPath": bundle_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "backup.importBundle",
        json!({ "session": master_session, "inPath": bundle_out.to_string_lossy() }),
    );

    // Import clears sessions; log back in before touching scoped methods.
    let relogin = request(
        &mut stdin,
        &mut reader,
        "25",
        "auth.login",
        json!({ "username": "smokeadmin", "password": "secret123", "role": "admin" }),
    );
    let session = relogin["result"]["session"]
        .as_str()
        .expect("admin session after import")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "students.delete",
        json!({ "session": session, "studentId": "23CS001" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "auth.logout",
        json!({ "session": session }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
