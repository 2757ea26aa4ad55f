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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
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

fn student_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    admin: &str,
    name: &str,
    register: &str,
) -> String {
    let _ = request(
        stdin,
        reader,
        "sc",
        "students.create",
        json!({
            "session": admin,
            "name": name,
            "studentId": register,
            "password": "pass123"
        }),
    );
    let login = request(
        stdin,
        reader,
        "sl",
        "auth.login",
        json!({ "username": register, "password": "pass123", "role": "student" }),
    );
    login["result"]["session"]
        .as_str()
        .expect("student session")
        .to_string()
}

#[test]
fn feedback_flows_from_student_to_owning_admin() {
    let workspace = temp_dir("spark-feedback-inbox");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = admin_session(&mut stdin, &mut reader, "inboxowner");
    let student = student_session(&mut stdin, &mut reader, &admin, "Ram S", "23CS001");

    let bad_category = request(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.submit",
        json!({ "session": student, "category": "rant", "message": "hello" }),
    );
    assert_eq!(bad_category["error"]["code"].as_str(), Some("bad_params"));

    let submitted = request(
        &mut stdin,
        &mut reader,
        "3",
        "feedback.submit",
        json!({ "session": student, "category": "question", "message": "When is the demo day?" }),
    );
    assert_eq!(submitted["result"]["status"].as_str(), Some("new"));
    assert_eq!(submitted["result"]["read"].as_bool(), Some(false));
    assert_eq!(submitted["result"]["studentName"].as_str(), Some("Ram S"));
    let feedback_id = submitted["result"]["id"]
        .as_str()
        .expect("feedback id")
        .to_string();

    let inbox = request(
        &mut stdin,
        &mut reader,
        "4",
        "feedback.list",
        json!({ "session": admin }),
    );
    let items = inbox["result"]["feedbacks"].as_array().expect("feedbacks");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"].as_str(), Some(feedback_id.as_str()));

    let read = request(
        &mut stdin,
        &mut reader,
        "5",
        "feedback.markRead",
        json!({ "session": admin, "id": feedback_id }),
    );
    assert_eq!(read["result"]["read"].as_bool(), Some(true));
    assert_eq!(read["result"]["status"].as_str(), Some("reviewed"));

    // Marking a second time is a no-op reporting the same end state.
    let read_again = request(
        &mut stdin,
        &mut reader,
        "6",
        "feedback.markRead",
        json!({ "session": admin, "id": feedback_id }),
    );
    assert_eq!(read_again["result"]["status"].as_str(), Some("reviewed"));

    // Another admin sees neither the entry nor a leak of its existence code.
    let other = admin_session(&mut stdin, &mut reader, "otherinbox");
    let foreign = request(
        &mut stdin,
        &mut reader,
        "7",
        "feedback.markRead",
        json!({ "session": other, "id": feedback_id }),
    );
    assert_eq!(foreign["error"]["code"].as_str(), Some("forbidden"));

    let gone = request(
        &mut stdin,
        &mut reader,
        "8",
        "feedback.delete",
        json!({ "session": admin, "id": feedback_id }),
    );
    assert_eq!(gone["result"]["success"].as_bool(), Some(true));
    let missing = request(
        &mut stdin,
        &mut reader,
        "9",
        "feedback.delete",
        json!({ "session": admin, "id": feedback_id }),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("not_found"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_delete_reports_per_id_outcomes() {
    let workspace = temp_dir("spark-feedback-bulk");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin = admin_session(&mut stdin, &mut reader, "bulkowner");
    let student = student_session(&mut stdin, &mut reader, &admin, "Alice Johnson", "23CS002");

    let mut ids = Vec::new();
    for i in 0..3 {
        let submitted = request(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "feedback.submit",
            json!({
                "session": student,
                "category": "suggestion",
                "message": format!("idea number {}", i)
            }),
        );
        ids.push(
            submitted["result"]["id"]
                .as_str()
                .expect("feedback id")
                .to_string(),
        );
    }

    let bulk = request(
        &mut stdin,
        &mut reader,
        "2",
        "feedback.bulkDelete",
        json!({ "session": admin, "ids": [ids[0], ids[1], "no-such-id"] }),
    );
    assert_eq!(bulk["result"]["deleted"].as_u64(), Some(2));
    assert_eq!(bulk["result"]["errors"].as_u64(), Some(1));

    let remaining = request(
        &mut stdin,
        &mut reader,
        "3",
        "feedback.list",
        json!({ "session": admin }),
    );
    assert_eq!(
        remaining["result"]["feedbacks"]
            .as_array()
            .expect("feedbacks")
            .len(),
        1
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
