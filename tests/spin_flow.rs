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

#[test]
fn winners_leave_the_pool_until_reset() {
    let workspace = temp_dir("spark-spin-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let session = admin_session(&mut stdin, &mut reader, "spinner");

    for (i, (name, reg)) in [("Ram S", "23CS001"), ("Alice Johnson", "23CS002")]
        .iter()
        .enumerate()
    {
        let _ = request(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "students.create",
            json!({ "session": session, "name": name, "studentId": reg }),
        );
    }

    // Excluding one student forces a deterministic winner.
    let excluded = request(
        &mut stdin,
        &mut reader,
        "2",
        "spin.exclusions",
        json!({ "session": session, "mode": "exclude", "studentIds": ["23CS002"] }),
    );
    assert_eq!(excluded["result"]["changed"].as_u64(), Some(1));

    let eligible = request(
        &mut stdin,
        &mut reader,
        "3",
        "spin.eligible",
        json!({ "session": session }),
    );
    let pool = eligible["result"]["students"].as_array().expect("pool");
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0]["studentId"].as_str(), Some("23CS001"));

    let picked = request(
        &mut stdin,
        &mut reader,
        "4",
        "spin.pick",
        json!({ "session": session }),
    );
    assert_eq!(
        picked["result"]["winner"]["studentId"].as_str(),
        Some("23CS001")
    );
    assert_eq!(picked["result"]["remaining"].as_u64(), Some(0));

    let exhausted = request(
        &mut stdin,
        &mut reader,
        "5",
        "spin.pick",
        json!({ "session": session }),
    );
    assert_eq!(
        exhausted["error"]["code"].as_str(),
        Some("no_eligible_students")
    );

    let history = request(
        &mut stdin,
        &mut reader,
        "6",
        "spin.history",
        json!({ "session": session }),
    );
    assert_eq!(
        history["result"]["entries"].as_array().expect("entries").len(),
        2
    );

    // Removing a history entry puts the student back in the pool.
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "spin.removeHistory",
        json!({ "session": session, "studentId": "23CS001" }),
    );
    let back = request(
        &mut stdin,
        &mut reader,
        "8",
        "spin.eligible",
        json!({ "session": session }),
    );
    assert_eq!(
        back["result"]["students"].as_array().expect("pool").len(),
        1
    );

    let included = request(
        &mut stdin,
        &mut reader,
        "9",
        "spin.exclusions",
        json!({ "session": session, "mode": "include", "studentIds": ["23CS002"] }),
    );
    assert_eq!(included["result"]["changed"].as_u64(), Some(1));
    let full = request(
        &mut stdin,
        &mut reader,
        "10",
        "spin.eligible",
        json!({ "session": session }),
    );
    assert_eq!(
        full["result"]["students"].as_array().expect("pool").len(),
        2
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "11",
        "spin.removeHistory",
        json!({ "session": session, "studentId": "23CS001" }),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("not_found"));

    let reset = request(
        &mut stdin,
        &mut reader,
        "12",
        "spin.reset",
        json!({ "session": session }),
    );
    assert_eq!(reset["result"]["success"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn exclusions_skip_students_outside_the_scope() {
    let workspace = temp_dir("spark-spin-exclusions");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let session = admin_session(&mut stdin, &mut reader, "spinscoper");
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "session": session, "name": "Ram S", "studentId": "23CS001" }),
    );

    let partial = request(
        &mut stdin,
        &mut reader,
        "3",
        "spin.exclusions",
        json!({ "session": session, "mode": "exclude", "studentIds": ["23CS001", "99ZZ999"] }),
    );
    assert_eq!(partial["result"]["changed"].as_u64(), Some(1));

    let bad_mode = request(
        &mut stdin,
        &mut reader,
        "4",
        "spin.exclusions",
        json!({ "session": session, "mode": "banish", "studentIds": ["23CS001"] }),
    );
    assert_eq!(bad_mode["error"]["code"].as_str(), Some("bad_params"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
