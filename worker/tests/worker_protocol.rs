//! Integration tests driving the real `capstan-worker` binary over its
//! line-delimited stdio protocol.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;

use assert_cmd::cargo::CommandCargoExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn() -> Self {
        let mut cmd = Command::cargo_bin("capstan-worker").expect("worker binary");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().expect("spawn worker");
        let stdin = child.stdin.take().expect("worker stdin");
        let stdout = BufReader::new(child.stdout.take().expect("worker stdout"));
        Self {
            child,
            stdin,
            stdout,
        }
    }

    fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).expect("write line");
        self.stdin.flush().expect("flush");
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).expect("read line");
        assert!(n > 0, "worker closed stdout");
        serde_json::from_str(line.trim()).expect("parse response")
    }

    fn request(&mut self, value: Value) -> Value {
        self.send(value);
        self.recv()
    }

    fn execute(&mut self, code: &str) -> Value {
        self.request(json!({"type": "execute", "code": code}))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn ping_pongs() {
    let mut worker = WorkerProcess::spawn();
    assert_eq!(worker.request(json!({"type": "ping"})), json!({"pong": true}));
}

#[test]
fn execute_persists_state_across_commands() {
    let mut worker = WorkerProcess::spawn();
    let result = worker.execute("x = 42");
    assert_eq!(result["success"], json!(true));

    let result = worker.execute("x + 1");
    assert_eq!(result["return_value"], json!(43));

    let result = worker.execute("print('Hello, World!')");
    assert_eq!(result["stdout"], json!("Hello, World!\n"));
}

#[test]
fn errors_are_reported_not_raised() {
    let mut worker = WorkerProcess::spawn();
    let result = worker.execute("1 / 0");
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["error_type"], json!("ZeroDivisionError"));
    assert!(
        result["stderr"]
            .as_str()
            .is_some_and(|s| s.contains("ZeroDivisionError")),
        "stderr carries the trace"
    );

    // The worker survives and keeps serving.
    let result = worker.execute("2 + 2");
    assert_eq!(result["return_value"], json!(4));
}

#[test]
fn malformed_lines_get_an_error_response() {
    let mut worker = WorkerProcess::spawn();
    worker.send(json!({"type": "no_such_command"}));
    let response = worker.recv();
    assert!(response["error"].as_str().is_some(), "{response}");

    // Still alive afterwards.
    assert_eq!(worker.request(json!({"type": "ping"})), json!({"pong": true}));
}

#[test]
fn state_reports_functions_variables_history() {
    let mut worker = WorkerProcess::spawn();
    worker.execute("x = 1");
    worker.execute("y = 'hello'");
    worker.execute("def greet(name): return name");
    let state = worker.request(json!({"type": "state"}));

    assert_eq!(state["variables"]["x"], json!("int"));
    assert_eq!(state["variables"]["y"], json!("str"));
    assert_eq!(state["functions"][0]["name"], json!("greet"));
    assert_eq!(state["history_length"], json!(3));
}

#[test]
fn relay_call_traverses_the_host_mid_execute() {
    let mut worker = WorkerProcess::spawn();
    let ack = worker.request(json!({
        "type": "inject_relay_capability",
        "name": "math",
        "tools": {"add": {"description": "Add two numbers", "parameters": {"type": "object"}}},
    }));
    assert_eq!(ack["success"], json!(true));

    worker.send(json!({"type": "execute", "code": "math.add(a=3, b=4)"}));

    // The worker must block on exactly one relay request.
    let relay = worker.recv();
    assert_eq!(relay["type"], json!("relay_request"));
    assert_eq!(relay["capability"], json!("math"));
    assert_eq!(relay["method"], json!("add"));
    assert_eq!(relay["arguments"], json!({"a": 3, "b": 4}));
    let id = relay["id"].clone();

    let a = relay["arguments"]["a"].as_i64().expect("a");
    let b = relay["arguments"]["b"].as_i64().expect("b");
    worker.send(json!({
        "type": "relay_response",
        "id": id,
        "success": true,
        "result": a + b,
    }));

    let result = worker.recv();
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["return_value"], json!(7));
}

#[test]
fn relay_failure_raises_inside_the_session() {
    let mut worker = WorkerProcess::spawn();
    worker.request(json!({
        "type": "inject_relay_capability",
        "name": "math",
        "tools": {"add": {"description": "", "parameters": {}}},
    }));

    worker.send(json!({"type": "execute", "code": "math.add(a=1, b=2)"}));
    let relay = worker.recv();
    worker.send(json!({
        "type": "relay_response",
        "id": relay["id"],
        "success": false,
        "error": "backend exploded",
    }));

    let result = worker.recv();
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["error_type"], json!("RelayError"));
    assert!(
        result["error_message"]
            .as_str()
            .is_some_and(|s| s.contains("backend exploded")),
        "{result}"
    );
}

#[test]
fn consecutive_relay_calls_use_monotonic_ids() {
    let mut worker = WorkerProcess::spawn();
    worker.request(json!({
        "type": "inject_relay_capability",
        "name": "math",
        "tools": {"add": {"description": "", "parameters": {}}},
    }));

    worker.send(json!({
        "type": "execute",
        "code": "total = math.add(a=1, b=2) + math.add(a=3, b=4)",
    }));

    let first = worker.recv();
    let first_id = first["id"].as_u64().expect("id");
    worker.send(json!({"type": "relay_response", "id": first_id, "success": true, "result": 3}));

    let second = worker.recv();
    let second_id = second["id"].as_u64().expect("id");
    assert_eq!(second_id, first_id + 1);
    worker.send(json!({"type": "relay_response", "id": second_id, "success": true, "result": 7}));

    let result = worker.recv();
    assert_eq!(result["success"], json!(true));

    let result = worker.execute("total");
    assert_eq!(result["return_value"], json!(10));
}

#[test]
fn snapshot_round_trips_into_a_fresh_worker() {
    let mut worker = WorkerProcess::spawn();
    worker.execute("counter = 5");
    worker.execute("def inc(x):\n  return x + 1");
    worker.execute("result = inc(counter)");

    let snapshot = worker.request(json!({"type": "export_state"}));
    assert_eq!(snapshot["history"].as_array().map(Vec::len), Some(3));
    drop(worker);

    let mut fresh = WorkerProcess::spawn();
    let report = fresh.request(json!({"type": "import_state", "state": snapshot}));
    assert_eq!(report["functions_restored"], json!(1));
    assert_eq!(report["variables_restored"], json!(2));

    let result = fresh.execute("inc(10)");
    assert_eq!(result["return_value"], json!(11));
    let result = fresh.execute("counter");
    assert_eq!(result["return_value"], json!(5));

    let state = fresh.request(json!({"type": "state"}));
    assert_eq!(state["history_length"], json!(3));
}

#[test]
fn native_capability_policy_is_enforced_in_session() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let root = dir.path().join("root");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::create_dir_all(dir.path().join("root2")).expect("mkdir");
    std::fs::write(dir.path().join("root2/x"), "secret").expect("write");

    let mut worker = WorkerProcess::spawn();
    let result = worker.execute(&format!(
        "fs = FileCapability(paths=['{}'])",
        root.display()
    ));
    assert_eq!(result["success"], json!(true), "{result}");

    // Containment denies the sibling that shares a string prefix.
    let result = worker.execute(&format!(
        "fs.read(path='{}')",
        dir.path().join("root2/x").display()
    ));
    assert_eq!(result["error_type"], json!("PermissionError"));
    assert!(
        result["error_message"]
            .as_str()
            .is_some_and(|s| s.contains("outside allowed paths")),
        "{result}"
    );

    // Read-only derivation wins over the parent's write grant.
    let result = worker.execute("ro = fs.derive(read_only=True)");
    assert_eq!(result["success"], json!(true));
    let result = worker.execute(&format!(
        "ro.write(path='{}', content='x')",
        root.join("a").display()
    ));
    assert_eq!(result["error_type"], json!("PermissionError"));
    assert!(
        result["error_message"]
            .as_str()
            .is_some_and(|s| s.contains("read-only")),
        "{result}"
    );

    // The parent still writes fine.
    let result = worker.execute(&format!(
        "fs.write(path='{}', content='hello')",
        root.join("a").display()
    ));
    assert_eq!(result["success"], json!(true), "{result}");
    assert_eq!(
        std::fs::read_to_string(root.join("a")).expect("read back"),
        "hello"
    );
}

#[test]
fn shell_capability_guards_run_in_session() {
    let mut worker = WorkerProcess::spawn();
    let result = worker
        .execute("cmd = ShellCapability(commands=['echo'], deny_operators=True)");
    assert_eq!(result["success"], json!(true), "{result}");

    let result = worker.execute("cmd.run(command='echo hi')");
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["return_value"]["exit_code"], json!(0));
    assert_eq!(result["return_value"]["stdout"], json!("hi\n"));

    let result = worker.execute("cmd.run(command='rm -rf /')");
    assert_eq!(result["error_type"], json!("PermissionError"));
    assert!(
        result["error_message"]
            .as_str()
            .is_some_and(|s| s.contains("not allowed")),
        "{result}"
    );

    let result = worker.execute("cmd.run(command='echo hi && whoami')");
    assert_eq!(result["error_type"], json!("PermissionError"));
    assert!(
        result["error_message"]
            .as_str()
            .is_some_and(|s| s.contains("operators")),
        "{result}"
    );
}

#[test]
fn register_and_describe_scripted_capability() {
    let mut worker = WorkerProcess::spawn();
    worker.execute(
        "class Counter:\n    name = \"counter\"\n    description = \"A simple counter\"\n    def __init__(self):\n        self.value = 0\n    def increment(self):\n        self.value = self.value + 1\n        return self.value\n    def describe(self):\n        return \"counter: increment() -> int\"\n",
    );
    worker.execute("counter = Counter()");

    let response = worker.request(json!({"type": "register_capability", "name": "counter"}));
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["capability_name"], json!("counter"));

    let listing = worker.request(json!({"type": "list_capabilities"}));
    assert_eq!(listing["capabilities"][0]["name"], json!("counter"));
    assert_eq!(listing["capabilities"][0]["kind"], json!("native"));

    let result = worker.execute("counter.increment()");
    assert_eq!(result["return_value"], json!(1));
    let result = worker.execute("counter.increment()");
    assert_eq!(result["return_value"], json!(2));

    let result = worker.execute("counter.describe()");
    assert_eq!(result["return_value"], json!("counter: increment() -> int"));
}

#[test]
fn inject_binds_code_into_namespace() {
    let mut worker = WorkerProcess::spawn();
    let ack = worker.request(json!({
        "type": "inject",
        "name": "injected_var",
        "code": "injected_var = 'I was injected'",
    }));
    assert_eq!(ack["success"], json!(true));

    let result = worker.execute("injected_var");
    assert_eq!(result["return_value"], json!("I was injected"));
}
