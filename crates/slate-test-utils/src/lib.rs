//! Test doubles for the storage agent protocol.
//!
//! [`spawn_one_shot_server`] is a plain capture-and-respond HTTP mock for
//! request-shape assertions. [`MockAgent`] speaks the real decoupled
//! protocol: it accepts a command POST, answers 202, then POSTs the scripted
//! response to the `callbackurl` the command carried, tagged with the same
//! `taskuuid`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};

const TASK_UUID_HEADER: &str = "taskuuid";
const CALLBACK_URL_HEADER: &str = "callbackurl";

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Spawn a one-shot HTTP mock that accepts a single request, captures it, and
/// replies with the given status line and body. Returns the base URL and a
/// receiver yielding the captured request.
pub fn spawn_one_shot_server(
    status_line: &str,
    response_body: &str,
) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
    let addr = listener.local_addr().expect("read mock server addr");
    let (tx, rx) = mpsc::channel();
    let status_line = status_line.to_string();
    let response_body = response_body.to_string();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept mock request");
        let request = read_http_request(&mut stream);
        tx.send(request).expect("send captured request");
        write_http_response(&mut stream, &status_line, &response_body);
    });

    (format!("http://{addr}"), rx)
}

/// A command the mock agent received, in arrival order.
#[derive(Clone, Debug)]
pub struct CapturedCommand {
    pub path: String,
    pub task_uuid: String,
    pub body: Value,
}

#[derive(Default)]
struct MockAgentState {
    responses: HashMap<String, Value>,
    captured: Vec<CapturedCommand>,
}

/// A scriptable storage agent. Every command is recorded; the response for a
/// path defaults to `{"success": true}` unless overridden with [`stub`].
///
/// [`stub`]: MockAgent::stub
pub struct MockAgent {
    base_url: String,
    state: Arc<Mutex<MockAgentState>>,
}

impl MockAgent {
    pub fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock agent");
        let addr = listener.local_addr().expect("read mock agent addr");
        let state = Arc::new(Mutex::new(MockAgentState::default()));

        let loop_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                serve_command(&mut stream, &loop_state);
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Script the response body sent to the callback for commands on `path`.
    pub fn stub(&self, path: &str, response: Value) {
        self.state
            .lock()
            .expect("mock agent state poisoned")
            .responses
            .insert(path.to_string(), response);
    }

    pub fn captured(&self) -> Vec<CapturedCommand> {
        self.state
            .lock()
            .expect("mock agent state poisoned")
            .captured
            .clone()
    }

    /// Bodies of the commands received on `path`, in arrival order.
    pub fn commands_for(&self, path: &str) -> Vec<Value> {
        self.captured()
            .into_iter()
            .filter(|command| command.path == path)
            .map(|command| command.body)
            .collect()
    }
}

fn serve_command(stream: &mut TcpStream, state: &Arc<Mutex<MockAgentState>>) {
    let request = read_http_request(stream);
    let task_uuid = request
        .headers
        .get(TASK_UUID_HEADER)
        .cloned()
        .unwrap_or_default();
    let callback_url = request.headers.get(CALLBACK_URL_HEADER).cloned();
    let body: Value = serde_json::from_str(&request.body).unwrap_or(Value::Null);

    let response = {
        let mut guard = state.lock().expect("mock agent state poisoned");
        guard.captured.push(CapturedCommand {
            path: request.path.clone(),
            task_uuid: task_uuid.clone(),
            body,
        });
        guard
            .responses
            .get(&request.path)
            .cloned()
            .unwrap_or_else(|| json!({"success": true}))
    };

    // The command submission only acknowledges acceptance; the substantive
    // response travels out of band to the caller's callback address.
    write_http_response(stream, "202 Accepted", "");

    if let Some(callback_url) = callback_url {
        post_callback(&callback_url, &task_uuid, &response);
    }
}

fn post_callback(callback_url: &str, task_uuid: &str, response: &Value) {
    let Some(rest) = callback_url.strip_prefix("http://") else {
        return;
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, "/".to_string()),
    };
    let Ok(mut stream) = TcpStream::connect(authority) else {
        return;
    };
    let body = response.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\nhost: {authority}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n{TASK_UUID_HEADER}: {task_uuid}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    if stream.write_all(request.as_bytes()).is_err() {
        return;
    }
    let mut sink = Vec::new();
    let _ = stream.read_to_end(&mut sink);
}

fn write_http_response(stream: &mut TcpStream, status_line: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(response.as_bytes())
        .expect("write mock response");
}

fn read_http_request(stream: &mut TcpStream) -> CapturedRequest {
    let mut buf = Vec::new();
    let mut header_end = None;
    let mut content_length = 0usize;

    loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).expect("read request bytes");
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if header_end.is_none() {
            header_end = buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
                .map(|idx| idx + 4);
            if let Some(end) = header_end {
                let headers = String::from_utf8_lossy(&buf[..end]);
                for line in headers.lines() {
                    if let Some((key, value)) = line.split_once(':') {
                        if key.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse::<usize>().unwrap_or(0);
                        }
                    }
                }
            }
        }
        if let Some(end) = header_end {
            if buf.len() >= end + content_length {
                break;
            }
        }
    }

    let end = header_end.expect("request headers must be present");
    let headers_raw = String::from_utf8_lossy(&buf[..end]);
    let mut lines = headers_raw.lines();
    let request_line = lines.next().expect("request line");
    let mut parts = request_line.split_whitespace();
    let method = parts.next().expect("method").to_string();
    let path = parts.next().expect("path").to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let body = String::from_utf8(buf[end..end + content_length].to_vec()).expect("utf8 body");

    CapturedRequest {
        method,
        path,
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_server_captures_the_request() {
        let (url, rx) = spawn_one_shot_server("200 OK", r#"{"ok":true}"#);
        let addr = url.trim_start_matches("http://");
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /test-path HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.contains("200 OK"));
        let request = rx.recv().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/test-path");
    }

    #[test]
    fn mock_agent_acknowledges_and_posts_the_callback() {
        // The callback target is itself a one-shot mock so the agent's
        // out-of-band POST can be observed.
        let (callback_url, callback_rx) = spawn_one_shot_server("200 OK", "");
        let agent = MockAgent::spawn();
        agent.stub(
            "/btrfs/bits/checkifexists",
            json!({"success": true, "existing": true}),
        );

        let addr = agent.base_url().trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(&addr).unwrap();
        let body = r#"{"path":"/ps/imageCache/templates/i/i.template"}"#;
        let request = format!(
            "POST /btrfs/bits/checkifexists HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\ncontent-length: {}\r\ntaskuuid: task-1\r\ncallbackurl: {callback_url}/slate/callbacks\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).unwrap();
        let mut ack = String::new();
        stream.read_to_string(&mut ack).unwrap();
        assert!(ack.contains("202 Accepted"));

        let callback = callback_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("callback posted");
        assert_eq!(callback.method, "POST");
        assert_eq!(callback.path, "/slate/callbacks");
        assert_eq!(
            callback.headers.get(TASK_UUID_HEADER).map(String::as_str),
            Some("task-1")
        );
        let posted: Value = serde_json::from_str(&callback.body).unwrap();
        assert_eq!(posted["existing"], true);

        let captured = agent.captured();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].path, "/btrfs/bits/checkifexists");
        assert_eq!(captured[0].task_uuid, "task-1");
        assert_eq!(
            captured[0].body["path"],
            "/ps/imageCache/templates/i/i.template"
        );
    }

    #[test]
    fn unscripted_paths_default_to_success() {
        let (callback_url, callback_rx) = spawn_one_shot_server("200 OK", "");
        let agent = MockAgent::spawn();

        let addr = agent.base_url().trim_start_matches("http://").to_string();
        let mut stream = TcpStream::connect(&addr).unwrap();
        let request = format!(
            "POST /btrfs/bits/delete HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/json\r\ncontent-length: 2\r\ntaskuuid: task-2\r\ncallbackurl: {callback_url}/cb\r\nconnection: close\r\n\r\n{{}}",
        );
        stream.write_all(request.as_bytes()).unwrap();
        let mut ack = String::new();
        stream.read_to_string(&mut ack).unwrap();

        let callback = callback_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("callback posted");
        let posted: Value = serde_json::from_str(&callback.body).unwrap();
        assert_eq!(posted, json!({"success": true}));
        assert_eq!(agent.commands_for("/btrfs/bits/delete").len(), 1);
    }
}
