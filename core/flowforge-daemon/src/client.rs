//! Client for a running supervisor's control socket.

use rand::RngCore;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use flowforge_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use serde_json::Value;

const READ_TIMEOUT_MS: u64 = 5000;
const WRITE_TIMEOUT_MS: u64 = 600;

pub fn build_request(
    method: Method,
    params: Option<Value>,
    idempotency_key: Option<String>,
) -> Request {
    Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_request_id()),
        idempotency_key,
        params,
    }
}

pub fn send_request(socket: &Path, request: &Request) -> Result<Response, String> {
    let mut stream = UnixStream::connect(socket).map_err(|err| {
        format!(
            "Failed to connect to control socket {}: {}",
            socket.display(),
            err
        )
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for control response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err("Control response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "req-{}-{}-{:x}",
        chrono::Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    #[test]
    fn request_ids_are_unique() {
        let a = build_request(Method::Status, None, None);
        let b = build_request(Method::Status, None, None);
        assert_ne!(a.id, b.id);
        assert_eq!(a.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn round_trips_one_request() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("control.sock");
        let listener = UnixListener::bind(&socket).expect("bind");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).expect("read");
            let end = buf[..n].iter().position(|b| *b == b'\n').unwrap_or(n);
            let request: Request = serde_json::from_slice(&buf[..end]).expect("request json");
            assert_eq!(request.idempotency_key.as_deref(), Some("abc"));
            let response = Response::ok(request.id, 202, serde_json::json!({"status": "ok"}));
            serde_json::to_writer(&mut stream, &response).expect("write");
            stream.write_all(b"\n").expect("newline");
        });

        let request = build_request(Method::Restart, None, Some("abc".to_string()));
        let response = send_request(&socket, &request).expect("response");
        server.join().expect("server thread");

        assert!(response.ok);
        assert_eq!(response.status, 202);
        assert_eq!(response.id, request.id);
    }

    #[test]
    fn missing_socket_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let request = build_request(Method::Health, None, None);
        let err = send_request(&temp_dir.path().join("absent.sock"), &request)
            .expect_err("connect should fail");
        assert!(err.contains("Failed to connect"));
    }
}
