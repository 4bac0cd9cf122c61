//! Unix-socket control server.
//!
//! One newline-terminated JSON request per connection, one JSON response
//! back. Each connection gets its own thread; the control plane serialises
//! lifecycle mutations internally.

use fs_err as fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use flowforge_core::ControlPlane;
use flowforge_protocol::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

/// Removes the socket file when dropped.
pub struct ServerHandle {
    socket_path: PathBuf,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(err) = remove_existing_socket(&self.socket_path) {
            debug!(error = %err, "Failed to remove control socket");
        }
    }
}

pub fn start(socket_path: PathBuf, control: Arc<ControlPlane>) -> Result<ServerHandle, String> {
    prepare_socket_dir(&socket_path)?;
    remove_existing_socket(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)
        .map_err(|err| format!("Failed to bind control socket: {}", err))?;
    fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .map_err(|err| format!("Failed to restrict control socket: {}", err))?;
    info!(path = %socket_path.display(), "Control socket listening");

    thread::Builder::new()
        .name("control-accept".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let control = Arc::clone(&control);
                        thread::spawn(move || handle_connection(stream, &control));
                    }
                    Err(err) => warn!(error = %err, "Failed to accept control connection"),
                }
            }
        })
        .map_err(|err| format!("Failed to spawn control accept thread: {}", err))?;

    Ok(ServerHandle { socket_path })
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, control: &ControlPlane) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read control request");
            let _ = write_response(&mut stream, &Response::error_with_info(None, 400, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Control request received");
    let response = control.handle(request);
    if let Err(err) = write_response(&mut stream, &response) {
        debug!(error = %err, "Failed to write control response");
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
