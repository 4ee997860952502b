//! Blocking HTTP/1.0 push client (C5).
//!
//! One TCP connection per request, `Connection: close`, no keep-alive, no TLS —
//! this talks to a receiver on the local network, not the open internet. Publication
//! is always best-effort: every public method returns `AppResult<()>` but callers in
//! the engine and stacker only ever log a failure and move on, never propagate it.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Bytes moved per `io::copy`-style chunk when streaming a file body. Keeps
/// memory use flat regardless of file size — the client never buffers an
/// entire block file or image in memory.
const CHUNK_SIZE: usize = 64 * 1024;

/// Connection parameters for the receiver endpoint.
#[derive(Debug, Clone)]
pub struct PushClient {
    server_ip: String,
    server_port: u16,
    connect_timeout: Duration,
    send_timeout: Duration,
    receive_timeout: Duration,
}

impl PushClient {
    pub fn new(server_ip: impl Into<String>, server_port: u16, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        Self {
            server_ip: server_ip.into(),
            server_port,
            connect_timeout: timeout,
            send_timeout: timeout,
            receive_timeout: timeout,
        }
    }

    fn resolve(&self) -> AppResult<SocketAddr> {
        (self.server_ip.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| DaqError::Network(format!("resolve {}:{} failed: {e}", self.server_ip, self.server_port)))?
            .next()
            .ok_or_else(|| DaqError::Network(format!("no address for {}:{}", self.server_ip, self.server_port)))
    }

    fn connect(&self) -> AppResult<TcpStream> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| DaqError::Network(format!("connect failed: {e}")))?;
        stream
            .set_write_timeout(Some(self.send_timeout))
            .map_err(|e| DaqError::Network(format!("set_write_timeout failed: {e}")))?;
        stream
            .set_read_timeout(Some(self.receive_timeout))
            .map_err(|e| DaqError::Network(format!("set_read_timeout failed: {e}")))?;
        Ok(stream)
    }

    fn write_request_line_and_headers(
        &self,
        stream: &mut TcpStream,
        path: &str,
        content_type: &str,
        content_length: u64,
        extra_headers: &[(&str, &str)],
    ) -> AppResult<()> {
        let mut head = format!(
            "POST {path} HTTP/1.0\r\n\
             Host: {}:{}\r\n\
             Connection: close\r\n\
             Content-Type: {content_type}\r\n\
             Content-Length: {content_length}\r\n",
            self.server_ip, self.server_port,
        );
        for (name, value) in extra_headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        stream
            .write_all(head.as_bytes())
            .map_err(|e| DaqError::Network(format!("write headers failed: {e}")))
    }

    /// Drain and discard the response; the receiver's body is not part of the
    /// wire contract, only a socket-level failure is treated as an error.
    fn drain_response(&self, stream: &mut TcpStream) -> AppResult<()> {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                    return Ok(())
                }
                Err(e) => return Err(DaqError::Network(format!("read response failed: {e}"))),
            }
        }
    }

    /// POST a JSON event to `/event`.
    pub fn post_json(&self, payload_bytes: &[u8]) -> AppResult<()> {
        let mut stream = self.connect()?;
        self.write_request_line_and_headers(
            &mut stream,
            "/event",
            "application/json",
            payload_bytes.len() as u64,
            &[],
        )?;
        stream
            .write_all(payload_bytes)
            .map_err(|e| DaqError::Network(format!("write body failed: {e}")))?;
        self.drain_response(&mut stream)
    }

    /// Stream the file at `path` to `endpoint` with `content_type`, setting
    /// `X-Filename: <filename>`. Reads and writes in fixed-size chunks; never
    /// buffers the whole file.
    pub fn post_file(&self, endpoint: &str, content_type: &str, path: &Path, filename: &str) -> AppResult<()> {
        let mut file = std::fs::File::open(path).map_err(DaqError::Io)?;
        let len = file.metadata().map_err(DaqError::Io)?.len();

        let mut stream = self.connect()?;
        self.write_request_line_and_headers(
            &mut stream,
            endpoint,
            content_type,
            len,
            &[("X-Filename", filename)],
        )?;

        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut chunk).map_err(DaqError::Io)?;
            if n == 0 {
                break;
            }
            stream
                .write_all(&chunk[..n])
                .map_err(|e| DaqError::Network(format!("write chunk failed: {e}")))?;
        }
        self.drain_response(&mut stream)
    }

    /// Convenience wrapper for `POST /ff` (the RMS binary block file).
    pub fn post_ff(&self, path: &Path, filename: &str) -> AppResult<()> {
        self.post_file("/ff", "application/octet-stream", path, filename)
    }

    /// Convenience wrapper for `POST /stack` (the encoded stack image).
    pub fn post_stack(&self, path: &Path, filename: &str) -> AppResult<()> {
        self.post_file("/stack", "image/jpeg", path, filename)
    }
}
