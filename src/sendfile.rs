use std::io::{self, ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;

use mio::net::TcpStream;

use crate::http::FileBody;

const FALLBACK_CHUNK: usize = 64 * 1024;

/// Push file bytes at the socket until the body completes or the socket
/// would block. `Ok(true)` means the file is fully sent. Uses the kernel
/// zero-copy path where it applies and falls back to a paged read/write
/// loop otherwise.
pub fn send_file(stream: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    while body.offset < body.size {
        match try_sendfile(stream, body) {
            SendStep::Sent(0) => {
                // File shrank underneath us; nothing sane left to send.
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "file truncated"));
            }
            SendStep::Sent(_) => {}
            SendStep::WouldBlock => return Ok(false),
            SendStep::Unsupported => return send_file_with_writes(stream, body),
            SendStep::Error(e) => return Err(e),
        }
    }
    Ok(true)
}

enum SendStep {
    Sent(usize),
    WouldBlock,
    Unsupported,
    Error(io::Error),
}

#[cfg(target_os = "linux")]
fn try_sendfile(stream: &TcpStream, body: &mut FileBody) -> SendStep {
    let remaining = (body.size - body.offset) as usize;
    let mut offset = body.offset as libc::off_t;
    let sent = unsafe {
        libc::sendfile(
            stream.as_raw_fd(),
            body.file.as_raw_fd(),
            &mut offset,
            remaining,
        )
    };
    if sent >= 0 {
        body.offset = offset as u64;
        SendStep::Sent(sent as usize)
    } else {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) => SendStep::WouldBlock,
            Some(libc::EINVAL) | Some(libc::ENOSYS) => SendStep::Unsupported,
            _ => SendStep::Error(err),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn try_sendfile(_stream: &TcpStream, _body: &mut FileBody) -> SendStep {
    SendStep::Unsupported
}

fn send_file_with_writes(stream: &mut TcpStream, body: &mut FileBody) -> io::Result<bool> {
    let mut chunk = vec![0u8; FALLBACK_CHUNK];
    while body.offset < body.size {
        let want = chunk.len().min((body.size - body.offset) as usize);
        let read = body.file.read_at(&mut chunk[..want], body.offset)?;
        if read == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "file truncated"));
        }
        let mut written = 0;
        while written < read {
            match stream.write(&chunk[written..read]) {
                Ok(n) => {
                    written += n;
                    body.offset += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(true)
}
