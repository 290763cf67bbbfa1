//! The control channel: a `UnixListener` serving exactly one connection
//! at a time, dispatching the three wire commands onto an [`Engine`]
//! (`spec.md` §4.6).
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::arb::DeviceOps;
use crate::engine::Engine;
use crate::error::{ConnectionError, EngineError, ProtocolError};

const CMD_READ: u8 = b'1';
const CMD_CONFIGURE: u8 = b'2';
const CMD_WRITE: u8 = b'3';

/// How often the accept loop wakes up to re-check the shutdown flag while
/// no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why the accept loop stopped serving connections.
#[derive(Debug)]
pub enum ServeExit {
    /// `shutdown` was observed set (SIGINT/SIGTERM).
    Interrupted,
}

/// A process-ending failure of the accept loop: either the listener itself
/// faulted, or a connection surfaced an [`EngineError`], which `spec.md`
/// §7 requires to end the process rather than just drop the connection.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Bind the rendezvous path (removing a stale socket file first) and serve
/// connections one at a time until `shutdown` is observed set or a fatal
/// error occurs. The listener is non-blocking so the shutdown flag is
/// re-checked on a short timer instead of sitting inside a blocking
/// `accept()` that only ever retries on `EINTR` — an idle daemon would
/// otherwise never notice a signal.
pub fn serve<D: DeviceOps>(
    socket_path: &Path,
    device_id: usize,
    shutdown: &Arc<AtomicBool>,
) -> Result<ServeExit, ServeError> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;

    let mut engine: Engine<D> = Engine::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(ServeExit::Interrupted);
        }

        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        stream.set_nonblocking(false)?;

        serve_connection(&mut engine, stream, device_id).map_err(ServeError::Engine)?;
    }
}

/// Serve one connection until it disconnects or errors. A
/// [`ConnectionError::Engine`] is fatal and propagates out to end the
/// process; every other error class only drops this connection.
fn serve_connection<D: DeviceOps>(
    engine: &mut Engine<D>,
    mut stream: UnixStream,
    device_id: usize,
) -> Result<(), EngineError> {
    loop {
        let mut cmd = [0u8; 1];
        match read_exact_retrying(&mut stream, &mut cmd) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::info!("client disconnected");
                return Ok(());
            }
            Err(e) => {
                log::warn!("control channel read failed: {e}");
                return Ok(());
            }
        }

        let result = match cmd[0] {
            CMD_READ => engine.read(&mut stream),
            CMD_CONFIGURE => dispatch_configure(engine, &mut stream, device_id),
            CMD_WRITE => dispatch_write(engine, &mut stream),
            other => Err(ProtocolError::UnknownCommand(other).into()),
        };

        match result {
            Ok(()) => {}
            Err(ConnectionError::Engine(e)) => {
                log::error!("fatal engine error, shutting down: {e}");
                return Err(e);
            }
            Err(err) => {
                log::warn!("dropping connection: {err}");
                return Ok(());
            }
        }
    }
}

fn dispatch_configure<D: DeviceOps>(
    engine: &mut Engine<D>,
    stream: &mut UnixStream,
    device_id: usize,
) -> Result<(), ConnectionError> {
    let mut payload = [0u8; 12];
    read_exact_retrying(stream, &mut payload)?;
    let cell_length = i32::from_le_bytes(payload[0..4].try_into().unwrap());
    let cell_count = i32::from_le_bytes(payload[4..8].try_into().unwrap());
    let batch_size = i32::from_le_bytes(payload[8..12].try_into().unwrap());

    let fd = stream.as_raw_fd();
    engine.configure(device_id, cell_length, cell_count, batch_size, stream, Some(fd))
}

fn dispatch_write<D: DeviceOps>(engine: &mut Engine<D>, stream: &mut UnixStream) -> Result<(), ConnectionError> {
    let mut payload = [0u8; std::mem::size_of::<libc::c_int>()];
    read_exact_retrying(stream, &mut payload)?;
    let handle = libc::c_int::from_le_bytes(payload);
    engine.write(handle, stream)
}

fn read_exact_retrying(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::UnexpectedEof, "short read on control channel")),
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arb::mock::MockOps;
    use std::os::unix::net::UnixStream as TestStream;

    #[test]
    fn unknown_command_byte_terminates_connection() {
        let (mut client, server) = TestStream::pair().unwrap();
        let mut engine: Engine<MockOps> = Engine::new();

        client.write_all(&[b'9']).unwrap();
        drop(client);

        serve_connection(&mut engine, server, 0).unwrap();
    }

    #[test]
    fn configure_read_write_over_a_real_socket_pair() {
        let (mut client, server) = TestStream::pair().unwrap();
        let mut engine: Engine<MockOps> = Engine::new();

        let handle = unsafe { libc::shmget(libc::IPC_PRIVATE, 16, libc::IPC_CREAT | 0o600) };
        assert!(handle >= 0);
        let addr = unsafe { libc::shmat(handle, std::ptr::null(), 0) };
        unsafe {
            std::ptr::write_bytes(addr as *mut u8, 0x42, 16);
            libc::shmdt(addr);
        }

        let server_thread = std::thread::spawn(move || {
            serve_connection(&mut engine, server, 0).unwrap();
        });

        client.write_all(&[CMD_CONFIGURE]).unwrap();
        client.write_all(&8i32.to_le_bytes()).unwrap();
        client.write_all(&2i32.to_le_bytes()).unwrap();
        client.write_all(&1i32.to_le_bytes()).unwrap();

        client.write_all(&[CMD_WRITE]).unwrap();
        client.write_all(&(handle as libc::c_int).to_le_bytes()).unwrap();
        let mut ack = [0u8; 2];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(&ack, b"ok");

        // The first two reads on a freshly configured pipeline pair only
        // prime/launch; no bytes come back until the third.
        for _ in 0..2 {
            client.write_all(&[CMD_READ]).unwrap();
            client.write_all(&[0x01]).unwrap();
        }

        client.write_all(&[CMD_READ]).unwrap();
        client.write_all(&[0x01]).unwrap();
        let mut response = [0u8; 8];
        client.read_exact(&mut response).unwrap();
        assert_eq!(response, [0x42u8; 8]);

        drop(client);
        server_thread.join().unwrap();
        unsafe { libc::shmctl(handle, libc::IPC_RMID, std::ptr::null_mut()) };
    }

    #[test]
    fn serve_removes_stale_rendezvous_file_and_shuts_down_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pir.socket");
        // A stale non-socket file at the rendezvous path must not block bind.
        std::fs::write(&path, b"stale").unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let socket_path = path.clone();
        let server_thread =
            std::thread::spawn(move || serve::<MockOps>(&socket_path, 0, &shutdown_for_thread));

        let mut stream = loop {
            match UnixStream::connect(&path) {
                Ok(s) => break s,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };
        stream.write_all(&[b'9']).unwrap();
        drop(stream);

        shutdown.store(true, Ordering::Relaxed);
        let outcome = server_thread.join().unwrap().unwrap();
        assert!(matches!(outcome, ServeExit::Interrupted));
    }
}
