//! Resident engine state and the `configure`/`write`/`read` lifecycle
//! operations (`spec.md` §4.5), generic over [`crate::arb::DeviceOps`] so
//! it can run against the real accelerator or `arb::mock::MockOps`.
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

use crate::arb::{BufferMode, DeviceOps};
use crate::error::{ConnectionError, DeviceError, EngineError, ProtocolError};
use crate::kernel::KERNEL_SOURCE;
use crate::pipeline::{Pipeline, PipelinePair};
use crate::shm::ShmAttachment;

/// A validated `(cell_length, cell_count, batch_size)` triple, as
/// installed by the last successful `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub cell_length: u32,
    pub cell_count: u32,
    pub batch_size: u32,
}

impl Config {
    pub fn validate(cell_length: i32, cell_count: i32, batch_size: i32) -> Result<Self, ProtocolError> {
        if cell_length <= 0 || cell_length % 8 != 0 {
            return Err(ProtocolError::BadConfig("cell_length must be a positive multiple of 8"));
        }
        if cell_count <= 0 {
            return Err(ProtocolError::BadConfig("cell_count must be positive"));
        }
        if batch_size <= 0 {
            return Err(ProtocolError::BadConfig("batch_size must be positive"));
        }
        if (cell_count as i64 * batch_size as i64) % 8 != 0 {
            return Err(ProtocolError::BadConfig("cell_count * batch_size must be a multiple of 8"));
        }

        Ok(Config {
            cell_length: cell_length as u32,
            cell_count: cell_count as u32,
            batch_size: batch_size as u32,
        })
    }

    fn database_bytes(&self) -> usize {
        self.cell_length as usize * self.cell_count as usize
    }

    fn mask_bytes(&self) -> usize {
        (self.cell_count as usize * self.batch_size as usize) / 8
    }

    fn response_bytes(&self) -> usize {
        self.cell_length as usize * self.batch_size as usize
    }
}

fn device_to_engine(err: DeviceError) -> EngineError {
    match err {
        DeviceError::EnqueueFailed(e) | DeviceError::ReadbackFailed(e) | DeviceError::LaunchFailed(e) => {
            EngineError::Device(e)
        }
    }
}

/// Resident state for one configured instance of the engine: the device
/// binding, the installed database, the pipeline pair, and the current
/// shared-memory attachment. `None` fields mean "unconfigured".
pub struct Engine<D: DeviceOps> {
    ops: Option<D>,
    config: Option<Config>,
    dev_database: Option<D::Buffer>,
    pipelines: Option<PipelinePair<D>>,
    shm: Option<ShmAttachment>,
    poisoned: bool,
}

impl<D: DeviceOps> Default for Engine<D> {
    fn default() -> Self {
        Engine { ops: None, config: None, dev_database: None, pipelines: None, shm: None, poisoned: false }
    }
}

impl<D: DeviceOps> Engine<D> {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_ready(&self) -> Result<(), ProtocolError> {
        if self.config.is_none() {
            return Err(ProtocolError::NotConfigured);
        }
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        Ok(())
    }

    /// `spec.md` §4.5 `configure`. Flushes and drains any existing
    /// pipelines against `socket` before tearing them down, then rebuilds
    /// device binding, database buffer, and pipeline pair from scratch.
    pub fn configure<S: Read + Write>(
        &mut self,
        device_id: usize,
        cell_length: i32,
        cell_count: i32,
        batch_size: i32,
        socket: &mut S,
        socket_fd: Option<RawFd>,
    ) -> Result<(), ConnectionError> {
        let config = Config::validate(cell_length, cell_count, batch_size)?;

        if let (Some(ops), Some(mut pipelines)) = (self.ops.take(), self.pipelines.take()) {
            // `spec.md` §4.5 step 1: flush the queue before draining, so
            // the drains' blocking readbacks observe already-completed
            // work rather than racing in-flight launches.
            ops.flush().map_err(EngineError::Device)?;
            pipelines.drain_fully(&ops, socket)?;
            // Drop order matters: the pipelines' buffers/kernels and the
            // shared database buffer must be released before the context
            // that owns them, so `ops` (and its context) is dropped last.
            drop(pipelines);
            self.dev_database = None;
            drop(ops);
        }

        if let Some(fd) = socket_fd {
            let hint = 2 * config.mask_bytes().max(config.response_bytes());
            if let Err(e) = raise_socket_buffers(fd, hint) {
                log::warn!("failed to raise socket buffer size hint: {e}");
            }
        }

        let ops = D::open(device_id, KERNEL_SOURCE)?;

        let probe = ops.make_kernel("pir").map_err(EngineError::Device)?;
        let workgroup_size = ops.preferred_workgroup_size(&probe).map_err(EngineError::Device)?;
        drop(probe);

        let dev_database = ops
            .alloc_device(BufferMode::ReadOnly, config.database_bytes())
            .map_err(EngineError::Device)?;

        let p0 = Pipeline::new(&ops, config.cell_length, config.cell_count, config.batch_size, workgroup_size, &dev_database)
            .map_err(device_to_engine)?;
        let p1 = Pipeline::new(&ops, config.cell_length, config.cell_count, config.batch_size, workgroup_size, &dev_database)
            .map_err(device_to_engine)?;

        self.ops = Some(ops);
        self.dev_database = Some(dev_database);
        self.pipelines = Some(PipelinePair::new([p0, p1]));
        self.config = Some(config);
        self.poisoned = false;

        log::info!(
            "reconfigured: database now {} items of {} bytes, batches of {}",
            config.cell_count, config.cell_length, config.batch_size
        );
        Ok(())
    }

    /// `spec.md` §4.5 `write`: attach the shared-memory database segment,
    /// push it to the device, and acknowledge on the socket.
    pub fn write<S: Write>(&mut self, shm_handle: i32, socket: &mut S) -> Result<(), ConnectionError> {
        self.require_ready()?;
        let config = *self.config.as_ref().unwrap();

        let attachment = ShmAttachment::attach(shm_handle, config.database_bytes())?;

        let ops = self.ops.as_ref().unwrap();
        let dev_database = self.dev_database.as_ref().unwrap();
        if let Err(e) = ops.enqueue_write(dev_database, attachment.as_slice(), true) {
            self.poisoned = true;
            return Err(DeviceError::EnqueueFailed(e).into());
        }

        self.shm = Some(attachment);
        log::info!("database updated");

        socket.write_all(b"ok")?;
        Ok(())
    }

    /// `spec.md` §4.5 `read`, delegated to the pipeline scheduler.
    pub fn read<S: Read + Write>(&mut self, socket: &mut S) -> Result<(), ConnectionError> {
        self.require_ready()?;
        let ops = self.ops.as_ref().unwrap();
        let pipelines = self.pipelines.as_mut().unwrap();

        match pipelines.read(ops, socket) {
            Ok(()) => Ok(()),
            Err(e @ ConnectionError::Device(_)) => {
                self.poisoned = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn raise_socket_buffers(fd: RawFd, size_hint: usize) -> std::io::Result<()> {
    let size = size_hint as libc::c_int;
    for (level, optname) in [(libc::SOL_SOCKET, libc::SO_SNDBUF), (libc::SOL_SOCKET, libc::SO_RCVBUF)] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                optname,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arb::mock::MockOps;
    use std::io::Cursor;

    struct DuplexBuf {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for DuplexBuf {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for DuplexBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn io(bytes: Vec<u8>) -> DuplexBuf {
        DuplexBuf { input: Cursor::new(bytes), output: Vec::new() }
    }

    #[test]
    fn read_before_configure_is_not_configured() {
        let mut engine: Engine<MockOps> = Engine::new();
        let mut sock = io(vec![]);
        let err = engine.read(&mut sock).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::NotConfigured)));
    }

    #[test]
    fn configure_then_write_then_read_round_trips() {
        let mut engine: Engine<MockOps> = Engine::new();
        let mut sock = io(vec![]);
        engine.configure(0, 8, 2, 1, &mut sock, None).unwrap();

        let handle = unsafe { libc::shmget(libc::IPC_PRIVATE, 16, libc::IPC_CREAT | 0o600) };
        assert!(handle >= 0);
        let addr = unsafe { libc::shmat(handle, std::ptr::null(), 0) };
        unsafe {
            let mut db = vec![0u8; 16];
            db[0..8].copy_from_slice(&0x0101010101010101u64.to_le_bytes());
            db[8..16].copy_from_slice(&0x0202020202020202u64.to_le_bytes());
            std::ptr::copy_nonoverlapping(db.as_ptr(), addr as *mut u8, 16);
            libc::shmdt(addr);
        }

        let mut write_sock = io(vec![]);
        engine.write(handle, &mut write_sock).unwrap();
        assert_eq!(write_sock.output, b"ok");

        // The pipeline pair needs a full warm-up lap (one request per
        // pipeline) before a response comes back; the third request is the
        // first to actually deliver the first request's answer.
        let mut warm0 = io(vec![0x01]);
        engine.read(&mut warm0).unwrap();
        assert!(warm0.output.is_empty());

        let mut warm1 = io(vec![0x01]);
        engine.read(&mut warm1).unwrap();
        assert!(warm1.output.is_empty());

        let mut read_sock = io(vec![0x01]);
        engine.read(&mut read_sock).unwrap();
        assert_eq!(read_sock.output, 0x0101010101010101u64.to_le_bytes().to_vec());

        unsafe { libc::shmctl(handle, libc::IPC_RMID, std::ptr::null_mut()) };
    }

    #[test]
    fn reconfigure_replaces_prior_state() {
        let mut engine: Engine<MockOps> = Engine::new();
        let mut sock = io(vec![]);
        engine.configure(0, 8, 2, 1, &mut sock, None).unwrap();
        engine.configure(0, 8, 4, 2, &mut sock, None).unwrap();
        assert_eq!(engine.config.unwrap().cell_count, 4);
        assert_eq!(engine.config.unwrap().batch_size, 2);
    }

    #[test]
    fn bad_config_is_connection_fatal_not_process_fatal() {
        let mut engine: Engine<MockOps> = Engine::new();
        let mut sock = io(vec![]);
        let err = engine.configure(0, 7, 2, 1, &mut sock, None).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::BadConfig(_))));
    }

    #[test]
    fn write_before_configure_is_not_configured() {
        let mut engine: Engine<MockOps> = Engine::new();
        let mut sock = io(vec![]);
        let err = engine.write(0, &mut sock).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(ProtocolError::NotConfigured)));
    }
}
