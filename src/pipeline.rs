//! One full set of resources needed to evaluate a batch, and the pair of
//! pipelines operated in strict alternation to overlap host/device
//! transfer with compute (`spec.md` §4.3/§4.4).
use std::io::{ErrorKind, Read, Write};

use crate::arb::{BufferMode, DeviceOps};
use crate::error::{ConnectionError, DeviceError, ProtocolError};
use crate::kernel::WORD_SIZE;

/// A pinned input/output buffer pair, their device-side mirrors, and a
/// bound kernel instance, together with the two latches encoding whether
/// this pipeline is empty, primed, computing, or full (`spec.md` §3).
pub struct Pipeline<D: DeviceOps> {
    host_input: D::HostBuffer,
    dev_input: D::Buffer,
    host_output: D::HostBuffer,
    dev_output: D::Buffer,
    kernel: D::Kernel,
    workgroup_size: usize,
    batch_size: u32,
    mask_bytes: usize,
    response_bytes: usize,
    input_loaded: bool,
    output_dirty: bool,
}

impl<D: DeviceOps> Pipeline<D> {
    /// Allocate a fresh pipeline sharing `dev_database` and the compiled
    /// kernel program (implicit in `ops`) with its sibling.
    pub fn new(
        ops: &D,
        cell_length: u32,
        cell_count: u32,
        batch_size: u32,
        workgroup_size: usize,
        dev_database: &D::Buffer,
    ) -> Result<Self, DeviceError> {
        let mask_bytes = (cell_count as usize * batch_size as usize) / 8;
        let response_bytes = cell_length as usize * batch_size as usize;

        let host_input = ops
            .alloc_pinned(BufferMode::ReadOnly, mask_bytes)
            .map_err(DeviceError::EnqueueFailed)?;
        let dev_input = ops
            .alloc_device(BufferMode::ReadOnly, mask_bytes)
            .map_err(DeviceError::EnqueueFailed)?;
        let host_output = ops
            .alloc_pinned(BufferMode::WriteOnly, response_bytes)
            .map_err(DeviceError::EnqueueFailed)?;
        let dev_output = ops
            .alloc_device(BufferMode::WriteOnly, response_bytes)
            .map_err(DeviceError::EnqueueFailed)?;

        let kernel = ops.make_kernel("pir").map_err(DeviceError::EnqueueFailed)?;
        let db_word_count = (cell_count * cell_length) / WORD_SIZE as u32;
        let cell_word_count = cell_length / WORD_SIZE as u32;

        ops.set_arg_mem(&kernel, 0, dev_database).map_err(DeviceError::EnqueueFailed)?;
        ops.set_arg_mem(&kernel, 1, &dev_input).map_err(DeviceError::EnqueueFailed)?;
        ops.set_arg_local(&kernel, 2, cell_length as usize).map_err(DeviceError::EnqueueFailed)?;
        ops.set_arg_u32(&kernel, 3, db_word_count).map_err(DeviceError::EnqueueFailed)?;
        ops.set_arg_u32(&kernel, 4, cell_word_count).map_err(DeviceError::EnqueueFailed)?;
        ops.set_arg_mem(&kernel, 5, &dev_output).map_err(DeviceError::EnqueueFailed)?;

        Ok(Pipeline {
            host_input,
            dev_input,
            host_output,
            dev_output,
            kernel,
            workgroup_size,
            batch_size,
            mask_bytes,
            response_bytes,
            input_loaded: false,
            output_dirty: false,
        })
    }

    /// Read exactly the mask for one batch from the control channel into
    /// the pinned input buffer, then enqueue a non-blocking device write.
    /// Requires `!input_loaded`: the in-order queue guarantees this write
    /// only executes after any prior launch reading `dev_input` has
    /// completed, regardless of whether `output_dirty` is still set.
    pub fn prime(&mut self, ops: &D, socket: &mut impl Read) -> Result<(), ConnectionError> {
        debug_assert!(!self.input_loaded, "prime called while a mask is already awaiting launch");

        read_exact_counted(socket, self.host_input.as_mut(), self.mask_bytes)?;
        ops.enqueue_write(&self.dev_input, self.host_input.as_ref(), false)
            .map_err(DeviceError::EnqueueFailed)?;
        self.input_loaded = true;
        Ok(())
    }

    /// The central throughput trick (`spec.md` §4.3): read back the
    /// previous result (blocking) before launching the next batch
    /// (non-blocking), then write the result out to the socket.
    pub fn drain(&mut self, ops: &D, socket: &mut impl Write) -> Result<(), ConnectionError> {
        let mut send_pending = false;

        if self.output_dirty {
            ops.enqueue_read(&self.dev_output, self.host_output.as_mut(), true)
                .map_err(DeviceError::ReadbackFailed)?;
            self.output_dirty = false;
            send_pending = true;
        }

        if self.input_loaded {
            let total_threads = self.workgroup_size * self.batch_size as usize;
            ops.enqueue_launch(&self.kernel, total_threads, self.workgroup_size)
                .map_err(DeviceError::LaunchFailed)?;
            self.output_dirty = true;
            self.input_loaded = false;
        }

        if send_pending {
            write_all_counted(socket, &self.host_output.as_ref()[..self.response_bytes])?;
        }

        Ok(())
    }
}

fn read_exact_counted(socket: &mut impl Read, buf: &mut [u8], expected: usize) -> Result<(), ConnectionError> {
    let mut total = 0;
    while total < expected {
        match socket.read(&mut buf[total..expected]) {
            Ok(0) => {
                return Err(ProtocolError::ShortRead { expected, got: total }.into());
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_all_counted(socket: &mut impl Write, buf: &[u8]) -> Result<(), ConnectionError> {
    match socket.write_all(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::WriteZero => {
            Err(ProtocolError::ShortWrite { expected: buf.len(), got: 0 }.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Two `Pipeline`s operated in strict alternation (`spec.md` §4.4). Never
/// a general pool: the overlap discipline depends on there being exactly
/// two.
pub struct PipelinePair<D: DeviceOps> {
    pipelines: [Pipeline<D>; 2],
    next: usize,
}

impl<D: DeviceOps> PipelinePair<D> {
    pub fn new(pipelines: [Pipeline<D>; 2]) -> Self {
        PipelinePair { pipelines, next: 0 }
    }

    /// Serve one `'1'` (read) command: prime then drain the next pipeline
    /// in alternation, then toggle.
    pub fn read(&mut self, ops: &D, socket: &mut (impl Read + Write)) -> Result<(), ConnectionError> {
        let idx = self.next;
        self.pipelines[idx].prime(ops, socket)?;
        self.pipelines[idx].drain(ops, socket)?;
        self.next ^= 1;
        Ok(())
    }

    /// Fully flush any residual state before the pipelines are destroyed,
    /// by draining each pipeline twice (`spec.md` §4.4).
    pub fn drain_fully(&mut self, ops: &D, socket: &mut (impl Read + Write)) -> Result<(), ConnectionError> {
        for pipeline in &mut self.pipelines {
            pipeline.drain(ops, socket)?;
            pipeline.drain(ops, socket)?;
        }
        Ok(())
    }
}
