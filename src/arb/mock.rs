//! An in-process software model of the accelerator, for testing
//! [`crate::pipeline::Pipeline`] and [`crate::engine::Engine`] scheduling
//! logic without a physical device.
//!
//! Kernel argument indices are fixed by `Pipeline::new` (see `spec.md`
//! §4.3): 0 = database, 1 = mask, 2 = local scratch (size only), 3 =
//! db_word_count, 4 = cell_word_count, 5 = output. `enqueue_launch`
//! performs the actual XOR-PIR reduction described in `spec.md` §4.1 so
//! that tests built on [`MockOps`] exercise real query semantics, not
//! just the call sequencing.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::{BufferMode, DeviceOps};
use crate::error::ClError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockBuffer(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockKernel(usize);

#[derive(Default, Clone)]
struct KernelArgs {
    database: Option<usize>,
    mask: Option<usize>,
    db_word_count: Option<u32>,
    cell_word_count: Option<u32>,
    output: Option<usize>,
}

pub struct MockOps {
    buffers: RefCell<HashMap<usize, Vec<u8>>>,
    next_buffer: Cell<usize>,
    kernels: RefCell<HashMap<usize, KernelArgs>>,
    next_kernel: Cell<usize>,
    pub calls: RefCell<Vec<String>>,
    pub workgroup_size: Cell<usize>,
    pub fail_next_write: Cell<bool>,
    pub fail_next_read: Cell<bool>,
    pub fail_next_launch: Cell<bool>,
}

impl Default for MockOps {
    fn default() -> Self {
        MockOps {
            buffers: RefCell::new(HashMap::new()),
            next_buffer: Cell::new(0),
            kernels: RefCell::new(HashMap::new()),
            next_kernel: Cell::new(0),
            calls: RefCell::new(Vec::new()),
            workgroup_size: Cell::new(4),
            fail_next_write: Cell::new(false),
            fail_next_read: Cell::new(false),
            fail_next_launch: Cell::new(false),
        }
    }
}

impl MockOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directly inspect a buffer's current bytes (test helper, not part of
    /// `DeviceOps`).
    pub fn buffer_bytes(&self, buf: &MockBuffer) -> Vec<u8> {
        self.buffers.borrow()[&buf.0].clone()
    }

    fn log(&self, s: impl Into<String>) {
        self.calls.borrow_mut().push(s.into());
    }
}

impl DeviceOps for MockOps {
    type Buffer = MockBuffer;
    type Kernel = MockKernel;
    type HostBuffer = Vec<u8>;

    fn alloc_device(&self, _mode: BufferMode, size: usize) -> Result<Self::Buffer, ClError> {
        let id = self.next_buffer.get();
        self.next_buffer.set(id + 1);
        self.buffers.borrow_mut().insert(id, vec![0u8; size]);
        self.log(format!("alloc_device({size})"));
        Ok(MockBuffer(id))
    }

    fn alloc_pinned(&self, _mode: BufferMode, size: usize) -> Result<Self::HostBuffer, ClError> {
        self.log(format!("alloc_pinned({size})"));
        Ok(vec![0u8; size])
    }

    fn make_kernel(&self, name: &str) -> Result<Self::Kernel, ClError> {
        let id = self.next_kernel.get();
        self.next_kernel.set(id + 1);
        self.kernels.borrow_mut().insert(id, KernelArgs::default());
        self.log(format!("make_kernel({name})"));
        Ok(MockKernel(id))
    }

    fn set_arg_mem(&self, kernel: &Self::Kernel, index: u32, buf: &Self::Buffer) -> Result<(), ClError> {
        let mut kernels = self.kernels.borrow_mut();
        let args = kernels.get_mut(&kernel.0).expect("unknown mock kernel");
        match index {
            0 => args.database = Some(buf.0),
            1 => args.mask = Some(buf.0),
            5 => args.output = Some(buf.0),
            _ => panic!("unexpected mem kernel arg index {index}"),
        }
        Ok(())
    }

    fn set_arg_local(&self, _kernel: &Self::Kernel, index: u32, _size: usize) -> Result<(), ClError> {
        assert_eq!(index, 2, "unexpected local kernel arg index");
        Ok(())
    }

    fn set_arg_u32(&self, kernel: &Self::Kernel, index: u32, val: u32) -> Result<(), ClError> {
        let mut kernels = self.kernels.borrow_mut();
        let args = kernels.get_mut(&kernel.0).expect("unknown mock kernel");
        match index {
            3 => args.db_word_count = Some(val),
            4 => args.cell_word_count = Some(val),
            _ => panic!("unexpected u32 kernel arg index {index}"),
        }
        Ok(())
    }

    fn enqueue_write(&self, buf: &Self::Buffer, host: &[u8], blocking: bool) -> Result<(), ClError> {
        if self.fail_next_write.replace(false) {
            return Err(ClError(-1));
        }
        self.log(format!("enqueue_write(blocking={blocking}, len={})", host.len()));
        let mut buffers = self.buffers.borrow_mut();
        let dst = buffers.get_mut(&buf.0).expect("unknown mock buffer");
        dst[..host.len()].copy_from_slice(host);
        Ok(())
    }

    fn enqueue_read(&self, buf: &Self::Buffer, host: &mut [u8], blocking: bool) -> Result<(), ClError> {
        if self.fail_next_read.replace(false) {
            return Err(ClError(-1));
        }
        self.log(format!("enqueue_read(blocking={blocking}, len={})", host.len()));
        let buffers = self.buffers.borrow();
        let src = buffers.get(&buf.0).expect("unknown mock buffer");
        host.copy_from_slice(&src[..host.len()]);
        Ok(())
    }

    fn enqueue_launch(&self, kernel: &Self::Kernel, total_threads: usize, local_size: usize) -> Result<(), ClError> {
        if self.fail_next_launch.replace(false) {
            return Err(ClError(-1));
        }
        self.log(format!("enqueue_launch(total={total_threads}, local={local_size})"));

        let batch_size = total_threads / local_size;
        let kernels = self.kernels.borrow();
        let args = kernels.get(&kernel.0).expect("unknown mock kernel");
        let db_word_count = args.db_word_count.expect("database word count not bound") as usize;
        let cell_word_count = args.cell_word_count.expect("cell word count not bound") as usize;
        let cell_count = db_word_count / cell_word_count;

        let buffers = self.buffers.borrow();
        let database = &buffers[&args.database.expect("database buffer not bound")];
        let mask = &buffers[&args.mask.expect("mask buffer not bound")];
        drop(buffers);

        let cell_bytes = cell_word_count * 8;
        let mut output = vec![0u8; cell_bytes * batch_size];

        for s in 0..batch_size {
            for i in 0..cell_count {
                let bit_index = s * cell_count + i;
                let byte = mask[bit_index / 8];
                let bit = (byte >> (bit_index % 8)) & 1;
                if bit == 1 {
                    let cell = &database[i * cell_bytes..(i + 1) * cell_bytes];
                    for k in 0..cell_bytes {
                        output[s * cell_bytes + k] ^= cell[k];
                    }
                }
            }
        }

        let mut buffers = self.buffers.borrow_mut();
        let dst = buffers
            .get_mut(&args.output.expect("output buffer not bound"))
            .expect("unknown mock output buffer");
        dst.clear();
        dst.extend_from_slice(&output);
        Ok(())
    }

    fn flush(&self) -> Result<(), ClError> {
        self.log("flush()");
        Ok(())
    }

    fn preferred_workgroup_size(&self, _kernel: &Self::Kernel) -> Result<usize, ClError> {
        Ok(self.workgroup_size.get())
    }

    fn open(_device_id: usize, _source: &str) -> Result<Self, crate::error::EngineError> {
        Ok(MockOps::new())
    }
}
