//! The XOR-PIR OpenCL kernel and its CPU reference implementation.
//!
//! Adapted from `examples/original_source/pird/pir_kernel.c`, restructured
//! so the accumulation loop walks cells and words jointly over a single
//! flattened index space (`spec.md` §4.1) rather than the original's
//! single loop over raw `long`s; the kernel arguments are otherwise
//! identical in position and meaning to the original `pir` kernel.

/// OpenCL C source for the `pir` kernel.
///
/// Arguments, in order (bound once by `Pipeline::new`):
/// 0. `__global ulong* database` — read-only, `db_word_count` words.
/// 1. `__global uchar* mask` — read-only, packed LSB-first bits.
/// 2. `__local ulong* scratch` — one word per `cell_word_count`.
/// 3. `uint db_word_count` — total words in `database`.
/// 4. `uint cell_word_count` — words per cell (`cell_length / 8`).
/// 5. `__global ulong* output` — write-only, `cell_word_count * batch_size` words.
pub const KERNEL_SOURCE: &str = r#"
__kernel void pir(
    __global const ulong* database,
    __global const uchar* mask,
    __local ulong* scratch,
    const uint db_word_count,
    const uint cell_word_count,
    __global ulong* output)
{
    const uint local_size = get_local_size(0);
    const uint local_id = get_local_id(0);
    const uint slot = get_group_id(0);
    const uint cell_count = db_word_count / cell_word_count;
    const uint mask_bit_base = slot * cell_count;

    for (uint k = local_id; k < cell_word_count; k += local_size) {
        scratch[k] = 0;
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    const uint total = db_word_count;
    for (uint o = local_id; o < total; o += local_size) {
        const uint cell = o / cell_word_count;
        const uint k = o % cell_word_count;
        const uint bit_index = mask_bit_base + cell;
        const uchar byte = mask[bit_index / 8];
        const uchar bit = (byte >> (bit_index % 8)) & 1;
        const ulong select_mask = (ulong)(-(long)bit);
        scratch[k] ^= select_mask & database[o];
    }
    barrier(CLK_LOCAL_MEM_FENCE);

    for (uint k = local_id; k < cell_word_count; k += local_size) {
        output[slot * cell_word_count + k] = scratch[k];
    }
}
"#;

/// The word size the kernel operates on, in bytes. `spec.md` treats the
/// accelerator word size as fixed at 8 bytes.
pub const WORD_SIZE: usize = 8;

/// Pure-Rust reference implementation of the XOR-PIR reduction described
/// in `spec.md` §4.1/§8, used both to state the end-to-end test scenarios
/// and by `arb::mock::MockOps::enqueue_launch`.
///
/// `database` is `cell_count` cells of `cell_length` bytes each,
/// concatenated. `mask` is `cell_count * batch_size` bits, packed
/// LSB-first, laid out so the `cell_count` bits for slot `s` start at bit
/// offset `s * cell_count`. Returns `batch_size` cells of `cell_length`
/// bytes each, concatenated.
pub fn cpu_reference(database: &[u8], cell_length: usize, cell_count: usize, mask: &[u8], batch_size: usize) -> Vec<u8> {
    assert_eq!(database.len(), cell_length * cell_count);
    assert_eq!(mask.len(), (cell_count * batch_size + 7) / 8);

    let mut output = vec![0u8; cell_length * batch_size];
    for s in 0..batch_size {
        for i in 0..cell_count {
            let bit_index = s * cell_count + i;
            let byte = mask[bit_index / 8];
            let bit = (byte >> (bit_index % 8)) & 1;
            if bit == 1 {
                let cell = &database[i * cell_length..(i + 1) * cell_length];
                let out = &mut output[s * cell_length..(s + 1) * cell_length];
                for k in 0..cell_length {
                    out[k] ^= cell[k];
                }
            }
        }
    }
    output
}
