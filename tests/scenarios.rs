//! End-to-end behaviour of the device through its host interface.

use std::thread;

use fpga_npu_emu::config::NpuConfig;
use fpga_npu_emu::device::{
    ctrl, dma_ctrl, offset, status_bits, DeviceMemory, DispatchState, DmaDescriptor,
    DmaDirection, DmaState, ErrorCode, Instruction, MemoryPort, Npu, NpuError,
};

const LIMIT: u64 = 10_000;

fn config() -> NpuConfig {
    NpuConfig {
        queue_depth: 32,
        pe_count: 8,
        memory_size: 64 * 1024,
        memory_latency: 2,
    }
}

fn enabled_npu() -> Npu {
    let mut npu = Npu::new(config()).unwrap();
    npu.write_register(offset::CTRL, ctrl::ENABLE | ctrl::INT_EN);
    npu
}

fn to_device(src: u64, dst: u64, length: u32) -> DmaDescriptor {
    DmaDescriptor {
        src_addr: src,
        dst_addr: dst,
        length,
        direction: DmaDirection::ToDevice,
        interrupt_enable: true,
    }
}

fn from_device(src: u64, dst: u64, length: u32) -> DmaDescriptor {
    DmaDescriptor {
        direction: DmaDirection::FromDevice,
        ..to_device(src, dst, length)
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

fn device_bytes(npu: &Npu, addr: u64, len: usize) -> Vec<u8> {
    let words = len.div_ceil(4);
    let mut out = Vec::with_capacity(words * 4);
    for i in 0..words as u64 {
        let word = npu.device_memory().backdoor_read(addr + 4 * i).unwrap();
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn test_dma_64_bytes_to_device() {
    let mut npu = enabled_npu();
    let data = pattern(64, 0x11);
    npu.host_memory_mut().write_bytes(0x4000, &data);

    // Program the registers the way a driver would
    npu.write_register(offset::DMA_SRC_ADDR, 0x4000);
    npu.write_register(offset::DMA_DST_ADDR, 0x100);
    npu.write_register(offset::DMA_LENGTH, 64);
    npu.write_register(offset::DMA_CTRL, dma_ctrl::START | dma_ctrl::INT_EN);
    assert!(npu.status().busy);

    let cycles = npu.run_until_idle(LIMIT).unwrap();
    assert!(cycles > 0);

    let st = npu.status();
    assert!(st.ready && !st.busy && !st.error);
    assert!(st.interrupt_pending);
    assert!(npu.irq_line());
    assert_eq!(device_bytes(&npu, 0x100, 64), data);
    assert_eq!(npu.perf_counters().dma_bytes, 64);

    npu.acknowledge_interrupt();
    assert!(!npu.irq_line());
}

#[test]
fn test_dma_exact_length_both_directions() {
    for len in [1u32, 4, 15, 16, 17, 33, 100] {
        let mut npu = enabled_npu();
        let data = pattern(len as usize, len as u8);
        npu.host_memory_mut().write_bytes(0x1000, &data);

        npu.run_dma(&to_device(0x1000, 0x200, len), LIMIT).unwrap();
        assert_eq!(device_bytes(&npu, 0x200, len as usize), data, "to device, len {}", len);

        // Bytes past the end of the host buffer stay untouched
        npu.host_memory_mut().write_bytes(0x8000, &[0xAB; 128]);
        npu.run_dma(&from_device(0x200, 0x8000, len), LIMIT).unwrap();

        let mut back = vec![0u8; len as usize + 16];
        npu.host_memory().peek_bytes(0x8000, &mut back);
        assert_eq!(&back[..len as usize], &data[..], "from device, len {}", len);
        assert!(back[len as usize..].iter().all(|&b| b == 0xAB));
    }
}

#[test]
fn test_dma_fault_reports_error() {
    let mut memory = DeviceMemory::new(4096, 1);
    memory.inject_fault(0x120..0x124);
    let mut npu = Npu::with_memory(config(), Box::new(memory)).unwrap();
    npu.write_register(offset::CTRL, ctrl::ENABLE);

    let err = npu.run_dma(&to_device(0x0, 0x100, 64), LIMIT).unwrap_err();
    assert!(matches!(err, NpuError::DmaFailed { code: ErrorCode::DmaError }));

    let st = npu.status();
    assert!(!st.busy);
    assert!(st.ready);
    assert!(st.error);
    assert_eq!(st.error_code, ErrorCode::DmaError);
    assert!(st.interrupt_pending);
    assert_eq!(npu.dma_state(), DmaState::Idle);

    // A sticky ERROR does not block the next descriptor
    npu.run_dma(&to_device(0x0, 0x200, 16), LIMIT).unwrap();
    assert!(npu.status().error);

    npu.clear_error();
    assert!(!npu.status().error);
    assert_eq!(npu.status().error_code, ErrorCode::None);
}

#[test]
fn test_start_while_busy_is_rejected() {
    let mut npu = enabled_npu();
    npu.start_dma(&to_device(0, 0, 256)).unwrap();
    npu.tick();

    assert!(matches!(
        npu.start_dma(&from_device(0, 0x1000, 16)),
        Err(NpuError::DeviceBusy)
    ));
    assert_eq!(npu.status().error_code, ErrorCode::DeviceBusy);

    // The first descriptor still completes
    npu.run_until_idle(LIMIT).unwrap();
    assert_eq!(npu.perf_counters().dma_bytes, 256);
}

#[test]
fn test_zero_length_dma() {
    let mut npu = enabled_npu();
    npu.run_dma(&to_device(0, 0, 0), LIMIT).unwrap();
    let st = npu.status();
    assert!(st.ready && !st.error && st.interrupt_pending);
    assert_eq!(npu.arbiter().stats().grants, 0);
}

#[test]
fn test_mul_result() {
    let mut npu = enabled_npu();
    assert!(npu.submit(Instruction::mul(3, 4)));
    npu.run_until_idle(LIMIT).unwrap();

    assert_eq!(npu.dispatch_output(), (12, true));
    assert_eq!(npu.pop_result(), Some(12));
    assert_eq!(npu.dispatch_state(), DispatchState::Idle);
}

#[test]
fn test_undefined_opcode_is_ignored() {
    let mut npu = enabled_npu();
    npu.execute_batch(&[Instruction::add(1, 1)], LIMIT).unwrap();

    assert!(npu.submit_instruction(0xFF01_0203));
    npu.run_until_idle(LIMIT).unwrap();

    assert_eq!(npu.dispatch_output(), (0, false));
    assert_eq!(npu.pop_result(), None);
    assert!(!npu.status().error);
    assert_eq!(npu.dispatch_state(), DispatchState::Idle);
    assert_eq!(npu.perf_counters().unknown_opcodes, 1);
}

#[test]
fn test_reset_during_transfer() {
    let mut npu = enabled_npu();
    let data = pattern(1024, 3);
    npu.host_memory_mut().write_bytes(0, &data);
    npu.start_dma(&to_device(0, 0x400, 1024)).unwrap();
    npu.submit(Instruction::mac(9, 9));

    for _ in 0..40 {
        npu.tick();
    }
    assert_eq!(npu.dma_state(), DmaState::Transferring);

    npu.request_reset();
    assert_ne!(npu.read_register(offset::CTRL) & ctrl::RESET, 0);
    npu.tick();

    assert_eq!(npu.dma_state(), DmaState::Idle);
    assert_eq!(npu.dispatch_state(), DispatchState::Idle);
    assert_eq!(npu.read_register(offset::CTRL) & ctrl::RESET, 0);
    let st = npu.status();
    assert!(st.ready && !st.busy && !st.error && !st.interrupt_pending);
    // CTRL configuration survives
    assert_ne!(npu.read_register(offset::CTRL) & ctrl::ENABLE, 0);

    // The discarded descriptor writes nothing more
    let written = device_bytes(&npu, 0x400, 1024);
    for _ in 0..200 {
        npu.tick();
    }
    assert_eq!(device_bytes(&npu, 0x400, 1024), written);
    assert_ne!(written, data);
    assert_eq!(npu.perf_counters().dma_bytes, 0);
}

#[test]
fn test_reset_from_another_thread() {
    let mut npu = enabled_npu();
    let handle = npu.reset_handle();
    npu.start_dma(&to_device(0, 0, 512)).unwrap();
    npu.tick();

    thread::spawn(move || handle.fire()).join().unwrap();
    npu.tick();
    assert_eq!(npu.dma_state(), DmaState::Idle);
}

#[test]
fn test_mac_sum_and_reset() {
    let mut npu = enabled_npu();
    let pairs: [(u8, u8); 6] = [(1, 2), (3, 4), (250, 250), (7, 0), (255, 255), (10, 11)];
    let program: Vec<_> = pairs.iter().map(|&(a, b)| Instruction::mac(a, b)).collect();

    let results = npu.execute_batch(&program, LIMIT).unwrap();
    let mut acc = 0u32;
    let expected: Vec<u32> = pairs
        .iter()
        .map(|&(a, b)| {
            acc = acc.wrapping_add(a as u32 * b as u32);
            acc
        })
        .collect();
    assert_eq!(results, expected);

    npu.request_reset();
    npu.tick();
    let results = npu.execute_batch(&[Instruction::mac(2, 2)], LIMIT).unwrap();
    assert_eq!(results, vec![4]);
}

#[test]
fn test_load_store_through_device_memory() {
    let mut npu = enabled_npu();
    npu.device_memory_mut().backdoor_write(0x104 * 4, 0xDEAD_BEEF).unwrap();

    let results = npu
        .execute_batch(
            &[
                Instruction::load(0x104),
                Instruction::store(0x20, 0x77),
                Instruction::load(0x20),
            ],
            LIMIT,
        )
        .unwrap();
    assert_eq!(results, vec![0xDEAD_BEEF, 0x77]);
    assert_eq!(npu.device_memory().backdoor_read(0x80), Ok(0x77));

    let perf = npu.perf_counters();
    assert_eq!(perf.instructions, 3);
    assert_eq!(perf.memory_reads, 2);
    assert_eq!(perf.memory_writes, 1);
}

#[test]
fn test_load_fault_sets_device_error() {
    let mut npu = Npu::with_memory(config(), Box::new(DeviceMemory::new(256, 1))).unwrap();
    npu.write_register(offset::CTRL, ctrl::ENABLE);

    let results = npu.execute_batch(&[Instruction::load(0x1000)], LIMIT).unwrap();
    assert!(results.is_empty());
    let st = npu.status();
    assert!(st.error);
    assert_eq!(st.error_code, ErrorCode::DeviceError);
    assert_eq!(npu.dispatch_state(), DispatchState::Idle);
}

#[test]
fn test_instructions_interleave_with_dma() {
    let mut npu = enabled_npu();
    let data = pattern(256, 0x40);
    npu.host_memory_mut().write_bytes(0x2000, &data);
    npu.start_dma(&to_device(0x2000, 0x800, 256)).unwrap();

    let program: Vec<_> = (1..=10).map(|i| Instruction::add(i, i)).collect();
    let results = npu.execute_batch(&program, LIMIT).unwrap();

    assert_eq!(results, (1..=10).map(|i| 2 * i).collect::<Vec<u32>>());
    assert_eq!(device_bytes(&npu, 0x800, 256), data);
    assert!(!npu.status().error);
}

#[test]
fn test_ready_iff_dispatch_idle() {
    let mut npu = enabled_npu();
    npu.submit(Instruction::load(3));
    while !npu.is_idle() {
        npu.tick();
        let idle = npu.dispatch_state() == DispatchState::Idle;
        assert_eq!(npu.status().ready, idle);
    }
}

#[test]
fn test_status_read_idempotent_and_w1c() {
    let mut npu = enabled_npu();
    npu.run_dma(&to_device(0, 0, 16), LIMIT).unwrap();

    let first = npu.read_register(offset::STATUS);
    let second = npu.read_register(offset::STATUS);
    assert_eq!(first, second);
    assert_ne!(first & status_bits::INT_PENDING, 0);

    // Writing zeros clears nothing
    npu.write_register(offset::STATUS, 0);
    assert_eq!(npu.read_register(offset::STATUS), first);

    npu.write_register(offset::STATUS, status_bits::INT_PENDING);
    assert_eq!(npu.read_register(offset::STATUS) & status_bits::INT_PENDING, 0);
    assert_ne!(npu.read_register(offset::STATUS) & status_bits::READY, 0);
}

#[test]
fn test_interrupt_needs_int_en() {
    let mut npu = enabled_npu();
    npu.write_register(offset::CTRL, ctrl::ENABLE);
    npu.run_dma(&to_device(0, 0, 16), LIMIT).unwrap();
    assert!(npu.status().interrupt_pending);
    assert!(!npu.irq_line());

    npu.write_register(offset::CTRL, ctrl::ENABLE | ctrl::INT_EN);
    assert!(npu.irq_line());

    let quiet = DmaDescriptor {
        interrupt_enable: false,
        ..to_device(0, 0, 16)
    };
    npu.acknowledge_interrupt();
    npu.run_dma(&quiet, LIMIT).unwrap();
    assert!(!npu.irq_line());
}

#[test]
fn test_run_until_idle_times_out() {
    let mut npu = enabled_npu();
    npu.start_dma(&to_device(0, 0, 4096)).unwrap();
    assert!(matches!(
        npu.run_until_idle(10),
        Err(NpuError::Timeout { cycles: 10 })
    ));
    assert!(npu.status().busy);
}

#[test]
fn test_small_queues_apply_backpressure() {
    let mut npu = Npu::new(NpuConfig {
        queue_depth: 2,
        ..config()
    })
    .unwrap();
    npu.write_register(offset::CTRL, ctrl::ENABLE);

    let data = pattern(200, 9);
    npu.host_memory_mut().write_bytes(0, &data);
    npu.run_dma(&to_device(0, 0x1000, 200), LIMIT).unwrap();
    npu.run_dma(&from_device(0x1000, 0x5000, 200), LIMIT).unwrap();

    let mut back = vec![0u8; 200];
    npu.host_memory().peek_bytes(0x5000, &mut back);
    assert_eq!(back, data);
}

#[test]
fn test_from_device_tail_at_top_of_memory() {
    let mut npu = Npu::new(NpuConfig {
        memory_size: 4096,
        ..config()
    })
    .unwrap();
    npu.device_memory_mut().backdoor_write(4092, 0xBEEF_CAFE).unwrap();
    npu.device_memory_mut().backdoor_write(4088, 0x0403_0201).unwrap();

    npu.run_dma(&from_device(4094, 0x100, 2), LIMIT).unwrap();
    let mut back = [0u8; 2];
    npu.host_memory().peek_bytes(0x100, &mut back);
    assert_eq!(back, [0xEF, 0xBE]);

    // Unaligned start with a short final read
    npu.run_dma(&from_device(4089, 0x200, 7), LIMIT).unwrap();
    let mut back = [0u8; 7];
    npu.host_memory().peek_bytes(0x200, &mut back);
    assert_eq!(back, [0x02, 0x03, 0x04, 0xFE, 0xCA, 0xEF, 0xBE]);
    assert!(!npu.status().error);
}

#[test]
fn test_disabled_fetch_does_not_block_dma() {
    let mut npu = Npu::new(config()).unwrap();
    npu.write_register(offset::CTRL, 0);
    assert!(npu.submit(Instruction::add(1, 2)));
    for _ in 0..5 {
        npu.tick();
    }

    let data = pattern(64, 0x21);
    npu.host_memory_mut().write_bytes(0x3000, &data);
    npu.run_dma(&to_device(0x3000, 0x600, 64), 5000).unwrap();
    assert_eq!(device_bytes(&npu, 0x600, 64), data);
    assert_eq!(npu.dispatch_state(), DispatchState::Idle);

    npu.write_register(offset::CTRL, ctrl::ENABLE);
    npu.run_until_idle(LIMIT).unwrap();
    assert_eq!(npu.pop_result(), Some(3));
}

#[test]
fn test_latched_instruction_does_not_block_dma() {
    let mut npu = enabled_npu();
    npu.submit(Instruction::mul(5, 6));
    npu.tick();
    // Dispatch is busy, so the next instruction waits in the fetch path
    npu.submit(Instruction::add(4, 4));
    npu.tick();
    npu.write_register(offset::CTRL, 0);

    let data = pattern(96, 0x55);
    npu.host_memory_mut().write_bytes(0x3000, &data);
    npu.run_dma(&to_device(0x3000, 0x700, 96), 5000).unwrap();
    assert_eq!(device_bytes(&npu, 0x700, 96), data);

    npu.write_register(offset::CTRL, ctrl::ENABLE);
    npu.run_until_idle(LIMIT).unwrap();
    assert_eq!(npu.pop_result(), Some(30));
    assert_eq!(npu.pop_result(), Some(8));
}
