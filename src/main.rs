//! fpga-npu-emu: cycle-stepped emulator for an FPGA NPU core

use std::env;
use std::path::Path;

use anyhow::Context;
use fpga_npu_emu::config::Config;
use fpga_npu_emu::device::{ctrl, offset, DmaDescriptor, DmaDirection, Instruction, Npu};

const MAX_CYCLES: u64 = 100_000;

fn main() -> anyhow::Result<()> {
    // Initialize logging (RUST_LOG overrides)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();

    let mut dump_registers = false;
    let mut config_path: Option<&str> = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dump-registers" => dump_registers = true,
            "--sample-config" => {
                print!("{}", Config::sample_config());
                return Ok(());
            }
            "--config" => {
                config_path = Some(iter.next().context("--config needs a path")?.as_str());
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    let config = match config_path {
        Some(path) => {
            let mut config = Config::get().clone();
            config.merge(Config::load_from_file(Path::new(path))?);
            config
        }
        None => Config::get().clone(),
    };
    let npu_config = config.resolve()?;
    let mut npu = Npu::new(npu_config)?;

    if dump_registers {
        print_registers(&npu);
        return Ok(());
    }

    run_demo(&mut npu)
}

fn print_usage() {
    println!("Usage: fpga-npu-emu [--config <path>] [--dump-registers] [--sample-config]");
    println!();
    println!("Without options, runs a short DMA and instruction demo.");
    if let Some(path) = Config::user_config_path() {
        println!("User config: {}", path.display());
    }
}

fn print_registers(npu: &Npu) {
    println!("Register map");
    println!("============");
    for (info, value) in npu.dump_registers() {
        println!("{}  = 0x{:08X}", info, value);
    }
    println!();
    println!("{}", npu.status());
}

fn run_demo(npu: &mut Npu) -> anyhow::Result<()> {
    npu.write_register(offset::CTRL, ctrl::ENABLE | ctrl::INT_EN);

    // Host-to-device transfer
    let data: Vec<u32> = (0..16).map(|i| 0xC0DE_0000 | i).collect();
    npu.host_memory_mut().write_words(0x1000, &data);
    let to_device = DmaDescriptor {
        src_addr: 0x1000,
        dst_addr: 0x0,
        length: 64,
        direction: DmaDirection::ToDevice,
        interrupt_enable: true,
    };
    let cycles = npu.run_dma(&to_device, MAX_CYCLES)?;
    println!("DMA to device: 64 bytes in {} cycles (irq={})", cycles, npu.irq_line());
    npu.acknowledge_interrupt();

    // Load back what the DMA wrote, then some arithmetic
    let program = [
        Instruction::load(0),
        Instruction::load(15),
        Instruction::add(5, 7),
        Instruction::mul(12, 12),
        Instruction::mac(2, 3),
        Instruction::mac(4, 5),
        Instruction::store(16, 0x5A),
    ];
    let results = npu.execute_batch(&program, MAX_CYCLES)?;
    for (i, value) in results.iter().enumerate() {
        println!("result[{}] = 0x{:08X}", i, value);
    }

    // Device-to-host transfer
    let from_device = DmaDescriptor {
        src_addr: 0x0,
        dst_addr: 0x2000,
        length: 68,
        direction: DmaDirection::FromDevice,
        interrupt_enable: false,
    };
    let cycles = npu.run_dma(&from_device, MAX_CYCLES)?;
    println!("DMA from device: 68 bytes in {} cycles", cycles);
    println!();
    println!("{}", npu.host_memory().hexdump(0x2000, 68));
    println!();
    println!("{}", npu.status());
    println!("{}", npu.perf_counters());
    Ok(())
}
