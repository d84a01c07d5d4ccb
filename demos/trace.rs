//! Run a flat binary image on the CFG CPU and dump the discovered graph.
//!
//! Step-by-step logging comes from the crate's `log` output:
//! `RUST_LOG=trace cargo run --example trace -- image.bin`

use argh::FromArgs;
use cfg86::{CfgCpu, CpuConfig, FlatMemory, MemoryPort, RunExit, SegReg, SegmentedAddress};

#[derive(FromArgs)]
/// Execute a flat real-mode image until HLT or the cycle budget runs out.
struct Args {
    /// path to the binary image
    #[argh(positional)]
    image: String,

    /// load segment (hex, default 1000)
    #[argh(option, default = "0x1000", from_str_fn(parse_hex16))]
    segment: u16,

    /// cycle budget (default 100000)
    #[argh(option, default = "100_000")]
    budget: u64,

    /// print the discovered control-flow graph on exit
    #[argh(switch)]
    graph: bool,
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() {
    env_logger::init();
    let args: Args = argh::from_env();
    let bytes = match std::fs::read(&args.image) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: {err}", args.image);
            std::process::exit(1);
        }
    };

    let origin = SegmentedAddress::new(args.segment, 0);
    let mut mem = FlatMemory::new(0x10_0000);
    mem.load_bytes(origin.linear(), &bytes);

    let mut cpu = CfgCpu::new(
        mem,
        CpuConfig {
            slice_budget: args.budget,
            poll_interrupts: true,
        },
    );
    cpu.state_mut().set_seg(SegReg::Cs, origin.segment);
    cpu.state_mut().set_seg(SegReg::Ds, origin.segment);
    cpu.state_mut().set_seg(SegReg::Es, origin.segment);
    cpu.state_mut().set_seg(SegReg::Ss, 0x9000);
    cpu.state_mut().set_sp(0xFFFE);
    cpu.state_mut().set_ip(origin.offset);

    match cpu.run() {
        Ok(exit) => {
            match exit {
                RunExit::Halted => println!("halted"),
                RunExit::BudgetExhausted => println!("budget exhausted"),
                RunExit::Stopped => println!("stopped"),
                RunExit::Paused => println!("paused"),
            }
            println!("{}", cpu.state());
            if args.graph {
                print!("{}", cpu.store());
            }
        }
        Err(fault) => {
            eprintln!("vm fault: {fault}");
            eprintln!("{}", cpu.state());
            std::process::exit(1);
        }
    }
}
