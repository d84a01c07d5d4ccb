//! Linear-sweep disassembly of a flat binary image.

use argh::FromArgs;
use cfg86::{ParseError, Parser, SegmentedAddress};

#[derive(FromArgs)]
/// Disassemble a flat real-mode image.
struct Args {
    /// path to the binary image
    #[argh(positional)]
    image: String,

    /// load segment (hex, default 1000)
    #[argh(option, default = "0x1000", from_str_fn(parse_hex16))]
    segment: u16,

    /// load offset within the segment (hex, default 0)
    #[argh(option, default = "0", from_str_fn(parse_hex16))]
    offset: u16,
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() {
    let args: Args = argh::from_env();
    let bytes = match std::fs::read(&args.image) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("{}: {err}", args.image);
            std::process::exit(1);
        }
    };

    let parser = Parser::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let addr = SegmentedAddress::new(args.segment, args.offset.wrapping_add(pos as u16));
        match parser.parse_slice(&bytes[pos..], addr) {
            Ok(inst) => {
                let len = inst.len() as usize;
                let hex: Vec<String> = bytes[pos..pos + len]
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect();
                println!("{addr}  {:<18} {}", hex.join(" "), inst.disassemble());
                pos += len;
            }
            Err(ParseError::Truncated { .. }) => break,
            Err(_) => {
                println!("{addr}  {:02X}                 (db)", bytes[pos]);
                pos += 1;
            }
        }
    }
}
