//! Quantified properties: field coverage, signature/execution
//! equivalence, selector determinism, flag laws, byte round-trips and
//! executor/AST agreement.

use cfg86::{
    alu, AstBuilder, AstInterpreter, CpuState, ExecutionHelper, FlatMemory, MemoryPort, Parser,
    SegReg, SegmentedAddress, Transition, Width,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CODE: SegmentedAddress = SegmentedAddress::new(0x1000, 0x0000);

/// A representative slice of the catalog, used by several properties.
const CATALOG_SAMPLES: &[&[u8]] = &[
    &[0xB0, 0x7F],                         // mov al, imm8
    &[0xB8, 0x34, 0x12],                   // mov ax, imm16
    &[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12], // mov eax, imm32
    &[0x88, 0xC4],                         // mov ah, al
    &[0x89, 0x1E, 0x00, 0x20],             // mov [0x2000], bx
    &[0x8A, 0x07],                         // mov al, [bx]
    &[0x8B, 0x44, 0x02],                   // mov ax, [si+2]
    &[0x8C, 0xD8],                         // mov ax, ds
    &[0x8E, 0xC0],                         // mov es, ax
    &[0xA0, 0x10, 0x00],                   // mov al, moffs
    &[0xA3, 0x10, 0x00],                   // mov moffs, ax
    &[0x8D, 0x47, 0x10],                   // lea ax, [bx+0x10]
    &[0x00, 0xD8],                         // add al, bl
    &[0x01, 0xD8],                         // add ax, bx
    &[0x11, 0xC8],                         // adc ax, cx
    &[0x19, 0xD1],                         // sbb cx, dx
    &[0x21, 0xD9],                         // and cx, bx
    &[0x29, 0xD8],                         // sub ax, bx
    &[0x31, 0xC9],                         // xor cx, cx
    &[0x39, 0xC3],                         // cmp bx, ax
    &[0x04, 0x42],                         // add al, imm8
    &[0x05, 0x01, 0x80],                   // add ax, imm16
    &[0x3D, 0xFF, 0x7F],                   // cmp ax, imm16
    &[0x80, 0xC3, 0x05],                   // add bl, imm8
    &[0x81, 0xC3, 0x00, 0x10],             // add bx, imm16
    &[0x83, 0xC3, 0xFF],                   // add bx, -1
    &[0x84, 0xDB],                         // test bl, bl
    &[0x85, 0xC0],                         // test ax, ax
    &[0xA8, 0x0F],                         // test al, imm8
    &[0x86, 0xC3],                         // xchg al, bl
    &[0x87, 0xD9],                         // xchg cx, bx
    &[0x91],                               // xchg ax, cx
    &[0x40],                               // inc ax
    &[0x4B],                               // dec bx
    &[0xFE, 0xC0],                         // inc al
    &[0xFF, 0x07],                         // inc word [bx]
    &[0x50],                               // push ax
    &[0x58],                               // pop ax
    &[0x06],                               // push es
    &[0x1F],                               // pop ds
    &[0x68, 0x34, 0x12],                   // push imm16
    &[0x9C],                               // pushf
    &[0x9D],                               // popf
    &[0x9E],                               // sahf
    &[0x9F],                               // lahf
    &[0x98],                               // cbw
    &[0x99],                               // cwd
    &[0xD0, 0xE0],                         // shl al, 1
    &[0xD1, 0xF8],                         // sar ax, 1
    &[0xD2, 0xC8],                         // ror al, cl
    &[0xC0, 0xC0, 0x03],                   // rol al, 3
    &[0xC1, 0xE3, 0x04],                   // shl bx, 4
    &[0xF6, 0xD8],                         // neg al
    &[0xF7, 0xD3],                         // not bx
    &[0xF6, 0xE3],                         // mul bl
    &[0xF7, 0xE3],                         // mul bx
    &[0xF7, 0xEB],                         // imul bx
    &[0xF6, 0xC3, 0x0F],                   // test bl, imm8
    &[0xD7],                               // xlat
    &[0xC4, 0x1E, 0x00, 0x06],             // les bx, [0x600]
    &[0xC5, 0x36, 0x00, 0x06],             // lds si, [0x600]
    &[0xF8],                               // clc
    &[0xF9],                               // stc
    &[0xF5],                               // cmc
    &[0xFC],                               // cld
    &[0xFD],                               // std
    &[0x90],                               // nop
    &[0xEB, 0x10],                         // jmp short
    &[0xE9, 0x00, 0x01],                   // jmp near
    &[0xEA, 0x00, 0x01, 0x00, 0xF0],       // jmp far
    &[0x74, 0x10],                         // je
    &[0x7C, 0xF0],                         // jl
    &[0x0F, 0x84, 0x00, 0x01],             // je near
    &[0xE2, 0xFE],                         // loop
    &[0xE3, 0x05],                         // jcxz
    &[0xE8, 0x10, 0x00],                   // call near
    &[0x9A, 0x00, 0x01, 0x00, 0xF0],       // call far
    &[0xC3],                               // ret
    &[0xC2, 0x04, 0x00],                   // ret imm16
    &[0xCB],                               // retf
    &[0xCF],                               // iret
    &[0xCD, 0x21],                         // int 21h
    &[0xF3, 0xA4],                         // rep movsb
    &[0xAB],                               // stosw
    &[0xAD],                               // lodsw
    &[0x2E, 0x8B, 0x07],                   // mov ax, cs:[bx]
    &[0xFE, 0x38, 0x11],                   // host callback
];

/// Fields tile the instruction footprint exactly, in order, gap-free.
#[test]
fn field_coverage() {
    let parser = Parser::new();
    for bytes in CATALOG_SAMPLES {
        let inst = parser.parse_slice(bytes, CODE).unwrap();
        assert_eq!(inst.len() as usize, bytes.len(), "{bytes:02X?}");
        let mut cursor = CODE.linear();
        let mut total = 0u32;
        for field in inst.fields() {
            assert_eq!(field.address(), cursor, "gap in {bytes:02X?}");
            assert_eq!(
                field.signature().len(),
                field.len() as usize,
                "signature length in {bytes:02X?}"
            );
            cursor += field.len() as u32;
            total += field.len() as u32;
        }
        assert_eq!(total as usize, bytes.len(), "{bytes:02X?}");
    }
}

/// The field footprint reconstructs the encoded bytes.
#[test]
fn encode_round_trip() {
    let parser = Parser::new();
    for bytes in CATALOG_SAMPLES {
        let inst = parser.parse_slice(bytes, CODE).unwrap();
        assert_eq!(inst.encode_bytes(), *bytes, "{bytes:02X?}");
    }
}

/// Memory images that differ only in wildcard (payload) bytes parse to
/// the same operation and execute according to the bytes actually in
/// memory.
#[test]
fn signature_execution_equivalence() {
    let parser = Parser::new();

    let mut mem_a = FlatMemory::new(0x10_0000);
    mem_a.load_bytes(CODE.linear(), &[0xB8, 0x34, 0x12]);
    let mut mem_b = FlatMemory::new(0x10_0000);
    mem_b.load_bytes(CODE.linear(), &[0xB8, 0x90, 0x12]);

    let inst = parser.parse(&mem_a, CODE).unwrap();
    let sig = inst.signature();
    assert!(sig.matches_memory(&mem_a, CODE.linear()));
    assert!(sig.matches_memory(&mem_b, CODE.linear()));

    // Same parsed node, executed against either image, reads that
    // image's immediate.
    let mut run = |mem: &mut FlatMemory| {
        let mut state = CpuState::new();
        state.set_seg(SegReg::Cs, CODE.segment);
        let mut h = ExecutionHelper::new(&mut state, mem);
        cfg86::execute(&inst, &mut h).unwrap();
        state.ax()
    };
    assert_eq!(run(&mut mem_a), 0x1234);
    assert_eq!(run(&mut mem_b), 0x1290);
}

/// Flag computation against the reference expressions, exhaustively at
/// width 8 and sampled at width 16.
#[test]
fn flag_laws_add_sub() {
    fn reference_add(w: Width, a: u64, b: u64) -> (u64, bool, bool, bool, bool, bool, bool) {
        let mask = w.mask();
        let r = (a + b) & mask;
        let cf = a + b > mask;
        let of = (a ^ r) & (b ^ r) & w.sign_bit() != 0;
        let zf = r == 0;
        let sf = r & w.sign_bit() != 0;
        let pf = (r as u8).count_ones() % 2 == 0;
        let af = (a ^ b ^ r) & 0x10 != 0;
        (r, cf, of, zf, sf, pf, af)
    }

    fn check_add(w: Width, a: u64, b: u64) {
        let mut s = CpuState::new();
        let r = alu::add(&mut s, w, a, b);
        let (er, cf, of, zf, sf, pf, af) = reference_add(w, a, b);
        assert_eq!(r, er, "add {a:#x}+{b:#x}");
        assert_eq!(s.carry(), cf, "CF {a:#x}+{b:#x}");
        assert_eq!(s.overflow(), of, "OF {a:#x}+{b:#x}");
        assert_eq!(s.zero(), zf, "ZF {a:#x}+{b:#x}");
        assert_eq!(s.sign(), sf, "SF {a:#x}+{b:#x}");
        assert_eq!(s.parity(), pf, "PF {a:#x}+{b:#x}");
        assert_eq!(s.auxiliary(), af, "AF {a:#x}+{b:#x}");
    }

    for a in 0..=0xFFu64 {
        for b in 0..=0xFFu64 {
            check_add(Width::W8, a, b);
        }
    }

    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..10_000 {
        check_add(Width::W16, rng.gen_range(0..=0xFFFF), rng.gen_range(0..=0xFFFF));
    }

    // Subtraction: CF is the borrow, OF symmetric to add.
    for a in [0u64, 1, 0x7F, 0x80, 0xFF, 0x55] {
        for b in [0u64, 1, 0x7F, 0x80, 0xFF, 0xAA] {
            let mut s = CpuState::new();
            let r = alu::sub(&mut s, Width::W8, a, b);
            assert_eq!(r, a.wrapping_sub(b) & 0xFF);
            assert_eq!(s.carry(), b > a, "borrow {a:#x}-{b:#x}");
            assert_eq!(
                s.overflow(),
                (a ^ b) & (a ^ r) & 0x80 != 0,
                "OF {a:#x}-{b:#x}"
            );
        }
    }
}

/// The imperative executor and the interpreted execution AST produce
/// identical machine states for a sampled subset of the catalog.
#[test]
fn executor_and_ast_agree() {
    // String ops and callbacks are intrinsic-only in the AST interpreter.
    let skip = |bytes: &[u8]| {
        matches!(bytes[0], 0xA4..=0xA7 | 0xAA..=0xAF | 0xF3 | 0xF2)
            || (bytes[0] == 0xFE && bytes.get(1) == Some(&0x38))
    };

    let parser = Parser::new();
    let builder = AstBuilder::new();
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);

    for bytes in CATALOG_SAMPLES.iter().filter(|b| !skip(b)) {
        for _ in 0..8 {
            let mut seed_state = CpuState::new();
            seed_state.set_seg(SegReg::Cs, CODE.segment);
            seed_state.set_seg(SegReg::Ds, 0x2000);
            seed_state.set_seg(SegReg::Es, 0x3000);
            seed_state.set_seg(SegReg::Ss, 0x4000);
            seed_state.set_sp(0x0100);
            seed_state.set_ax(rng.gen());
            seed_state.set_bx(rng.gen_range(0..0x400));
            seed_state.set_cx(rng.gen());
            seed_state.set_dx(rng.gen());
            seed_state.set_si(rng.gen_range(0..0x400));
            seed_state.set_di(rng.gen_range(0..0x400));
            seed_state.set_carry(rng.gen());
            seed_state.set_zero(rng.gen());
            seed_state.set_sign(rng.gen());
            seed_state.set_overflow(rng.gen());

            let mut seed_mem = FlatMemory::new(0x6_0000);
            seed_mem.load_bytes(CODE.linear(), bytes);
            for addr in (0x20000..0x20800).step_by(2) {
                seed_mem.write_u16(addr, rng.gen());
            }
            // A sane far pointer for LES/LDS and friends.
            seed_mem.write_u16(0x20600, rng.gen());
            seed_mem.write_u16(0x20602, 0x5000);
            // Plausible stack content for the pop/ret family.
            seed_mem.write_u16(0x400FA, 0x0202);
            seed_mem.write_u16(0x400FC, 0x1000);
            seed_mem.write_u16(0x400FE, rng.gen_range(0..0x400));
            seed_mem.set_ivt_entry(0x21, SegmentedAddress::new(0xF000, 0x0080));

            let inst = parser.parse(&seed_mem, CODE).unwrap();

            // Imperative side.
            let mut exec_state = seed_state.clone();
            let mut exec_mem = seed_mem.clone();
            let exec_result = {
                let mut h = ExecutionHelper::new(&mut exec_state, &mut exec_mem);
                cfg86::execute(&inst, &mut h)
            };

            // AST side.
            let mut ast_state = seed_state.clone();
            let mut ast_mem = seed_mem.clone();
            let ast = inst.generate_execution_ast(&builder);
            let ast_result = AstInterpreter::new(
                &mut ast_state,
                &mut ast_mem,
                inst.next_address().offset,
            )
            .run(&ast);

            match (exec_result, ast_result) {
                (Ok(transition), Ok(())) => {
                    // Mirror the executor's IP/CS update the loop performs.
                    match transition {
                        Transition::FallThrough | Transition::Callback { .. } => {
                            let next = inst.next_address();
                            exec_state.set_seg(SegReg::Cs, next.segment);
                            exec_state.set_ip(next.offset);
                        }
                        Transition::Taken(t) | Transition::Return(t) => {
                            exec_state.set_seg(SegReg::Cs, t.segment);
                            exec_state.set_ip(t.offset);
                        }
                        Transition::Halt => {
                            let next = inst.next_address();
                            exec_state.set_seg(SegReg::Cs, next.segment);
                            exec_state.set_ip(next.offset);
                        }
                    }
                    assert_eq!(
                        exec_state,
                        ast_state,
                        "state mismatch for {bytes:02X?} ({})",
                        inst.disassemble()
                    );
                    assert_eq!(
                        exec_mem.as_slice(),
                        ast_mem.as_slice(),
                        "memory mismatch for {bytes:02X?}"
                    );
                }
                (Err(exec_err), Err(ast_err)) => {
                    assert_eq!(
                        cfg86::AstError::Exception(exec_err),
                        ast_err,
                        "different failures for {bytes:02X?}"
                    );
                }
                (exec, ast) => {
                    panic!("divergent outcomes for {bytes:02X?}: {exec:?} vs {ast:?}");
                }
            }
        }
    }
}

/// Executing the same image twice from identical state yields identical
/// final states and identical edge sets. Selector insertion-order
/// determinism is exercised in the unit tests of the store.
#[test]
fn graph_runs_are_deterministic() {
    use cfg86::{CfgCpu, CpuConfig};

    let image: &[u8] = &[
        0xB9, 0x03, 0x00, // mov cx, 3
        0xB8, 0x00, 0x00, // mov ax, 0
        0x40, // inc ax
        0x49, // dec cx
        0x75, 0xFC, // jnz -4
        0xF4, // hlt
    ];
    let run = || {
        let mut mem = FlatMemory::new(0x10_0000);
        mem.load_bytes(CODE.linear(), image);
        let mut cpu = CfgCpu::new(mem, CpuConfig::default());
        cpu.state_mut().set_seg(SegReg::Cs, CODE.segment);
        cpu.run().unwrap();
        let mut edges: Vec<(usize, cfg86::EdgeKind, usize)> = cpu
            .store()
            .edges()
            .into_iter()
            .map(|(a, k, b)| (a.index(), k, b.index()))
            .collect();
        edges.sort();
        (cpu.state().clone(), edges)
    };
    let (s1, e1) = run();
    let (s2, e2) = run();
    assert_eq!(s1.ax(), 3);
    assert_eq!(s1, s2);
    assert_eq!(e1, e2);
    assert!(!e1.is_empty());
}
