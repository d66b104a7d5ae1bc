//! 合成コアダンプに対するCoreProcessのテスト

use std::sync::Arc;
use tsuta_elf::{CacheConfig, Image, ImageCache};
use tsuta_target::{CoreProcess, Target};

const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;

/// プログラムヘッダだけの最小のELF64コアを組み立てる
fn build_core(phdrs: &[(u32, u64, u64, u64, u64)], payload: &[u8]) -> Vec<u8> {
    let phnum = phdrs.len() as u16;
    let payload_offset = 64 + 56 * phdrs.len() as u64;

    let mut data = Vec::new();
    data.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    data.extend_from_slice(&[0u8; 8]);
    data.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
    data.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    data.extend_from_slice(&1u32.to_le_bytes());
    data.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    data.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    data.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    data.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    data.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    data.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    data.extend_from_slice(&phnum.to_le_bytes());
    data.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    data.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    data.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    for &(p_type, offset, vaddr, filesz, memsz) in phdrs {
        data.extend_from_slice(&p_type.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(payload_offset + offset).to_le_bytes());
        data.extend_from_slice(&vaddr.to_le_bytes());
        data.extend_from_slice(&vaddr.to_le_bytes());
        data.extend_from_slice(&filesz.to_le_bytes());
        data.extend_from_slice(&memsz.to_le_bytes());
        data.extend_from_slice(&1u64.to_le_bytes());
    }
    data.extend_from_slice(payload);
    data
}

/// pr_pid=42, RIP/RSPを設定したNT_PRSTATUSノートを組み立てる
fn prstatus_note(pid: i32, rip: u64, rsp: u64) -> Vec<u8> {
    // struct elf_prstatus: pr_pid@32, pr_reg@112
    // user_regs_struct: rip@+128, rsp@+152
    let mut desc = vec![0u8; 336];
    desc[32..36].copy_from_slice(&pid.to_le_bytes());
    desc[240..248].copy_from_slice(&rip.to_le_bytes());
    desc[264..272].copy_from_slice(&rsp.to_le_bytes());

    let mut note = Vec::new();
    note.extend_from_slice(&5u32.to_le_bytes()); // namesz ("CORE\0")
    note.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    note.extend_from_slice(&1u32.to_le_bytes()); // NT_PRSTATUS
    note.extend_from_slice(b"CORE\0\0\0\0");
    note.extend_from_slice(&desc);
    note
}

fn synthetic_core() -> Arc<Image> {
    // データセグメント: 先頭8バイトだけファイルにあり、残りはBSS相当
    let mut payload = vec![0xaau8; 8];
    let note = prstatus_note(42, 0x401000, 0x7ffd0000);
    let note_offset = payload.len() as u64;
    payload.extend_from_slice(&note);

    let data = build_core(
        &[
            (PT_LOAD, 0, 0x601000, 8, 0x100),
            (PT_NOTE, note_offset, 0, note.len() as u64, note.len() as u64),
        ],
        &payload,
    );
    Arc::new(Image::from_bytes("synthetic-core", data).unwrap())
}

#[test]
fn test_core_tasks_and_registers() {
    let cache = ImageCache::new(CacheConfig::default());
    let core = synthetic_core();
    let process = CoreProcess::new(None, core, &cache).unwrap();

    assert_eq!(process.pid(), 42);
    assert_eq!(process.threads().unwrap(), vec![42]);

    let regs = process.registers(42).unwrap();
    assert_eq!(regs.pc(), 0x401000);
    assert_eq!(regs.sp(), 0x7ffd0000);

    assert!(process.registers(99).is_err());
}

#[test]
fn test_core_memory_zero_fill() {
    let cache = ImageCache::new(CacheConfig::default());
    let process = CoreProcess::new(None, synthetic_core(), &cache).unwrap();

    // ファイル部分はそのまま読める
    let mut buf = [0u8; 8];
    assert_eq!(process.read_memory(0x601000, &mut buf).unwrap(), 8);
    assert_eq!(buf, [0xaa; 8]);

    // ファイル部分を越えてp_memszまではゼロで埋まる
    let mut buf = [0xffu8; 16];
    assert_eq!(process.read_memory(0x601000, &mut buf).unwrap(), 16);
    assert_eq!(&buf[..8], &[0xaa; 8]);
    assert_eq!(&buf[8..], &[0u8; 8]);

    // セグメント途中から末尾まで
    let mut buf = [0xffu8; 8];
    assert_eq!(process.read_memory(0x6010f8, &mut buf).unwrap(), 8);
    assert_eq!(buf, [0u8; 8]);

    // どのセグメントにも無いアドレスは0バイト
    let mut buf = [0u8; 8];
    assert_eq!(process.read_memory(0xdead0000, &mut buf).unwrap(), 0);
}

#[test]
fn test_core_stop_resume_are_noops() {
    let cache = ImageCache::new(CacheConfig::default());
    let process = CoreProcess::new(None, synthetic_core(), &cache).unwrap();
    process.stop_all().unwrap();
    process.resume_all();
}

#[test]
fn test_not_a_core_rejected() {
    let cache = ImageCache::new(CacheConfig::default());
    let exe = Arc::new(Image::open(std::env::current_exe().unwrap()).unwrap());
    assert!(CoreProcess::new(None, exe, &cache).is_err());
}
