//! ELFイメージ解析のテスト

use tsuta_elf::notes::NT_GNU_BUILD_ID;
use tsuta_elf::{Image, PT_LOAD, PT_NOTE};

/// テスト用の最小のELF64イメージを組み立てる
///
/// セクションヘッダを持たない、プログラムヘッダだけのイメージ。
fn build_elf(e_type: u16, phdrs: &[(u32, u64, u64, u64, u64)], payload: &[u8]) -> Vec<u8> {
    let phnum = phdrs.len() as u16;
    let payload_offset = 64 + 56 * phdrs.len() as u64;

    let mut data = Vec::new();
    // e_ident
    data.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    data.extend_from_slice(&[0u8; 8]);
    data.extend_from_slice(&e_type.to_le_bytes());
    data.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    data.extend_from_slice(&1u32.to_le_bytes()); // e_version
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
    assert_eq!(data.len(), 64);

    for &(p_type, offset, vaddr, filesz, memsz) in phdrs {
        data.extend_from_slice(&p_type.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // p_flags
        data.extend_from_slice(&(payload_offset + offset).to_le_bytes());
        data.extend_from_slice(&vaddr.to_le_bytes());
        data.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        data.extend_from_slice(&filesz.to_le_bytes());
        data.extend_from_slice(&memsz.to_le_bytes());
        data.extend_from_slice(&1u64.to_le_bytes()); // p_align
    }
    data.extend_from_slice(payload);
    data
}

fn note_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u32.to_le_bytes()); // namesz
    payload.extend_from_slice(&20u32.to_le_bytes()); // descsz
    payload.extend_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
    payload.extend_from_slice(b"GNU\0");
    payload.extend_from_slice(&[0xabu8; 20]);
    payload
}

#[test]
fn test_parse_synthetic_image() {
    let payload = note_payload();
    let data = build_elf(
        2, // ET_EXEC
        &[
            (PT_LOAD, 0, 0x1000, 0x100, 0x3000),
            (PT_LOAD, 0, 0x2000, 0x100, 0x500),
            (PT_NOTE, 0, 0, payload.len() as u64, payload.len() as u64),
        ],
        &payload,
    );

    let image = Image::from_bytes("synthetic", data).unwrap();
    assert!(image.is_64());
    assert!(!image.is_core());
    assert_eq!(image.segments().len(), 3);

    let notes = image.notes().unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].name, "GNU");
    assert_eq!(notes[0].n_type, NT_GNU_BUILD_ID);
    assert_eq!(notes[0].desc, &[0xab; 20]);
}

#[test]
fn test_segment_for_address_prefers_smallest() {
    let data = build_elf(
        2,
        &[
            (PT_LOAD, 0, 0x1000, 0x100, 0x3000),
            (PT_LOAD, 0, 0x2000, 0x100, 0x500),
        ],
        &[],
    );
    let image = Image::from_bytes("synthetic", data).unwrap();

    // 両方のセグメントに含まれるアドレスはp_memszが小さい方
    let seg = image.segment_for_address(0x2100).unwrap();
    assert_eq!(seg.vaddr, 0x2000);

    // 片方にしか含まれないアドレス
    let seg = image.segment_for_address(0x1100).unwrap();
    assert_eq!(seg.vaddr, 0x1000);
    let seg = image.segment_for_address(0x3500).unwrap();
    assert_eq!(seg.vaddr, 0x1000);

    // どのセグメントにも無いアドレス
    assert!(image.segment_for_address(0x100).is_none());
    assert!(image.segment_for_address(0x4000).is_none());
}

#[test]
fn test_truncated_segment_bytes_clamped() {
    // p_fileszがファイル末尾を越えるセグメント（切り詰められたコア）
    let data = build_elf(4, &[(PT_LOAD, 0, 0x1000, 0x10000, 0x10000)], &[0x5a; 32]);
    let image = Image::from_bytes("truncated", data).unwrap();
    assert!(image.is_core());

    let seg = image.segment_for_address(0x1000).unwrap();
    let bytes = image.segment_bytes(seg);
    assert_eq!(bytes.len(), 32);
    assert!(bytes.iter().all(|&b| b == 0x5a));
}

#[test]
fn test_open_own_executable() {
    let image = Image::open(std::env::current_exe().unwrap()).unwrap();
    assert!(!image.is_core());
    assert!(!image.segments().is_empty());
    assert!(image.segments().iter().any(|s| s.p_type == PT_LOAD));

    // テストバイナリには必ず.textがある
    assert!(image.has_section(".text"));
    assert!(image.section_data(".text").is_some());

    // 同じセクションの2回目のアクセスはキャッシュから同じスライスが返る
    let a = image.section_data(".text").unwrap();
    let b = image.section_data(".text").unwrap();
    assert_eq!(a.as_ptr(), b.as_ptr());
}

#[test]
fn test_bad_magic_rejected() {
    assert!(Image::from_bytes("junk", b"not an elf file".to_vec()).is_err());
    assert!(Image::from_bytes("empty", Vec::new()).is_err());
}
