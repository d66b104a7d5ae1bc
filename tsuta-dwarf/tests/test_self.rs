//! 自プロセスの実行ファイルに対するDWARF解析のテスト
//!
//! テストバイナリ自身はデバッグ情報付きでビルドされるため、
//! 解析対象として常に利用できます。

use std::sync::Arc;
use tsuta_dwarf::frames::CfaRule;
use tsuta_dwarf::{DwarfInfo, FrameTable, UnwindRow};
use tsuta_elf::{CacheConfig, Image, ImageCache};

/// 行番号・CFIの検証対象にする関数
///
/// インライン化されると行番号表に固有のアドレスを持たなくなるため
/// 禁止しておく。
#[inline(never)]
fn probe_function_for_tests() -> u64 {
    std::hint::black_box(42)
}

fn load_self() -> (Arc<Image>, DwarfInfo) {
    let cache = ImageCache::new(CacheConfig::default());
    let image = cache
        .image_for_path(std::env::current_exe().unwrap())
        .unwrap();
    let info = DwarfInfo::new(image.clone(), &cache).unwrap();
    (image, info)
}

/// シンボルテーブルからプローブ関数の静的アドレスを得る
fn probe_address(info: &DwarfInfo) -> u64 {
    // 実行時アドレスからバイアスを引く代わりに、シンボルテーブルの
    // 静的アドレスを使う
    let sym = info
        .symbols()
        .all_symbols()
        .find(|s| s.demangled_name.contains("probe_function_for_tests"))
        .expect("probe function should be in the symbol table");
    sym.address
}

#[test]
fn test_units_enumerate() {
    let (_image, info) = load_self();
    assert!(info.has_debug_info(), "test binaries carry debug info");
    assert!(!info.units().is_empty());

    // 先頭の単位は解読できる
    let unit = info.unit(0).unwrap();
    assert!(unit.header.version() >= 2);
}

#[test]
fn test_die_offset_contract() {
    let (_image, info) = load_self();
    let slot = &info.units()[0];

    // オフセット0は空
    assert!(slot.validate_offset(gimli::DebugInfoOffset(0)).is_none());
    // 単位の範囲外も空
    assert!(slot
        .validate_offset(gimli::DebugInfoOffset(usize::MAX / 2))
        .is_none());

    // ルートDIEのオフセットはそのまま返る
    let unit = info.unit(0).unwrap();
    let root_off = {
        let mut entries = unit.entries();
        let (_, root) = entries.next_dfs().unwrap().unwrap();
        root.offset()
    };
    let section_off = root_off.to_debug_info_offset(&unit.header).unwrap();
    let validated = slot.validate_offset(section_off).unwrap();
    assert_eq!(validated, root_off);
}

#[test]
fn test_parent_reconstruction() {
    let (_image, info) = load_self();
    let slot = &info.units()[0];
    let unit = info.unit(0).unwrap();

    // ルートの子の親はルートになる
    let mut entries = unit.entries();
    let (_, root) = entries.next_dfs().unwrap().unwrap();
    let root_off = root.offset();
    let Some((delta, child)) = entries.next_dfs().unwrap() else {
        // 子を持たない単位ならテスト対象なし
        return;
    };
    assert_eq!(delta, 1);
    let child_off = child.offset();

    assert_eq!(slot.parent_of(info.dwarf(), child_off).unwrap(), Some(root_off));
    // ルート自身の親は無い
    assert_eq!(slot.parent_of(info.dwarf(), root_off).unwrap(), None);
}

#[test]
fn test_function_lookup_and_lines() {
    let (_image, info) = load_self();
    let addr = probe_address(&info);

    // 関数の中ほどのアドレスで単位が見つかる
    let unit_idx = info
        .unit_index_for_address(addr)
        .expect("probe function should be covered by a unit");

    // 行番号マトリクスはこのテストファイルの行を返す
    let matrix = info.lines(unit_idx).unwrap().expect("unit should have lines");
    let (file, line, _col) = matrix
        .source_from_addr(addr)
        .expect("probe function should have line info");
    assert!(
        file.ends_with("test_self.rs"),
        "unexpected file for probe function: {}",
        file
    );
    assert!(line > 0);

    // DWARFの関数検索でも同じ関数が出てくる
    let frames = tsuta_dwarf::functions::frames_at(&info, addr).unwrap();
    assert!(!frames.is_empty());
    let concrete = frames.last().unwrap();
    assert!(!concrete.inlined);
    let name = concrete.name.as_deref().unwrap_or("");
    assert!(
        tsuta_dwarf::symbols::demangle(name).contains("probe_function_for_tests"),
        "unexpected function name: {}",
        name
    );
}

#[test]
fn test_cfi_at_function_entry() {
    let (_image, info) = load_self();
    let addr = probe_address(&info);

    let table: &FrameTable = info.frames().expect("executable should have .eh_frame");
    let mut scratch = tsuta_dwarf::frames::UnwindScratch::new();
    let row: UnwindRow = table
        .unwind_row_at(addr, &mut scratch)
        .unwrap()
        .expect("probe function should be covered by an FDE");

    // FDEの先頭ではCIEの初期規則そのもの:
    // x86-64のエントリ時点のCFAはRSP+8、RAはCFA-8に保存されている
    match row.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            assert_eq!(register, 7, "CFA should be based on RSP at entry");
            assert_eq!(offset, 8);
        }
        other => panic!("unexpected CFA rule at function entry: {:?}", other),
    }
    assert_eq!(row.ra_register, 16);
    assert!(!row.signal_frame);
}

#[test]
fn test_no_fde_outside_code() {
    let (_image, info) = load_self();
    let table = info.frames().unwrap();
    let mut scratch = tsuta_dwarf::frames::UnwindScratch::new();
    // アドレス1がコードであるはずはない
    assert!(table.unwind_row_at(1, &mut scratch).unwrap().is_none());
}

#[test]
fn test_source_lookup_uncovered_address() {
    let (_image, info) = load_self();
    // どの単位にも属さないアドレスは空
    assert!(info.unit_index_for_address(1).is_none());
    assert!(info.source_from_addr(1).unwrap().is_none());
}

#[test]
fn test_probe_function_runs() {
    // プローブ関数がリンクされ続けるように実際に呼ぶ
    assert_eq!(probe_function_for_tests(), 42);
}
