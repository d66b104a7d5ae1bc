//! 関数DIEとインライン展開の解決機能

use crate::info::{DwarfInfo, Slice};
use crate::Result;
use gimli::AttributeValue;

/// PCを含む関数（またはインライン関数）の情報
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// 関数名（マングルされたまま）
    pub name: Option<String>,
    /// インライン展開されたフレームかどうか
    pub inlined: bool,
    /// インライン呼び出し元のファイル
    pub call_file: Option<String>,
    /// インライン呼び出し元の行番号
    pub call_line: Option<u32>,
    /// 単位インデックスとDIEオフセット（引数の解読に使う）
    pub die: (usize, gimli::UnitOffset),
}

/// PC（静的アドレス）を含む関数のフレーム列を取得する
///
/// DIEツリーをルートから降りてPCを含むDW_TAG_subprogramを見つけ、
/// その配下のDW_TAG_inlined_subroutine連鎖をたどります。返り値は
/// 最内のインライン関数が先頭、実体の関数が末尾です。見つからない
/// 場合は空のベクタです。
pub fn frames_at(info: &DwarfInfo, addr: u64) -> Result<Vec<FunctionInfo>> {
    let Some(unit_idx) = info.unit_index_for_address(addr) else {
        return Ok(Vec::new());
    };
    let unit = info.unit(unit_idx)?;
    let dwarf = info.dwarf();

    let mut chain = Vec::new();
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    walk_node(dwarf, unit, root, addr, unit_idx, &mut chain)?;

    // インライン呼び出し元のファイル番号を行番号テーブルで解決する
    if chain.iter().any(|f| f.info.inlined) {
        if let Some(matrix) = info.lines(unit_idx)? {
            for frame in chain.iter_mut() {
                if let Some(idx) = frame.call_file_index.take() {
                    frame.info.call_file = matrix.file(idx).map(str::to_string);
                }
            }
        }
    }

    // 最内フレームを先頭に
    let mut out: Vec<FunctionInfo> = chain.into_iter().map(|f| f.info).collect();
    out.reverse();
    Ok(out)
}

struct PendingFrame {
    info: FunctionInfo,
    call_file_index: Option<u64>,
}

fn walk_node(
    dwarf: &gimli::Dwarf<Slice>,
    unit: &gimli::Unit<Slice>,
    node: gimli::EntriesTreeNode<'_, '_, '_, Slice>,
    addr: u64,
    unit_idx: usize,
    chain: &mut Vec<PendingFrame>,
) -> Result<bool> {
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_subprogram => {
                if !die_contains(dwarf, unit, entry, addr)? {
                    continue;
                }
                chain.push(make_frame(dwarf, unit, entry, unit_idx, false)?);
                walk_node(dwarf, unit, child, addr, unit_idx, chain)?;
                return Ok(true);
            }
            gimli::DW_TAG_inlined_subroutine => {
                if !die_contains(dwarf, unit, entry, addr)? {
                    continue;
                }
                chain.push(make_frame(dwarf, unit, entry, unit_idx, true)?);
                walk_node(dwarf, unit, child, addr, unit_idx, chain)?;
                return Ok(true);
            }
            // 関数を包みうるコンテナは無条件に降りる
            gimli::DW_TAG_namespace
            | gimli::DW_TAG_module
            | gimli::DW_TAG_lexical_block
            | gimli::DW_TAG_try_block
            | gimli::DW_TAG_catch_block
            | gimli::DW_TAG_structure_type
            | gimli::DW_TAG_class_type => {
                if walk_node(dwarf, unit, child, addr, unit_idx, chain)? {
                    return Ok(true);
                }
            }
            _ => {}
        }
    }
    Ok(false)
}

fn make_frame(
    dwarf: &gimli::Dwarf<Slice>,
    unit: &gimli::Unit<Slice>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Slice>,
    unit_idx: usize,
    inlined: bool,
) -> Result<PendingFrame> {
    let name = die_name(dwarf, unit, entry, 0)?;

    let mut call_file_index = None;
    let mut call_line = None;
    if inlined {
        match entry.attr_value(gimli::DW_AT_call_file)? {
            Some(AttributeValue::FileIndex(idx)) => call_file_index = Some(idx),
            Some(other) => call_file_index = other.udata_value(),
            None => {}
        }
        if let Some(attr) = entry.attr_value(gimli::DW_AT_call_line)? {
            call_line = attr.udata_value().map(|v| v as u32);
        }
    }

    Ok(PendingFrame {
        info: FunctionInfo {
            name,
            inlined,
            call_file: None,
            call_line,
            die: (unit_idx, entry.offset()),
        },
        call_file_index,
    })
}

/// DIEの明示的なアドレス範囲がPCを含むかを判定する
pub fn die_contains(
    dwarf: &gimli::Dwarf<Slice>,
    unit: &gimli::Unit<Slice>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Slice>,
    addr: u64,
) -> Result<bool> {
    let mut ranges = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = ranges.next()? {
        if range.begin <= addr && addr < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

/// DIEの名前を解決する
///
/// DW_AT_linkage_nameを優先し、無ければDW_AT_nameを使います。
/// どちらも無ければDW_AT_abstract_origin / DW_AT_specificationの
/// 参照先を再帰的にたどります。
pub fn die_name(
    dwarf: &gimli::Dwarf<Slice>,
    unit: &gimli::Unit<Slice>,
    entry: &gimli::DebuggingInformationEntry<'_, '_, Slice>,
    depth: usize,
) -> Result<Option<String>> {
    // 参照の循環に備えて深さを制限する
    if depth > 16 {
        return Ok(None);
    }

    for attr in [
        gimli::DW_AT_linkage_name,
        gimli::DW_AT_MIPS_linkage_name,
        gimli::DW_AT_name,
    ] {
        if let Some(value) = entry.attr_value(attr)? {
            if let Ok(s) = dwarf.attr_string(unit, value) {
                return Ok(Some(s.to_string_lossy().into_owned()));
            }
        }
    }

    for attr in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        match entry.attr_value(attr)? {
            Some(AttributeValue::UnitRef(offset)) => {
                let target = unit.entry(offset)?;
                if let Some(name) = die_name(dwarf, unit, &target, depth + 1)? {
                    return Ok(Some(name));
                }
            }
            Some(AttributeValue::DebugInfoRef(_)) => {
                // 単位をまたぐ参照は名前解決の対象外（呼び出し側が
                // シンボルテーブルにフォールバックする）
                continue;
            }
            _ => {}
        }
    }

    Ok(None)
}
