//! 関数引数の解読機能
//!
//! フレームのDW_TAG_formal_parameterのDW_AT_locationを評価し、
//! レジスタ・スタック上の引数の値を取り出します。オプトインの
//! 機能で、既定では呼ばれません。

use crate::expr::{self, EvalContext, Loc};
use crate::functions;
use crate::info::DwarfInfo;
use crate::Result;
use gimli::AttributeValue;

/// 解読済みの引数
#[derive(Debug, Clone)]
pub struct FrameArg {
    pub name: Option<String>,
    /// 64ビット生値（読み取れなかった場合はNone）
    pub value: Option<u64>,
}

/// 関数DIEの仮引数を解読する
///
/// `pc`は静的アドレス、`cfa`はこのフレームの正準フレームアドレス。
/// 値が特定できない引数（最適化で消えたものなど）は値なしで返します。
pub fn decode_args(
    info: &DwarfInfo,
    unit_idx: usize,
    die: gimli::UnitOffset,
    pc: u64,
    cfa: Option<u64>,
    load_bias: u64,
    get_reg: &mut dyn FnMut(u16) -> Result<u64>,
    read_mem: &mut dyn FnMut(u64, usize) -> Result<Vec<u8>>,
) -> Result<Vec<FrameArg>> {
    let unit = info.unit(unit_idx)?;
    let dwarf = info.dwarf();
    let encoding = unit.encoding();

    // フレームベース（通常はDW_OP_call_frame_cfa）を先に評価する
    let func = unit.entry(die)?;
    let frame_base = match func.attr_value(gimli::DW_AT_frame_base)? {
        Some(AttributeValue::Exprloc(e)) => {
            let mut ctx = EvalContext {
                frame_base: None,
                cfa,
                load_bias,
                get_reg: &mut *get_reg,
                read_mem: &mut *read_mem,
            };
            match expr::evaluate(e, encoding, &mut ctx) {
                Ok(Loc::Addr { addr }) => Some(addr),
                Ok(Loc::Value { value }) => Some(value),
                Ok(Loc::Reg { reg }) => get_reg(reg).ok(),
                _ => None,
            }
        }
        _ => None,
    };

    let mut args = Vec::new();
    let mut tree = unit.entries_tree(Some(die))?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_formal_parameter {
            continue;
        }

        let name = functions::die_name(dwarf, unit, entry, 0)?;

        let location = match entry.attr_value(gimli::DW_AT_location)? {
            Some(AttributeValue::Exprloc(e)) => Some(e),
            Some(AttributeValue::LocationListsRef(offset)) => {
                // ロケーションリストからPCを覆うエントリを探す
                let mut found = None;
                let mut iter = dwarf.locations(unit, offset)?;
                while let Some(entry) = iter.next()? {
                    if entry.range.begin <= pc && pc < entry.range.end {
                        found = Some(entry.data);
                        break;
                    }
                }
                found
            }
            _ => None,
        };

        let value = location.and_then(|e| {
            let mut ctx = EvalContext {
                frame_base,
                cfa,
                load_bias,
                get_reg: &mut *get_reg,
                read_mem: &mut *read_mem,
            };
            match expr::evaluate(e, encoding, &mut ctx) {
                Ok(Loc::Addr { addr }) => {
                    let bytes = read_mem(addr, 8).ok()?;
                    let mut word = [0u8; 8];
                    let n = bytes.len().min(8);
                    word[..n].copy_from_slice(&bytes[..n]);
                    Some(u64::from_le_bytes(word))
                }
                Ok(Loc::Reg { reg }) => get_reg(reg).ok(),
                Ok(Loc::Value { value }) => Some(value),
                _ => None,
            }
        });

        args.push(FrameArg { name, value });
    }

    Ok(args)
}
