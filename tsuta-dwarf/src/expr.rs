//! DWARF式の評価機能
//!
//! DWARFのロケーション式・CFA式を評価して、値の位置や計算結果を
//! 特定します。CFIのレジスタ規則と変数のDW_AT_locationの両方から
//! 使われます。

use crate::info::Slice;
use crate::Result;
use gimli::{EvaluationResult, Location, Value};

/// 式評価の結果
#[derive(Debug, Clone)]
pub enum Loc {
    /// レジスタに格納されている
    Reg { reg: u16 },
    /// メモリアドレス
    Addr { addr: u64 },
    /// 値そのもの（DW_OP_stack_valueなど）
    Value { value: u64 },
    /// 複数のピースから構成される（構造体の分割格納など）
    Pieces(Vec<gimli::Piece<Slice>>),
    /// 最適化により削除された
    Empty,
}

/// 式評価に必要な外部状態
///
/// レジスタ値とターゲットメモリの読み取りはコールバックで注入します。
pub struct EvalContext<'a> {
    /// フレームベース（DW_OP_fbreg用）
    pub frame_base: Option<u64>,
    /// CFA（DW_OP_call_frame_cfa用）
    pub cfa: Option<u64>,
    /// イメージのロードバイアス（DW_OP_addrの再配置用）
    pub load_bias: u64,
    /// レジスタ値を取得するコールバック
    pub get_reg: &'a mut dyn FnMut(u16) -> Result<u64>,
    /// ターゲットメモリを読み取るコールバック
    pub read_mem: &'a mut dyn FnMut(u64, usize) -> Result<Vec<u8>>,
}

/// DWARF式を評価する
pub fn evaluate(
    expr: gimli::Expression<Slice>,
    encoding: gimli::Encoding,
    ctx: &mut EvalContext<'_>,
) -> Result<Loc> {
    let mut eval = expr.evaluation(encoding);
    let mut state = eval.evaluate()?;

    loop {
        match state {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = (ctx.get_reg)(register.0)?;
                state = eval.resume_with_register(Value::Generic(value))?;
            }
            EvaluationResult::RequiresFrameBase => {
                let fb = ctx
                    .frame_base
                    .ok_or_else(|| anyhow::anyhow!("Frame base required but not available"))?;
                state = eval.resume_with_frame_base(fb)?;
            }
            EvaluationResult::RequiresCallFrameCfa => {
                let cfa = ctx
                    .cfa
                    .ok_or_else(|| anyhow::anyhow!("CFA required but not available"))?;
                state = eval.resume_with_call_frame_cfa(cfa)?;
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let bytes = (ctx.read_mem)(address, size as usize)?;
                let mut word = [0u8; 8];
                let n = bytes.len().min(8);
                word[..n].copy_from_slice(&bytes[..n]);
                state = eval.resume_with_memory(Value::Generic(u64::from_le_bytes(word)))?;
            }
            EvaluationResult::RequiresRelocatedAddress(addr) => {
                state = eval.resume_with_relocated_address(addr.wrapping_add(ctx.load_bias))?;
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unsupported evaluation state: {:?}",
                    other
                ));
            }
        }
    }

    let pieces = eval.result();
    if pieces.is_empty() {
        return Ok(Loc::Empty);
    }
    if pieces.len() == 1 && pieces[0].size_in_bits.is_none() {
        match &pieces[0].location {
            Location::Register { register } => return Ok(Loc::Reg { reg: register.0 }),
            Location::Address { address } => return Ok(Loc::Addr { addr: *address }),
            Location::Value { value } => {
                return Ok(Loc::Value {
                    value: value.to_u64(!0u64)?,
                })
            }
            Location::Empty => return Ok(Loc::Empty),
            _ => {}
        }
    }
    Ok(Loc::Pieces(pieces))
}

/// 式を評価して単一のアドレス値を取り出す
///
/// CFA式とレジスタ規則の式はどちらも最終的に1つの64ビット値に
/// なることを期待します。
pub fn evaluate_address(
    expr: gimli::Expression<Slice>,
    encoding: gimli::Encoding,
    ctx: &mut EvalContext<'_>,
) -> Result<u64> {
    match evaluate(expr, encoding, ctx)? {
        Loc::Addr { addr } => Ok(addr),
        Loc::Value { value } => Ok(value),
        Loc::Reg { reg } => (ctx.get_reg)(reg),
        other => Err(anyhow::anyhow!(
            "Expression did not yield a single value: {:?}",
            other
        )),
    }
}

/// アンワインド式評価用のエンコーディングを作る
///
/// CFIの式にはコンパイル単位の文脈が無いため、イメージのアドレス幅
/// だけを反映した固定のエンコーディングで評価します。
pub fn unwind_encoding(address_size: u8) -> gimli::Encoding {
    gimli::Encoding {
        format: gimli::Format::Dwarf32,
        version: 4,
        address_size,
    }
}
