//! スタックのアンワインド機能

use crate::tracer::DebugStore;
use crate::Result;
use tsuta_dwarf::expr::{self, EvalContext};
use tsuta_dwarf::frames::{CfaRule, RegRule, UnwindRow, UnwindScratch};
use tsuta_target::process::{find_object, TargetMemory};
use tsuta_target::registers::{DWARF_REG_BP, DWARF_REG_SP};
use tsuta_target::{RegisterBank, Target};

/// アンワインダが生成する1フレーム
///
/// シンボル解決前の生のフレーム。regsはこのフレームの時点の
/// レジスタバンクです。
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub pc: u64,
    pub cfa: Option<u64>,
    pub regs: RegisterBank,
}

/// CFIの規則評価でスタックを遡るアンワインダ
///
/// 開始レジスタバンクからフレームを遅延的に生成します。各ステップで
/// PCを覆うFDEを索引し、CFAと呼び出し元のレジスタを復元します。
/// FDEが無いPCではフレームポインタ連鎖のヒューリスティックに
/// フォールバックします。
pub struct Unwinder<'a> {
    target: &'a dyn Target,
    store: &'a DebugStore<'a>,
    scratch: UnwindScratch,
    regs: RegisterBank,
    prev_cfa: Option<u64>,
    /// 直前のフレームがシグナルフレームだったか
    /// （シグナルフレームのPCは呼び出しの次ではなく当該命令そのもの）
    prev_signal_frame: bool,
    emitted: usize,
    max_frames: usize,
    done: bool,
}

impl<'a> Unwinder<'a> {
    /// 開始レジスタバンクからアンワインダを作成する
    pub fn new(
        target: &'a dyn Target,
        store: &'a DebugStore<'a>,
        regs: RegisterBank,
        max_frames: usize,
    ) -> Self {
        Self {
            target,
            store,
            scratch: UnwindScratch::new(),
            regs,
            prev_cfa: None,
            prev_signal_frame: false,
            emitted: 0,
            max_frames,
            done: false,
        }
    }

    /// 次のフレームを取得する
    ///
    /// スタックの終端（PC=0、CFAの不前進、FDEもヒューリスティックも
    /// 失敗、またはフレーム数上限）に達するとNoneを返します。
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.done || self.emitted >= self.max_frames {
            return Ok(None);
        }

        let pc = self.regs.pc();
        if pc == 0 {
            self.done = true;
            return Ok(None);
        }

        // リターンアドレスは呼び出しの次の命令を指すため、検索には
        // 1を引いたアドレスを使う。最初のフレームとシグナルフレームの
        // 直後は実際のPCそのもの。
        let lookup_pc = if self.emitted == 0 || self.prev_signal_frame {
            pc
        } else {
            pc - 1
        };

        let step = match self.lookup_row(lookup_pc)? {
            Some((row, load_addr, address_size)) => {
                self.prev_signal_frame = row.signal_frame;
                Some(self.apply_rules(&row, load_addr, address_size)?)
            }
            None => {
                self.prev_signal_frame = false;
                self.frame_pointer_step()?
            }
        };

        let frame = match step {
            Some((cfa, next_regs)) => {
                // CFAが進まないのはフレームの繰り返し
                if self.prev_cfa == Some(cfa) {
                    self.done = true;
                    return Ok(None);
                }
                let frame = RawFrame {
                    pc,
                    cfa: Some(cfa),
                    regs: self.regs,
                };
                self.prev_cfa = Some(cfa);
                self.regs = next_regs;
                frame
            }
            None => {
                // この先へは進めないが、現在のフレーム自体は有効
                self.done = true;
                RawFrame {
                    pc,
                    cfa: None,
                    regs: self.regs,
                }
            }
        };

        self.emitted += 1;
        Ok(Some(frame))
    }

    /// PCを覆うアンワインド規則表をロード済みオブジェクトから索引する
    fn lookup_row(&mut self, pc: u64) -> Result<Option<(UnwindRow, u64, u8)>> {
        let objects = self.target.loaded_objects();
        let Some(obj) = find_object(objects, pc) else {
            return Ok(None);
        };
        let Some(info) = self.store.info_for(&obj.image) else {
            return Ok(None);
        };
        let Some(table) = info.frames() else {
            return Ok(None);
        };

        let static_pc = pc.wrapping_sub(obj.load_addr);
        let address_size = if obj.image.is_64() { 8 } else { 4 };
        match table.unwind_row_at(static_pc, &mut self.scratch) {
            Ok(row) => Ok(row.map(|r| (r, obj.load_addr, address_size))),
            Err(e) => {
                tracing::debug!("CFI evaluation failed at {:#x}: {}", pc, e);
                Ok(None)
            }
        }
    }

    /// 規則表を適用してCFAと呼び出し元のレジスタバンクを求める
    fn apply_rules(
        &self,
        row: &UnwindRow,
        load_addr: u64,
        address_size: u8,
    ) -> Result<(u64, RegisterBank)> {
        let old = self.regs;
        let memory = TargetMemory(self.target);

        let cfa = match &row.cfa {
            CfaRule::RegisterOffset { register, offset } => old
                .get_dwarf(*register)
                .ok_or_else(|| anyhow::anyhow!("CFA rule uses unknown register {}", register))?
                .wrapping_add_signed(*offset),
            CfaRule::Expression(e) => {
                self.eval_expr(e.clone(), address_size, &old, None, load_addr)?
            }
        };

        let mut next = old;
        for (reg, rule) in &row.registers {
            match rule {
                RegRule::Undefined => {
                    // リターンアドレスが未定義ならスタックの終端
                    if *reg == row.ra_register {
                        next.set_dwarf(*reg, 0);
                    }
                }
                RegRule::SameValue => {}
                RegRule::Offset(off) => {
                    let addr = cfa.wrapping_add_signed(*off);
                    next.set_dwarf(*reg, memory.read_u64(addr)?);
                }
                RegRule::ValOffset(off) => {
                    next.set_dwarf(*reg, cfa.wrapping_add_signed(*off));
                }
                RegRule::Register(src) => {
                    if let Some(value) = old.get_dwarf(*src) {
                        next.set_dwarf(*reg, value);
                    }
                }
                RegRule::Expression(e) => {
                    let addr =
                        self.eval_expr(e.clone(), address_size, &old, Some(cfa), load_addr)?;
                    next.set_dwarf(*reg, memory.read_u64(addr)?);
                }
                RegRule::ValExpression(e) => {
                    let value =
                        self.eval_expr(e.clone(), address_size, &old, Some(cfa), load_addr)?;
                    next.set_dwarf(*reg, value);
                }
            }
        }

        // x86-64では呼び出し元のスタックポインタはCFAそのもの
        next.set_dwarf(DWARF_REG_SP, cfa);

        let ra = next.get_dwarf(row.ra_register).unwrap_or(0);
        next.set_pc(old.strip_return_address(ra));

        Ok((cfa, next))
    }

    /// CFI式を評価する
    fn eval_expr(
        &self,
        e: gimli::Expression<tsuta_dwarf::Slice>,
        address_size: u8,
        regs: &RegisterBank,
        cfa: Option<u64>,
        load_addr: u64,
    ) -> Result<u64> {
        let target = self.target;
        let regs = *regs;
        let mut get_reg = move |reg: u16| -> Result<u64> {
            regs.get_dwarf(reg)
                .ok_or_else(|| anyhow::anyhow!("expression uses unknown register {}", reg))
        };
        let mut read_mem = move |addr: u64, size: usize| -> Result<Vec<u8>> {
            let mut buf = vec![0u8; size];
            TargetMemory(target).read_exact(addr, &mut buf)?;
            Ok(buf)
        };
        let mut ctx = EvalContext {
            frame_base: None,
            cfa,
            load_bias: load_addr,
            get_reg: &mut get_reg,
            read_mem: &mut read_mem,
        };
        expr::evaluate_address(e, expr::unwind_encoding(address_size), &mut ctx)
    }

    /// フレームポインタ連鎖によるフォールバック
    ///
    /// FDEが無いコード（手書きアセンブリやJIT）のために、RBPの
    /// 連鎖から呼び出し元を推定します。RBPが妥当なスタックアドレスを
    /// 指していなければ諦めます。
    fn frame_pointer_step(&self) -> Result<Option<(u64, RegisterBank)>> {
        let memory = TargetMemory(self.target);
        let rbp = self.regs.bp();

        // RBPが0または小さすぎる場合はフレームポインタではない
        if rbp == 0 || rbp < 0x1000 {
            return Ok(None);
        }

        let Ok(prev_rbp) = memory.read_u64(rbp) else {
            return Ok(None);
        };
        let Ok(return_address) = memory.read_u64(rbp + 8) else {
            return Ok(None);
        };
        if return_address == 0 || return_address < 0x1000 {
            return Ok(None);
        }
        // 連鎖はスタックを遡る方向でなければならない
        if prev_rbp != 0 && prev_rbp <= rbp {
            return Ok(None);
        }

        let cfa = rbp + 16;
        let mut next = self.regs;
        next.set_dwarf(DWARF_REG_BP, prev_rbp);
        next.set_dwarf(DWARF_REG_SP, cfa);
        next.set_pc(self.regs.strip_return_address(return_address));
        Ok(Some((cfa, next)))
    }
}
