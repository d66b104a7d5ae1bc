//! 呼び出しフレーム情報（CFI）の解析機能
//!
//! .eh_frameと.debug_frameを解析し、PCからFDEを索引して、CFAと
//! 各レジスタの復元規則を評価します。

use crate::info::{runtime_endian, Slice};
use crate::Result;
use gimli::{BaseAddresses, CieOrFde, DebugFrame, EhFrame, EhFrameHdr, UnwindSection};
use object::{Object, ObjectSection};
use once_cell::sync::OnceCell;
use tsuta_elf::Image;

/// 問い合わせPCにおけるCFAの規則
#[derive(Debug, Clone)]
pub enum CfaRule {
    /// レジスタ値 + オフセット
    RegisterOffset { register: u16, offset: i64 },
    /// DWARF式の評価結果
    Expression(gimli::Expression<Slice>),
}

/// 問い合わせPCにおけるレジスタの復元規則
#[derive(Debug, Clone)]
pub enum RegRule {
    Undefined,
    SameValue,
    /// CFA + オフセットのメモリ位置に保存されている
    Offset(i64),
    /// 値がCFA + オフセットそのもの
    ValOffset(i64),
    /// 別のレジスタに保存されている
    Register(u16),
    /// 式が指すメモリ位置に保存されている
    Expression(gimli::Expression<Slice>),
    /// 値が式の評価結果そのもの
    ValExpression(gimli::Expression<Slice>),
}

/// 問い合わせPCで評価済みの規則表
///
/// CIEの初期命令に続いてFDEの命令をPCまで実行した結果です。
#[derive(Debug, Clone)]
pub struct UnwindRow {
    pub cfa: CfaRule,
    pub registers: Vec<(u16, RegRule)>,
    /// リターンアドレスを保持するレジスタ番号（CIEより）
    pub ra_register: u16,
    /// シグナルフレーム（CIE拡張の'S'）かどうか
    pub signal_frame: bool,
}

/// アンワインド規則の評価に使うスクラッチ領域
pub type UnwindScratch = gimli::UnwindContext<usize>;

/// 1セクション分のFDE索引
struct SectionIndex<S: UnwindSection<Slice>> {
    section: S,
    data: &'static [u8],
    endian: gimli::RunTimeEndian,
    bases: BaseAddresses,
    /// (開始, 終了, FDE) をアドレス順に整列した走査索引
    fdes: OnceCell<Vec<(u64, u64, gimli::FrameDescriptionEntry<Slice>)>>,
}

impl<S: UnwindSection<Slice>> SectionIndex<S> {
    fn new(section: S, data: &'static [u8], endian: gimli::RunTimeEndian, bases: BaseAddresses) -> Self {
        Self {
            section,
            data,
            endian,
            bases,
            fdes: OnceCell::new(),
        }
    }

    /// セクション全体を走査してFDE索引を構築する
    ///
    /// コード範囲が空のFDEは索引に含めません。
    fn fdes(&self) -> &[(u64, u64, gimli::FrameDescriptionEntry<Slice>)] {
        self.fdes.get_or_init(|| {
            let mut out = Vec::new();
            let mut entries = self.section.entries(&self.bases);
            loop {
                match entries.next() {
                    Ok(Some(CieOrFde::Cie(_))) => {}
                    Ok(Some(CieOrFde::Fde(partial))) => {
                        match partial.parse(|section, bases, offset| {
                            section.cie_from_offset(bases, offset)
                        }) {
                            Ok(fde) => {
                                if fde.len() > 0 {
                                    out.push((
                                        fde.initial_address(),
                                        fde.initial_address() + fde.len(),
                                        fde,
                                    ));
                                }
                            }
                            Err(e) => tracing::debug!("skipping malformed FDE: {}", e),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("stopping CFI walk: {}", e);
                        break;
                    }
                }
            }
            out.sort_by_key(|&(start, _, _)| start);
            out
        })
    }

    /// PCを含むFDEを二分探索で見つける
    fn find_fde(&self, pc: u64) -> Option<&gimli::FrameDescriptionEntry<Slice>> {
        let fdes = self.fdes();
        let idx = fdes.partition_point(|&(start, _, _)| start <= pc);
        if idx == 0 {
            return None;
        }
        let (_, end, ref fde) = fdes[idx - 1];
        (pc < end).then_some(fde)
    }

    /// FDEの規則をPCまで評価して規則表を取り出す
    fn evaluate(
        &self,
        fde: &gimli::FrameDescriptionEntry<Slice>,
        pc: u64,
        scratch: &mut UnwindScratch,
    ) -> Result<UnwindRow> {
        let row = fde.unwind_info_for_address(&self.section, &self.bases, scratch, pc)?;

        let cfa = match row.cfa() {
            gimli::CfaRule::RegisterAndOffset { register, offset } => CfaRule::RegisterOffset {
                register: register.0,
                offset: *offset,
            },
            gimli::CfaRule::Expression(expr) => CfaRule::Expression(self.expression(expr)?),
        };

        let mut registers = Vec::new();
        for (reg, rule) in row.registers() {
            let rule = match rule {
                gimli::RegisterRule::Undefined => RegRule::Undefined,
                gimli::RegisterRule::SameValue => RegRule::SameValue,
                gimli::RegisterRule::Offset(off) => RegRule::Offset(*off),
                gimli::RegisterRule::ValOffset(off) => RegRule::ValOffset(*off),
                gimli::RegisterRule::Register(r) => RegRule::Register(r.0),
                gimli::RegisterRule::Expression(expr) => {
                    RegRule::Expression(self.expression(expr)?)
                }
                gimli::RegisterRule::ValExpression(expr) => {
                    RegRule::ValExpression(self.expression(expr)?)
                }
                other => {
                    tracing::debug!("unhandled register rule {:?} treated as same-value", other);
                    RegRule::SameValue
                }
            };
            registers.push((reg.0, rule));
        }

        Ok(UnwindRow {
            cfa,
            registers,
            ra_register: fde.cie().return_address_register().0,
            signal_frame: fde.cie().is_signal_trampoline(),
        })
    }

    /// 規則表の中の式をセクションのバイト列から切り出す
    fn expression(
        &self,
        expr: &gimli::UnwindExpression<usize>,
    ) -> Result<gimli::Expression<Slice>> {
        let end = expr
            .offset
            .checked_add(expr.length)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| anyhow::anyhow!("CFI expression outside its section"))?;
        Ok(gimli::Expression(gimli::EndianSlice::new(
            &self.data[expr.offset..end],
            self.endian,
        )))
    }
}

/// 1イメージ分のCFI索引
///
/// .eh_frame_hdrの二分探索テーブルがあればそれを優先し、無ければ
/// セクション走査で構築した索引を使います。評価するアドレスはイメージ
/// 内の静的アドレス（ロードバイアス適用前）です。
pub struct FrameTable {
    eh: Option<SectionIndex<EhFrame<Slice>>>,
    eh_hdr: Option<gimli::ParsedEhFrameHdr<Slice>>,
    debug_frame: Option<SectionIndex<DebugFrame<Slice>>>,
}

impl FrameTable {
    /// イメージのCFIセクションを読み込む
    ///
    /// .eh_frameは実行時セクションなので元のイメージから、
    /// .debug_frameは分離デバッグファイルがあればそちらから読みます。
    /// どちらも無ければNoneです。
    pub fn load(image: &Image, debug_image: Option<&Image>) -> Option<FrameTable> {
        let endian = runtime_endian(image.endian());
        let address_size = if image.is_64() { 8 } else { 4 };

        let mut bases = BaseAddresses::default();
        if let Some(text) = image.object().section_by_name(".text") {
            bases = bases.set_text(text.address());
        }
        if let Some(got) = image.object().section_by_name(".got") {
            bases = bases.set_got(got.address());
        }

        let section_with_data = |name: &str| -> Option<(u64, &'static [u8])> {
            let addr = image.object().section_by_name(name)?.address();
            image.section_data(name).map(|data| (addr, data))
        };

        let eh_section = section_with_data(".eh_frame");
        let hdr_section = section_with_data(".eh_frame_hdr");

        // テーブル内のポインタはヘッダ相対エンコーディングを使うため、
        // .eh_frame_hdrのアドレスもベースに含めておく
        let mut eh_bases = bases.clone();
        if let Some((addr, _)) = eh_section {
            eh_bases = eh_bases.set_eh_frame(addr);
        }
        if let Some((addr, _)) = hdr_section {
            eh_bases = eh_bases.set_eh_frame_hdr(addr);
        }

        let eh = eh_section.map(|(_, data)| {
            let mut section = EhFrame::new(data, endian);
            section.set_address_size(address_size);
            SectionIndex::new(section, data, endian, eh_bases.clone())
        });

        let eh_hdr = hdr_section.and_then(|(_, data)| {
            eh.as_ref()?;
            match EhFrameHdr::new(data, endian).parse(&eh_bases, address_size) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::debug!("ignoring bad .eh_frame_hdr in {:?}: {}", image.path(), e);
                    None
                }
            }
        });

        let debug_source = debug_image
            .filter(|d| d.has_section(".debug_frame") || d.has_section(".zdebug_frame"));
        let debug_frame = debug_source
            .or(Some(image))
            .and_then(|img| {
                let addr = img
                    .object()
                    .section_by_name(".debug_frame")
                    .map(|s| s.address())
                    .unwrap_or(0);
                img.section_data(".debug_frame").map(|data| (addr, data))
            })
            .map(|(addr, data)| {
                let bases = bases.clone().set_eh_frame(addr);
                let mut section = DebugFrame::new(data, endian);
                section.set_address_size(address_size);
                SectionIndex::new(section, data, endian, bases)
            });

        if eh.is_none() && debug_frame.is_none() {
            return None;
        }
        Some(FrameTable {
            eh,
            eh_hdr,
            debug_frame,
        })
    }

    /// PCにおけるアンワインド規則表を取得する
    ///
    /// PCを覆うFDEが無ければNoneを返します。
    pub fn unwind_row_at(&self, pc: u64, scratch: &mut UnwindScratch) -> Result<Option<UnwindRow>> {
        if let Some(eh) = &self.eh {
            // .eh_frame_hdrの二分探索テーブルがあれば走査索引を作らずに済む
            if let Some(table) = self.eh_hdr.as_ref().and_then(|hdr| hdr.table()) {
                match table.fde_for_address(&eh.section, &eh.bases, pc, EhFrame::cie_from_offset) {
                    Ok(fde) => {
                        if fde.len() > 0 && fde.contains(pc) {
                            return Ok(Some(eh.evaluate(&fde, pc, scratch)?));
                        }
                    }
                    Err(gimli::Error::NoUnwindInfoForAddress) => {}
                    Err(e) => tracing::debug!("eh_frame_hdr lookup failed at {:#x}: {}", pc, e),
                }
            } else if let Some(fde) = eh.find_fde(pc) {
                return Ok(Some(eh.evaluate(fde, pc, scratch)?));
            }
        }

        if let Some(df) = &self.debug_frame {
            if let Some(fde) = df.find_fde(pc) {
                return Ok(Some(df.evaluate(fde, pc, scratch)?));
            }
        }

        Ok(None)
    }
}
