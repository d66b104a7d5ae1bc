//! フレームのシンボル解決機能

use crate::options::TraceOptions;
use crate::tracer::DebugStore;
use crate::unwind::RawFrame;
use crate::Result;
use std::path::PathBuf;
use tsuta_dwarf::functions;
use tsuta_dwarf::symbols::demangle;
use tsuta_dwarf::variables::{self, FrameArg};
use tsuta_target::process::{find_object, TargetMemory};
use tsuta_target::Target;

/// 出力用のフレームレコード
///
/// 出力シンクが消費する形。インライン展開で1つの生フレームから
/// 複数のレコードが生まれることがあります。
#[derive(Debug, Clone)]
pub struct Frame {
    pub pc: u64,
    pub cfa: Option<u64>,
    /// フレームが属するオブジェクトのパス
    pub object: Option<PathBuf>,
    /// デマングル済みの関数名
    pub symbol: Option<String>,
    /// 関数先頭からのオフセット
    pub offset: u64,
    /// ソースファイルと行番号
    pub source: Option<(String, u32)>,
    /// インライン展開で合成されたフレームかどうか
    pub inlined: bool,
    /// 解読された引数（オプトイン）
    pub args: Vec<FrameArg>,
}

/// 生フレームをシンボル解決して出力レコード列に展開する
///
/// DWARFの関数DIEとインライン連鎖を優先し、DWARFが無ければシンボル
/// テーブルで解決します。インライン関数のフレームには呼び出し元の
/// ファイル・行（DW_AT_call_file/line）を与えます。
pub fn symbolize_frame(
    store: &DebugStore<'_>,
    target: &dyn Target,
    raw: &RawFrame,
    innermost: bool,
    options: &TraceOptions,
) -> Vec<Frame> {
    let mut out = Vec::new();

    // リターンアドレスには呼び出し命令自体を指すよう1を引いて検索する
    let lookup_pc = if innermost { raw.pc } else { raw.pc.saturating_sub(1) };

    let Some(obj) = find_object(target.loaded_objects(), lookup_pc) else {
        out.push(bare_frame(raw));
        return out;
    };
    let object_path = Some(obj.image.path().to_path_buf());
    let static_pc = lookup_pc.wrapping_sub(obj.load_addr);

    let Some(info) = store.info_for(&obj.image) else {
        out.push(Frame {
            object: object_path,
            ..bare_frame(raw)
        });
        return out;
    };

    // シンボルテーブルでの解決（DWARFの結果の補完にも使う）
    let table_symbol = info.symbols().reverse_resolve(static_pc);
    let symbol_name = table_symbol.map(|s| s.demangled_name.clone());
    let symbol_offset = table_symbol
        .map(|s| static_pc - s.address)
        .unwrap_or(0);

    let chain = match functions::frames_at(&info, static_pc) {
        Ok(chain) => chain,
        Err(e) => {
            tracing::debug!("function lookup failed at {:#x}: {}", static_pc, e);
            Vec::new()
        }
    };

    let innermost_source = if options.no_src {
        None
    } else {
        info.source_from_addr(static_pc).ok().flatten()
    };

    if chain.is_empty() {
        out.push(Frame {
            pc: raw.pc,
            cfa: raw.cfa,
            object: object_path,
            symbol: symbol_name,
            offset: symbol_offset,
            source: innermost_source,
            inlined: false,
            args: Vec::new(),
        });
        return out;
    }

    // 連鎖は最内が先頭。ソースは最内なら行番号表から、それ以外は
    // 内側のインライン呼び出しの記録（DW_AT_call_file/line）から来る。
    let mut next_source = innermost_source;
    for func in &chain {
        let name = func
            .name
            .as_deref()
            .map(demangle)
            .or_else(|| (!func.inlined).then(|| symbol_name.clone()).flatten());

        let mut args = Vec::new();
        if options.do_args && !func.inlined {
            args = decode_frame_args(&info, func, static_pc, raw, target, obj.load_addr);
        }

        out.push(Frame {
            pc: raw.pc,
            cfa: raw.cfa,
            object: object_path.clone(),
            symbol: name,
            offset: if func.inlined { 0 } else { symbol_offset },
            source: next_source.take(),
            inlined: func.inlined,
            args,
        });

        // 呼び出し元フレームのソースはこのインライン呼び出しの位置
        if func.inlined {
            next_source = if options.no_src {
                None
            } else {
                func.call_file
                    .clone()
                    .map(|f| (f, func.call_line.unwrap_or(0)))
            };
        }
    }

    out
}

fn bare_frame(raw: &RawFrame) -> Frame {
    Frame {
        pc: raw.pc,
        cfa: raw.cfa,
        object: None,
        symbol: None,
        offset: 0,
        source: None,
        inlined: false,
        args: Vec::new(),
    }
}

/// 実体関数のフレームの引数を解読する
fn decode_frame_args(
    info: &tsuta_dwarf::DwarfInfo,
    func: &functions::FunctionInfo,
    static_pc: u64,
    raw: &RawFrame,
    target: &dyn Target,
    load_addr: u64,
) -> Vec<FrameArg> {
    let (unit_idx, die) = func.die;
    let regs = raw.regs;
    let mut get_reg = move |reg: u16| -> Result<u64> {
        regs.get_dwarf(reg)
            .ok_or_else(|| anyhow::anyhow!("unknown register {}", reg))
    };
    let mut read_mem = move |addr: u64, size: usize| -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        TargetMemory(target).read_exact(addr, &mut buf)?;
        Ok(buf)
    };
    match variables::decode_args(
        info,
        unit_idx,
        die,
        static_pc,
        raw.cfa,
        load_addr,
        &mut get_reg,
        &mut read_mem,
    ) {
        Ok(args) => args,
        Err(e) => {
            tracing::debug!("argument decode failed at {:#x}: {}", static_pc, e);
            Vec::new()
        }
    }
}
