//! Tsuta DWARF デバッグ情報解析
//!
//! このクレートは、ELFイメージのDWARFデバッグ情報の解析機能を提供します。
//! コンパイル単位とDIEの遅延読み込み、行番号マトリクス、CFI（呼び出し
//! フレーム情報）の規則評価、シンボル解決、ロケーション式の評価を行います。

pub mod info;
pub mod unit;
pub mod lines;
pub mod frames;
pub mod expr;
pub mod symbols;
pub mod functions;
pub mod variables;

pub use info::{DwarfInfo, Slice};
pub use lines::{LineMatrix, LineRow};
pub use frames::{CfaRule, FrameTable, RegRule, UnwindRow};
pub use expr::{EvalContext, Loc};
pub use symbols::{Symbol, SymbolTable};
pub use functions::FunctionInfo;
pub use variables::FrameArg;

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
