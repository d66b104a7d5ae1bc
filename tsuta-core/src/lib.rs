//! Tsuta スタック収集のコア機能
//!
//! このクレートは、ターゲットプロセスのスタック収集を統合します。
//! CFIに基づくアンワインド、フレームのシンボル解決とインライン展開、
//! スレッドごとのスタック組み立てを行います。

pub mod options;
pub mod unwind;
pub mod symbolize;
pub mod tracer;

pub use options::TraceOptions;
pub use symbolize::Frame;
pub use tracer::{ThreadStack, Tracer};
pub use unwind::{RawFrame, Unwinder};

/// スタック収集の結果型
pub type Result<T> = anyhow::Result<T>;
