//! ELF解析のエラー型

use thiserror::Error;

/// ELFイメージ解析で発生するエラー
///
/// anyhowのエラーチェーンに載せて伝播し、呼び出し側は必要に応じて
/// `downcast_ref`で分類を取り出します。
#[derive(Error, Debug)]
pub enum ElfError {
    /// 範囲外の読み取り
    #[error("read of {len} bytes at offset {offset:#x} is outside image of {size:#x} bytes")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    /// 終端されていない文字列
    #[error("unterminated string at offset {0:#x}")]
    BadString(u64),

    /// ELF構造の不変条件違反
    #[error("malformed ELF image: {0}")]
    BadFormat(String),
}
