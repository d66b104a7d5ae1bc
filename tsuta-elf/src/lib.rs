//! Tsuta ELF イメージ読み込み
//!
//! このクレートは、実行ファイル・共有ライブラリ・コアダンプのELFイメージを
//! 読み込む機能を提供します。プログラムヘッダやノートの解析、圧縮デバッグ
//! セクションの展開、分離デバッグファイルの解決、イメージのキャッシュを行います。

pub mod reader;
pub mod image;
pub mod notes;
pub mod debug_link;
pub mod cache;
pub mod error;

pub use reader::{Endian, Reader};
pub use image::{Image, Segment, PT_DYNAMIC, PT_LOAD, PT_NOTE, PT_PHDR};
pub use notes::Note;
pub use cache::{CacheConfig, ImageCache};
pub use error::ElfError;

/// ELF読み込みの結果型
pub type Result<T> = anyhow::Result<T>;
