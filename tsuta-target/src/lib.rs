//! Tsuta ターゲットプロセス抽象
//!
//! このクレートは、スタックを収集する対象の3種類のプロセス表現を
//! 提供します。ptraceで停止させる実行中プロセス、コアダンプと
//! ディスク上のイメージから再構成するプロセス、採取済みのアドレス
//! リストから合成するプロセスが、1つの能力セットを共有します。

pub mod process;
pub mod registers;
pub mod memory;
pub mod live;
pub mod core_file;
pub mod log_file;
pub mod errors;

pub use process::{find_segment, LoadedObject, StopGuard, Target};
pub use registers::RegisterBank;
pub use memory::{Memory, MemoryMapping};
pub use live::LiveProcess;
pub use core_file::CoreProcess;
pub use log_file::LogProcess;
pub use errors::TargetError;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
