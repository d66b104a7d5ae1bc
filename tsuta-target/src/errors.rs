//! ターゲット制御のエラー型

use thiserror::Error;

/// ターゲットプロセスへのアクセスで発生するエラー
#[derive(Error, Debug)]
pub enum TargetError {
    /// 要求されたアドレスを提供できる読み取り元が無い
    #[error("address {0:#x} is not mapped in the target")]
    AddressNotMapped(u64),

    /// 実行中のターゲットが消滅した（終了・デタッチ・権限喪失）
    #[error("target process {0} is gone")]
    TargetLost(i32),
}
