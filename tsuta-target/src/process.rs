//! プロセス抽象の共通契約

use crate::registers::RegisterBank;
use crate::Result;
use std::sync::Arc;
use tsuta_elf::{Image, Segment};

/// ロード済みオブジェクト
///
/// ターゲットのアドレス空間にマップされた1つのELFイメージ。
/// `load_addr`はイメージ内の仮想アドレスに加算するバイアスです。
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub load_addr: u64,
    pub image: Arc<Image>,
}

/// スタック収集の対象となるプロセスの能力セット
///
/// 実装は3種類（LiveProcess / CoreProcess / LogProcess）。深い階層は
/// 作らず、この狭いトレイトだけを共有します。
pub trait Target {
    /// プロセスIDを取得する（コアの場合は記録されたPID）
    fn pid(&self) -> i32;

    /// タスク（LWP）の一覧を取得する
    fn threads(&self) -> Result<Vec<i32>>;

    /// 指定タスクのレジスタバンクを取得する
    fn registers(&self, lwp: i32) -> Result<RegisterBank>;

    /// ターゲットのメモリを読み取る
    ///
    /// 読み取れたバイト数を返します。どの読み取り元からも1バイトも
    /// 得られない場合は0です。
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize>;

    /// すべてのタスクを停止する（コア・ログでは何もしない）
    fn stop_all(&self) -> Result<()>;

    /// すべてのタスクを再開する
    fn resume_all(&self);

    /// ロード済みオブジェクトの一覧を取得する
    fn loaded_objects(&self) -> &[LoadedObject];

    /// 補助ベクタ（auxv）を取得する
    fn auxv(&self) -> Option<&[u8]> {
        None
    }

    /// 採取済みのフレームアドレス列を取得する
    ///
    /// LogProcessだけが返します。Someの場合、アンワインドは行わず
    /// このアドレス列をそのままフレームとして扱います。
    fn captured_frames(&self, _lwp: i32) -> Option<&[u64]> {
        None
    }
}

/// アドレスを含むロード済みオブジェクトのセグメントを探す
///
/// `(ロードアドレス, イメージ, セグメント)`を返します。
pub fn find_segment(
    objects: &[LoadedObject],
    addr: u64,
) -> Option<(u64, &Arc<Image>, &Segment)> {
    for obj in objects {
        let static_addr = addr.wrapping_sub(obj.load_addr);
        if let Some(seg) = obj.image.segment_for_address(static_addr) {
            return Some((obj.load_addr, &obj.image, seg));
        }
    }
    None
}

/// アドレスを含むロード済みオブジェクトを探す
pub fn find_object(objects: &[LoadedObject], addr: u64) -> Option<&LoadedObject> {
    objects.iter().find(|o| {
        o.image
            .segment_for_address(addr.wrapping_sub(o.load_addr))
            .is_some()
    })
}

/// スコープ付きの停止
///
/// 構築時に全タスクを停止し、エラー経路を含むあらゆる脱出で
/// 再開します。1回のスタック収集はこのガードの生存中に行います。
pub struct StopGuard<'a> {
    target: &'a dyn Target,
}

impl<'a> StopGuard<'a> {
    /// ターゲットを停止してガードを作成する
    pub fn new(target: &'a dyn Target) -> Result<Self> {
        target.stop_all()?;
        Ok(Self { target })
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.target.resume_all();
    }
}

/// ターゲットメモリの型付き読み取りヘルパー
pub struct TargetMemory<'a>(pub &'a dyn Target);

impl TargetMemory<'_> {
    /// 指定バイト数を完全に読み取る（不足は`AddressNotMapped`）
    pub fn read_exact(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.0.read_memory(addr, buf)?;
        if n != buf.len() {
            return Err(crate::TargetError::AddressNotMapped(addr + n as u64).into());
        }
        Ok(())
    }

    /// u64値を読み取る（リトルエンディアン）
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
