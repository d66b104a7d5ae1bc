//! スレッドスタックの収集機能

use crate::options::TraceOptions;
use crate::symbolize::{self, Frame};
use crate::unwind::Unwinder;
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tsuta_dwarf::DwarfInfo;
use tsuta_elf::{Image, ImageCache};
use tsuta_target::{StopGuard, Target};

/// イメージごとのDWARF情報の置き場
///
/// DwarfInfoはイメージと1対1で、初回要求時に構築して以降は共有
/// します。構築に失敗したイメージは記録してNoneを返し続けます
/// （そのイメージに限定された失敗で、収集全体は続行します）。
pub struct DebugStore<'a> {
    cache: &'a ImageCache,
    infos: Mutex<HashMap<PathBuf, Option<Arc<DwarfInfo>>>>,
}

impl<'a> DebugStore<'a> {
    /// イメージキャッシュを参照する置き場を作成する
    pub fn new(cache: &'a ImageCache) -> Self {
        Self {
            cache,
            infos: Mutex::new(HashMap::new()),
        }
    }

    /// イメージのDWARF情報を取得する
    pub fn info_for(&self, image: &Arc<Image>) -> Option<Arc<DwarfInfo>> {
        let mut infos = self.infos.lock().unwrap();
        infos
            .entry(image.path().to_path_buf())
            .or_insert_with(|| match DwarfInfo::new(image.clone(), self.cache) {
                Ok(info) => Some(Arc::new(info)),
                Err(e) => {
                    tracing::debug!("no DWARF for {:?}: {}", image.path(), e);
                    None
                }
            })
            .clone()
    }
}

/// 1スレッド分のスタック
///
/// 出力シンクが消費するレコード。途中で失敗したスタックは、そこまでの
/// フレームとエラーの印を持ちます。
#[derive(Debug)]
pub struct ThreadStack {
    pub lwp: i32,
    pub frames: Vec<Frame>,
    /// アンワインドが途中で失敗した場合のエラー
    pub error: Option<String>,
}

/// スタック収集のまとめ役
///
/// ターゲットの停止、スレッドの列挙、アンワインド、シンボル解決を
/// 束ねます。1回の収集はターゲットが停止している間に完了します。
pub struct Tracer<'a> {
    options: TraceOptions,
    store: DebugStore<'a>,
}

impl<'a> Tracer<'a> {
    /// トレーサを作成する
    pub fn new(cache: &'a ImageCache, options: TraceOptions) -> Self {
        Self {
            options,
            store: DebugStore::new(cache),
        }
    }

    /// ターゲットの全スレッドのスタックを収集する
    ///
    /// 収集の間ターゲットを停止し、エラー経路を含むすべての経路で
    /// 再開します。スレッド単位の失敗はそのスレッドのスタックを
    /// 打ち切るだけで、他のスレッドの収集は続きます。
    pub fn collect(&self, target: &dyn Target) -> Result<Vec<ThreadStack>> {
        let _stopped = StopGuard::new(target)?;

        let mut stacks = Vec::new();
        for lwp in target.threads()? {
            stacks.push(self.collect_thread(target, lwp));
        }
        Ok(stacks)
    }

    fn collect_thread(&self, target: &dyn Target, lwp: i32) -> ThreadStack {
        // 採取済みのアドレス列があればアンワインドせずそのまま使う
        if let Some(addrs) = target.captured_frames(lwp) {
            let mut frames = Vec::new();
            for (i, &pc) in addrs.iter().enumerate() {
                let raw = crate::unwind::RawFrame {
                    pc,
                    cfa: None,
                    regs: tsuta_target::RegisterBank::zeroed(),
                };
                frames.extend(symbolize::symbolize_frame(
                    &self.store,
                    target,
                    &raw,
                    i == 0,
                    &self.options,
                ));
            }
            return ThreadStack {
                lwp,
                frames,
                error: None,
            };
        }

        let regs = match target.registers(lwp) {
            Ok(regs) => regs,
            Err(e) => {
                return ThreadStack {
                    lwp,
                    frames: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let mut unwinder = Unwinder::new(target, &self.store, regs, self.options.max_frames);
        let mut frames = Vec::new();
        let mut error = None;
        let mut innermost = true;

        loop {
            match unwinder.next_frame() {
                Ok(Some(raw)) => {
                    frames.extend(symbolize::symbolize_frame(
                        &self.store,
                        target,
                        &raw,
                        innermost,
                        &self.options,
                    ));
                    innermost = false;
                }
                Ok(None) => break,
                Err(e) => {
                    // このスレッドのスタックだけを打ち切る
                    tracing::debug!("unwind of task {} stopped: {}", lwp, e);
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        ThreadStack { lwp, frames, error }
    }
}
