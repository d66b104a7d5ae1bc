//! 実行中プロセスへのアクセス機能

use crate::errors::TargetError;
use crate::memory::Memory;
use crate::process::{LoadedObject, Target};
use crate::registers::RegisterBank;
use crate::Result;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tsuta_elf::{ImageCache, PT_LOAD};

/// 実行中のデバッグ対象プロセス
///
/// タスクの列挙は`/proc/<pid>/task`から、メモリは`/proc/<pid>/mem`から、
/// レジスタはptraceで取得します。停止はスタック収集の間だけの
/// スコープ付きで、全タスクへのアタッチとデタッチで実現します。
pub struct LiveProcess {
    pid: Pid,
    memory: Memory,
    objects: Vec<LoadedObject>,
    /// 現在アタッチ（停止）中のタスク
    attached: Mutex<Vec<Pid>>,
}

impl LiveProcess {
    /// プロセスに接続してロード済みオブジェクトを列挙する
    ///
    /// `exec_path`が指定されなければ`/proc/<pid>/exe`から実行ファイルを
    /// 推定します。個々の共有ライブラリの読み込み失敗は記録するだけで、
    /// 残りのオブジェクトで処理を続けます。
    pub fn new(pid: i32, exec_path: Option<&Path>, cache: &ImageCache) -> Result<Self> {
        let memory = Memory::new(pid);

        if !Path::new(&format!("/proc/{}", pid)).exists() {
            return Err(TargetError::TargetLost(pid).into());
        }

        let exec_path = match exec_path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(format!("/proc/{}/exe", pid)),
        };

        let mut objects = Vec::new();
        Self::load_objects(&memory, &exec_path, cache, &mut objects)?;

        Ok(Self {
            pid: Pid::from_raw(pid),
            memory,
            objects,
            attached: Mutex::new(Vec::new()),
        })
    }

    /// /proc/pid/mapsからロード済みオブジェクトを組み立てる
    fn load_objects(
        memory: &Memory,
        exec_path: &Path,
        cache: &ImageCache,
        objects: &mut Vec<LoadedObject>,
    ) -> Result<()> {
        let mappings = memory.mappings()?;

        // パスごとに最小ファイルオフセットのマッピングを選ぶ
        let mut seen: Vec<&str> = Vec::new();
        for mapping in &mappings {
            let Some(path) = mapping.path.as_deref() else {
                continue;
            };
            if !path.starts_with('/') || seen.contains(&path) {
                continue;
            }
            seen.push(path);

            let lowest = mappings
                .iter()
                .filter(|m| m.path.as_deref() == Some(path))
                .min_by_key(|m| m.offset)
                .unwrap();

            // 実行ファイル本体はmapsのパスではなく指定されたパスで開く
            // （/proc/pid/exe経由だと削除済みバイナリも読める）
            let is_exec = objects.is_empty();
            let open_path = if is_exec {
                exec_path.to_path_buf()
            } else {
                cache.rewrite_path(path)
            };

            let image = match cache.image_for_path(&open_path) {
                Ok(image) => image,
                Err(e) => {
                    tracing::debug!("skipping mapped object {}: {}", path, e);
                    continue;
                }
            };

            // マッピングのファイルオフセットに対応するセグメントから
            // ロードバイアスを逆算する
            let Some(seg) = image
                .segments_of_type(PT_LOAD)
                .min_by_key(|s| s.offset)
            else {
                continue;
            };
            let seg_vaddr = seg.vaddr + lowest.offset.saturating_sub(seg.offset);
            let load_addr = lowest.start.wrapping_sub(seg_vaddr);

            objects.push(LoadedObject { load_addr, image });
        }

        if objects.is_empty() {
            return Err(anyhow::anyhow!(
                "no loadable objects found in {:?}",
                exec_path
            ));
        }
        Ok(())
    }

    /// /proc/pid/taskからカーネルLWPを列挙する
    fn task_ids(&self) -> Result<Vec<i32>> {
        let dir = format!("/proc/{}/task", self.pid);
        let entries = std::fs::read_dir(&dir)
            .map_err(|_| TargetError::TargetLost(self.pid.as_raw()))?;
        let mut tids = Vec::new();
        for entry in entries.flatten() {
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                tids.push(tid);
            }
        }
        tids.sort_unstable();
        Ok(tids)
    }
}

impl Target for LiveProcess {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn threads(&self) -> Result<Vec<i32>> {
        // 停止中はアタッチ済みのタスク、それ以外は/procの列挙
        let attached = self.attached.lock().unwrap();
        if attached.is_empty() {
            self.task_ids()
        } else {
            Ok(attached.iter().map(|p| p.as_raw()).collect())
        }
    }

    fn registers(&self, lwp: i32) -> Result<RegisterBank> {
        let regs = ptrace::getregs(Pid::from_raw(lwp))
            .map_err(|e| anyhow::anyhow!("Failed to read registers of task {}: {}", lwp, e))?;
        Ok(RegisterBank::from_regs(regs))
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.read(addr, buf)
    }

    /// 全タスクにアタッチして停止させる
    ///
    /// アタッチ中に消えたタスクは読み飛ばします。プロセス自体が
    /// 消えていた場合は`TargetLost`です。
    fn stop_all(&self) -> Result<()> {
        let mut attached = self.attached.lock().unwrap();
        if !attached.is_empty() {
            return Ok(());
        }

        let tids = self.task_ids()?;
        for tid in tids {
            let pid = Pid::from_raw(tid);
            match ptrace::attach(pid) {
                Ok(()) => {}
                Err(nix::errno::Errno::ESRCH) => continue,
                Err(e) => {
                    tracing::debug!("failed to attach to task {}: {}", tid, e);
                    continue;
                }
            }
            // SIGSTOPによる停止を待つ
            loop {
                match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, _)) => break,
                    Ok(WaitStatus::Exited(_, _)) | Err(nix::errno::Errno::ESRCH) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("wait for task {} failed: {}", tid, e);
                        break;
                    }
                }
            }
            attached.push(pid);
        }

        if attached.is_empty() {
            return Err(TargetError::TargetLost(self.pid.as_raw()).into());
        }
        Ok(())
    }

    fn resume_all(&self) {
        let mut attached = self.attached.lock().unwrap();
        for pid in attached.drain(..) {
            if let Err(e) = ptrace::detach(pid, None) {
                tracing::debug!("failed to detach from task {}: {}", pid, e);
            }
        }
    }

    fn loaded_objects(&self) -> &[LoadedObject] {
        &self.objects
    }

    fn auxv(&self) -> Option<&[u8]> {
        None
    }
}

impl Drop for LiveProcess {
    fn drop(&mut self) {
        self.resume_all();
    }
}
