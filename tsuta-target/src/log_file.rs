//! 採取済みログからのプロセス合成機能
//!
//! クラッシュレポートなどに残された命令ポインタの列から、後追いで
//! スタックを復元するための合成プロセスです。ログファイル1つが
//! 1タスクに対応します。

use crate::process::{LoadedObject, Target};
use crate::registers::RegisterBank;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 命令ポインタのログから合成したプロセス
pub struct LogProcess {
    objects: Vec<LoadedObject>,
    /// (ログファイル名, フレームアドレス列)
    logs: Vec<(PathBuf, Vec<u64>)>,
}

impl LogProcess {
    /// 実行ファイルとログファイル群からプロセスを合成する
    ///
    /// ログの各行から16進のアドレストークン（0x...）を拾います。
    /// 読めないログは記録するだけで処理を続けます。
    pub fn new(exec: Arc<tsuta_elf::Image>, log_paths: &[PathBuf]) -> Result<Self> {
        let mut logs = Vec::new();
        for path in log_paths {
            match fs::read_to_string(path) {
                Ok(contents) => logs.push((path.clone(), scrape_addresses(&contents))),
                Err(e) => {
                    tracing::debug!("cannot read log {:?}: {}", path, e);
                }
            }
        }
        if logs.is_empty() {
            return Err(anyhow::anyhow!("no readable log files"));
        }

        Ok(Self {
            objects: vec![LoadedObject {
                load_addr: 0,
                image: exec,
            }],
            logs,
        })
    }

    /// ログファイルのパスを取得する
    pub fn log_path(&self, lwp: i32) -> Option<&Path> {
        self.logs
            .get((lwp - 1) as usize)
            .map(|(path, _)| path.as_path())
    }
}

/// テキストから16進アドレスを抽出する
fn scrape_addresses(contents: &str) -> Vec<u64> {
    let mut addrs = Vec::new();
    for token in contents.split(|c: char| !c.is_ascii_alphanumeric() && c != 'x') {
        if let Some(hex) = token.strip_prefix("0x") {
            if !hex.is_empty() {
                if let Ok(addr) = u64::from_str_radix(hex, 16) {
                    addrs.push(addr);
                }
            }
        }
    }
    addrs
}

impl Target for LogProcess {
    fn pid(&self) -> i32 {
        // 合成プロセスに本物のPIDは無い
        0
    }

    fn threads(&self) -> Result<Vec<i32>> {
        Ok((1..=self.logs.len() as i32).collect())
    }

    fn registers(&self, lwp: i32) -> Result<RegisterBank> {
        // レジスタは残っていない。フレームはcaptured_framesから得る。
        Err(anyhow::anyhow!("log process has no registers for task {}", lwp))
    }

    fn read_memory(&self, _addr: u64, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn stop_all(&self) -> Result<()> {
        Ok(())
    }

    fn resume_all(&self) {}

    fn loaded_objects(&self) -> &[LoadedObject] {
        &self.objects
    }

    fn captured_frames(&self, lwp: i32) -> Option<&[u64]> {
        self.logs
            .get((lwp - 1) as usize)
            .map(|(_, addrs)| addrs.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_addresses() {
        let log = "thread 1 crashed\n  ip=0x401234 sp=0x7ffd000\n  caller 0x401500\nnoise 12345\n";
        let addrs = scrape_addresses(log);
        assert_eq!(addrs, vec![0x401234, 0x7ffd000, 0x401500]);
    }

    #[test]
    fn test_scrape_empty() {
        assert!(scrape_addresses("no addresses here").is_empty());
    }

    #[test]
    fn test_log_process() {
        use std::io::Write as _;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ip 0x1000\nip 0x2000").unwrap();

        let exec = Arc::new(
            tsuta_elf::Image::open(std::env::current_exe().unwrap()).unwrap(),
        );
        let process = LogProcess::new(exec, &[file.path().to_path_buf()]).unwrap();

        assert_eq!(process.threads().unwrap(), vec![1]);
        assert_eq!(process.captured_frames(1).unwrap(), &[0x1000, 0x2000]);
        assert!(process.captured_frames(2).is_none());
        assert!(process.registers(1).is_err());
    }
}
