//! 実行中プロセスのメモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom};

/// メモリマッピング情報
///
/// `/proc/<pid>/maps`の1行に対応します。
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// ファイルパス（無名マッピングはNone）
    pub path: Option<String>,
}

/// mapsの1行を解析する
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().map(str::to_string);

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let mut chars = perms.chars();
    let readable = chars.next() == Some('r');
    let writable = chars.next() == Some('w');
    let executable = chars.next() == Some('x');

    Some(MemoryMapping {
        start,
        end,
        offset,
        readable,
        writable,
        executable,
        path,
    })
}

/// 実行中プロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAに
    /// フォールバックします。
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        match self.read_via_proc_mem(addr, buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, buf);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        // マッピング境界で短い読み取りになることがあるため、
        // 読めるところまで読み進める
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(total)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<nix::libc::c_long>();
        let mut total = 0;

        while total < buf.len() {
            let word_addr = (addr as usize + total) as *mut std::ffi::c_void;
            let word = match ptrace::read(self.pid, word_addr) {
                Ok(word) => word,
                Err(_) if total > 0 => break,
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to read via ptrace at {:#x}: {}",
                        addr as usize + total,
                        e
                    ))
                }
            };
            let bytes = word.to_ne_bytes();
            let n = (buf.len() - total).min(word_size);
            buf[total..total + n].copy_from_slice(&bytes[..n]);
            total += n;
        }
        Ok(total)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(mapping) = parse_maps_line(&line) {
                mappings.push(mapping);
            }
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_maps_line() {
        let m = parse_maps_line(
            "7f1234567000-7f1234568000 r-xp 00001000 08:01 123456 /lib/libc.so",
        )
        .unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert_eq!(m.offset, 0x1000);
        assert!(m.readable && !m.writable && m.executable);
        assert_eq!(m.path.as_deref(), Some("/lib/libc.so"));
    }

    #[test]
    fn test_parse_maps_line_anonymous() {
        let m = parse_maps_line("7ffd7000-7ffd9000 rw-p 00000000 00:00 0").unwrap();
        assert!(m.path.is_none());
        assert!(m.writable);
    }

    #[test]
    fn test_parse_maps_line_garbage() {
        assert!(parse_maps_line("not a maps line").is_none());
        assert!(parse_maps_line("").is_none());
    }

    #[test]
    fn test_read_own_mappings() {
        // 自プロセスのmapsは常に読めるはず
        let memory = Memory::new(std::process::id() as i32);
        let mappings = memory.mappings().unwrap();
        assert!(!mappings.is_empty());
        assert!(mappings.iter().any(|m| m.executable));
    }
}
