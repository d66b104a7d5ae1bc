//! コアダンプからのプロセス再構成機能

use crate::process::{find_segment, LoadedObject, Target};
use crate::registers::RegisterBank;
use crate::Result;
use std::sync::Arc;
use tsuta_elf::notes::{NT_AUXV, NT_FILE, NT_PRSTATUS};
use tsuta_elf::{Image, ImageCache, Reader, Segment, PT_DYNAMIC, PT_PHDR};

/// auxvのエントリタイプ
const AT_PHDR: u64 = 3;
/// 動的セクションのタグ
const DT_NULL: u64 = 0;
const DT_DEBUG: u64 = 21;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ElfSigInfo {
    si_signo: i32,
    si_code: i32,
    si_errno: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PrTimeval {
    tv_sec: i64,
    tv_usec: i64,
}

/// NT_PRSTATUSノートのレイアウト（x86-64）
///
/// カーネルのstruct elf_prstatusに対応します。サイズとpr_regの
/// オフセットはテストで検証しています。
#[repr(C)]
#[derive(Clone, Copy)]
struct ElfPrStatus {
    pr_info: ElfSigInfo,
    pr_cursig: i16,
    pr_sigpend: u64,
    pr_sighold: u64,
    pr_pid: i32,
    pr_ppid: i32,
    pr_pgrp: i32,
    pr_sid: i32,
    pr_utime: PrTimeval,
    pr_stime: PrTimeval,
    pr_cutime: PrTimeval,
    pr_cstime: PrTimeval,
    pr_reg: nix::libc::user_regs_struct,
    pr_fpvalid: i32,
}

/// ノートのバイト列から平坦なC構造体を読み出す
fn read_pod<T: Copy>(data: &[u8]) -> Result<T> {
    if data.len() < std::mem::size_of::<T>() {
        return Err(anyhow::anyhow!(
            "note of {} bytes too small for {}",
            data.len(),
            std::any::type_name::<T>()
        ));
    }
    // 境界チェック済み。ノートは4バイト整列しかされないため
    // 非整列読み出しを使う。
    Ok(unsafe { std::ptr::read_unaligned(data.as_ptr().cast()) })
}

/// NT_FILEノートの1エントリ
#[derive(Debug, Clone)]
pub struct FileMapping {
    pub start: u64,
    pub end: u64,
    /// ファイル先頭からのオフセット（バイト）
    pub file_offset: u64,
    pub path: String,
}

/// NT_FILEノートを解析する
///
/// レイアウト: count, page_size, count個の(start, end, file_ofs)、
/// 続けてNUL終端のパス列。file_ofsはページ数で記録されている。
fn parse_file_note(desc: &[u8], image: &Image) -> Result<Vec<FileMapping>> {
    let r = Reader::new(desc, image.endian());
    let is_64 = image.is_64();
    let word = if is_64 { 8u64 } else { 4u64 };

    let count = r.word(0, is_64)?;
    let page_size = r.word(word, is_64)?;
    let entries_start = word * 2;
    let strings_start = entries_start + count * word * 3;

    let mut mappings = Vec::new();
    let mut stroff = strings_start;
    for i in 0..count {
        let base = entries_start + i * word * 3;
        let start = r.word(base, is_64)?;
        let end = r.word(base + word, is_64)?;
        let pages = r.word(base + word * 2, is_64)?;
        let path = r.cstr(stroff)?.to_string();
        stroff += path.len() as u64 + 1;
        mappings.push(FileMapping {
            start,
            end,
            file_offset: pages * page_size,
            path,
        });
    }
    Ok(mappings)
}

/// コアダンプから再構成したプロセス
///
/// メモリはコアのPT_LOADセグメント、足りない部分はマップされていた
/// ファイルのディスク上のイメージ、それも無ければゼロで埋めます。
/// レジスタはNT_PRSTATUSノート（タスクごとに1つ）から取り込みます。
pub struct CoreProcess {
    core: Arc<Image>,
    objects: Vec<LoadedObject>,
    /// (LWP, レジスタバンク)。コア内のノート出現順。
    tasks: Vec<(i32, RegisterBank)>,
    auxv: Option<Vec<u8>>,
    file_mappings: Vec<FileMapping>,
}

impl CoreProcess {
    /// 実行ファイルとコアからプロセスを組み立てる
    ///
    /// `exec`が指定されない場合、auxvのAT_PHDRを含むNT_FILEエントリ
    /// から実行ファイルを推定します。共有ライブラリはリンクマップを
    /// たどって列挙し、リンクマップが読めないコアではNT_FILEノートに
    /// フォールバックします。
    pub fn new(
        exec: Option<Arc<Image>>,
        core: Arc<Image>,
        cache: &ImageCache,
    ) -> Result<Self> {
        if !core.is_core() {
            return Err(anyhow::anyhow!("{:?} is not a core file", core.path()));
        }

        let mut tasks = Vec::new();
        let mut auxv = None;
        let mut file_mappings = Vec::new();

        for note in core.notes()? {
            if note.name != "CORE" {
                continue;
            }
            match note.n_type {
                NT_PRSTATUS => {
                    let prstatus: ElfPrStatus = read_pod(note.desc)?;
                    tasks.push((prstatus.pr_pid, RegisterBank::from_regs(prstatus.pr_reg)));
                }
                NT_AUXV => auxv = Some(note.desc.to_vec()),
                NT_FILE => match parse_file_note(note.desc, &core) {
                    Ok(mappings) => file_mappings = mappings,
                    Err(e) => tracing::debug!("malformed NT_FILE note: {}", e),
                },
                _ => {}
            }
        }

        let mut process = Self {
            core,
            objects: Vec::new(),
            tasks,
            auxv,
            file_mappings,
        };

        process.locate_executable(exec, cache);
        process.load_shared_objects(cache);
        Ok(process)
    }

    /// 実行ファイルを特定してロード済みオブジェクトに加える
    fn locate_executable(&mut self, exec: Option<Arc<Image>>, cache: &ImageCache) {
        let at_phdr = self.auxv_entry(AT_PHDR);

        let exec = exec.or_else(|| {
            // AT_PHDRを含むNT_FILEエントリが実行ファイル本体
            let at_phdr = at_phdr?;
            let entry = self
                .file_mappings
                .iter()
                .find(|m| m.start <= at_phdr && at_phdr < m.end)?;
            match cache.image_for_recorded_path(&entry.path) {
                Ok(image) => Some(image),
                Err(e) => {
                    tracing::debug!("cannot load executable {}: {}", entry.path, e);
                    None
                }
            }
        });

        let Some(exec) = exec else {
            tracing::debug!("no executable located for {:?}", self.core.path());
            return;
        };

        // AT_PHDRとPT_PHDRの仮想アドレスの差がロードバイアス
        let load_addr = match (at_phdr, exec.segments_of_type(PT_PHDR).next()) {
            (Some(at_phdr), Some(phdr_seg)) => at_phdr.wrapping_sub(phdr_seg.vaddr),
            _ => 0,
        };

        self.objects.insert(0, LoadedObject { load_addr, image: exec });
    }

    /// 共有ライブラリを列挙する
    fn load_shared_objects(&mut self, cache: &ImageCache) {
        match self.load_from_link_map(cache) {
            Ok(n) if n > 0 => return,
            Ok(_) => tracing::debug!("link map empty, falling back to NT_FILE"),
            Err(e) => tracing::debug!("link map unreadable ({}), falling back to NT_FILE", e),
        }
        self.load_from_file_note(cache);
    }

    /// 動的リンカのリンクマップをたどって共有ライブラリを列挙する
    ///
    /// AT_PHDR -> PT_DYNAMIC -> DT_DEBUG -> r_debug.r_map の順に
    /// コアのメモリから読み出します。
    fn load_from_link_map(&mut self, cache: &ImageCache) -> Result<usize> {
        let exec = self
            .objects
            .first()
            .ok_or_else(|| anyhow::anyhow!("no executable"))?;
        let bias = exec.load_addr;

        let dynamic = *exec
            .image
            .segments_of_type(PT_DYNAMIC)
            .next()
            .ok_or_else(|| anyhow::anyhow!("executable has no PT_DYNAMIC"))?;

        // 動的セクションからDT_DEBUGを探す
        let mut r_debug = 0u64;
        let mut entry_addr = bias.wrapping_add(dynamic.vaddr);
        for _ in 0..dynamic.memsz / 16 {
            let tag = self.read_word(entry_addr)?;
            let value = self.read_word(entry_addr + 8)?;
            if tag == DT_NULL {
                break;
            }
            if tag == DT_DEBUG {
                r_debug = value;
                break;
            }
            entry_addr += 16;
        }
        if r_debug == 0 {
            return Err(anyhow::anyhow!("no DT_DEBUG entry"));
        }

        // r_debug.r_map から link_map の連結リストをたどる。
        // 連結リストの途中が読めないコアでは、そこまでに読めた分を使う。
        let mut link = self.read_word(r_debug + 8)?;
        let mut loaded = 0usize;
        let mut visited = 0;
        while link != 0 && visited < 1024 {
            visited += 1;
            let (l_addr, l_name, l_next) = match (
                self.read_word(link),
                self.read_word(link + 8),
                self.read_word(link + 24),
            ) {
                (Ok(a), Ok(n), Ok(x)) => (a, n, x),
                _ => break,
            };

            let name = if l_name != 0 {
                self.read_string(l_name, 4096).unwrap_or_default()
            } else {
                String::new()
            };

            // 空の名前は実行ファイル自身のエントリ
            if !name.is_empty() {
                match cache.image_for_recorded_path(&name) {
                    Ok(image) => {
                        self.objects.push(LoadedObject {
                            load_addr: l_addr,
                            image,
                        });
                        loaded += 1;
                    }
                    Err(e) => tracing::debug!("skipping {}: {}", name, e),
                }
            }
            link = l_next;
        }
        Ok(loaded)
    }

    /// NT_FILEノートから共有ライブラリを列挙する
    ///
    /// リンクマップが読めない切り詰められたコアのための推定です。
    /// ファイルオフセット0のエントリをELFオブジェクトとして読み、
    /// マッピングの先頭アドレスをロードアドレスに使います。
    fn load_from_file_note(&mut self, cache: &ImageCache) {
        let exec_path = self.objects.first().map(|o| o.image.path().to_path_buf());
        for entry in &self.file_mappings {
            if entry.file_offset != 0 {
                continue;
            }
            let path = cache.rewrite_path(&entry.path);
            if exec_path.as_deref() == Some(path.as_path()) {
                continue;
            }
            match cache.image_for_path(&path) {
                Ok(image) => {
                    tracing::debug!("NT_FILE mapping {} at {:#x}", entry.path, entry.start);
                    self.objects.push(LoadedObject {
                        load_addr: entry.start,
                        image,
                    });
                }
                Err(e) => tracing::debug!("skipping NT_FILE entry {}: {}", entry.path, e),
            }
        }
    }

    /// auxvから指定タイプのエントリを取り出す
    fn auxv_entry(&self, wanted: u64) -> Option<u64> {
        let auxv = self.auxv.as_deref()?;
        let r = Reader::new(auxv, self.core.endian());
        let word = if self.core.is_64() { 8u64 } else { 4 };
        let mut off = 0;
        while off + word * 2 <= r.len() {
            let a_type = r.word(off, self.core.is_64()).ok()?;
            let a_val = r.word(off + word, self.core.is_64()).ok()?;
            if a_type == wanted {
                return Some(a_val);
            }
            off += word * 2;
        }
        None
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = read_layered(&self.core, &self.objects, addr, &mut buf);
        if n != 8 {
            return Err(crate::TargetError::AddressNotMapped(addr).into());
        }
        Ok(u64::from_le_bytes(buf))
    }

    fn read_string(&self, addr: u64, max: usize) -> Result<String> {
        let mut buf = vec![0u8; max];
        let n = read_layered(&self.core, &self.objects, addr, &mut buf);
        buf.truncate(n);
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }
}

/// セグメントのファイル内容から読めるだけ読み、ゼロ埋め可能な
/// バイト数を計算する
///
/// `vaddr`はセグメントの属するイメージ内の仮想アドレス。読み取った
/// バイト数を返し、`zeroes`にはp_memszまで既定値で埋められる量を
/// 反映します。
fn read_from_segment(
    image: &Image,
    seg: &Segment,
    vaddr: u64,
    out: &mut [u8],
    zeroes: &mut u64,
) -> usize {
    let mut off = vaddr - seg.vaddr;
    let size = out.len() as u64;
    let mut rv = 0u64;

    if off < seg.filesz {
        // 一部はファイルにある: 必要量とファイル内残量の小さい方を読む
        let want = (seg.filesz - off).min(size);
        let bytes = image.segment_bytes(seg);
        if (off as usize) < bytes.len() {
            let have = ((bytes.len() as u64) - off).min(want) as usize;
            out[..have].copy_from_slice(&bytes[off as usize..off as usize + have]);
            rv = have as u64;
        }
        off += rv;
    }

    let remaining = size - rv;
    *zeroes = std::cmp::max(
        if *zeroes > rv { *zeroes - rv } else { 0 },
        if remaining != 0 && off < seg.memsz {
            remaining.min(seg.memsz - off)
        } else {
            0
        },
    );
    rv as usize
}

/// コアとロード済みオブジェクトを重ねたメモリ読み取り
///
/// 1. アドレスを含むコアのセグメントからファイル上のバイトを読む
/// 2. データが得られてゼロ埋めの持ち越しが無ければ次の範囲へ進む
/// 3. 足りなければロード済みオブジェクトのセグメントを参照する
/// 4. 残りをゼロで埋める
/// 5. どの読み取り元からも1バイトも得られなければ打ち切る
fn read_layered(core: &Image, objects: &[LoadedObject], addr: u64, buf: &mut [u8]) -> usize {
    let mut remote = addr;
    let mut done = 0usize;

    while done < buf.len() {
        let mut zeroes = 0u64;

        if let Some(seg) = core.segment_for_address(remote) {
            let rc = read_from_segment(core, seg, remote, &mut buf[done..], &mut zeroes);
            remote += rc as u64;
            done += rc;
            if rc != 0 && zeroes == 0 {
                continue;
            }
        }

        // コアに無い、または不完全: ロード済みオブジェクトのイメージを探す
        let mut from_object = 0usize;
        if let Some((load_addr, image, seg)) = find_segment(objects, remote) {
            from_object = read_from_segment(
                image,
                seg,
                remote.wrapping_sub(load_addr),
                &mut buf[done..],
                &mut zeroes,
            );
            remote += from_object as u64;
            done += from_object;
        }

        // 実データをコピーし終えた残りをゼロで埋める
        let fill = (zeroes as usize).min(buf.len() - done);
        buf[done..done + fill].fill(0);
        done += fill;
        remote += fill as u64;

        if from_object == 0 && fill == 0 {
            // コアからもオブジェクトからも既定値からも進めない
            break;
        }
    }
    done
}

impl Target for CoreProcess {
    fn pid(&self) -> i32 {
        // コアの先頭タスクのPIDを返す
        self.tasks.first().map(|(pid, _)| *pid).unwrap_or(-1)
    }

    fn threads(&self) -> Result<Vec<i32>> {
        Ok(self.tasks.iter().map(|(lwp, _)| *lwp).collect())
    }

    fn registers(&self, lwp: i32) -> Result<RegisterBank> {
        self.tasks
            .iter()
            .find(|(id, _)| *id == lwp)
            .map(|(_, regs)| *regs)
            .ok_or_else(|| anyhow::anyhow!("no NT_PRSTATUS note for task {}", lwp))
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(read_layered(&self.core, &self.objects, addr, buf))
    }

    fn stop_all(&self) -> Result<()> {
        // 死んだプロセスは止められない
        Ok(())
    }

    fn resume_all(&self) {
        // 事後解析では何もしない
    }

    fn loaded_objects(&self) -> &[LoadedObject] {
        &self.objects
    }

    fn auxv(&self) -> Option<&[u8]> {
        self.auxv.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prstatus_layout() {
        // x86-64カーネルのstruct elf_prstatusと一致すること
        assert_eq!(std::mem::size_of::<ElfPrStatus>(), 336);
        assert_eq!(std::mem::offset_of!(ElfPrStatus, pr_pid), 32);
        assert_eq!(std::mem::offset_of!(ElfPrStatus, pr_reg), 112);
        assert_eq!(std::mem::offset_of!(ElfPrStatus, pr_fpvalid), 328);
    }

    #[test]
    fn test_read_pod_too_small() {
        let data = [0u8; 16];
        assert!(read_pod::<ElfPrStatus>(&data).is_err());
    }

    #[test]
    fn test_file_note_roundtrip() {
        // 合成したNT_FILEのdescを解析できること
        let mut desc = Vec::new();
        desc.extend_from_slice(&2u64.to_le_bytes()); // count
        desc.extend_from_slice(&4096u64.to_le_bytes()); // page size
        for (start, end, pages) in [(0x1000u64, 0x2000u64, 0u64), (0x7f00000000, 0x7f00004000, 2)] {
            desc.extend_from_slice(&start.to_le_bytes());
            desc.extend_from_slice(&end.to_le_bytes());
            desc.extend_from_slice(&pages.to_le_bytes());
        }
        desc.extend_from_slice(b"/bin/prog\0/lib/libc.so\0");

        // Imageはエンディアンとクラスの情報源としてだけ使うため、
        // 自プロセスの実行ファイルで代用する
        let image = Image::open(std::env::current_exe().unwrap()).unwrap();
        let mappings = parse_file_note(&desc, &image).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].path, "/bin/prog");
        assert_eq!(mappings[0].file_offset, 0);
        assert_eq!(mappings[1].path, "/lib/libc.so");
        assert_eq!(mappings[1].file_offset, 2 * 4096);
        assert_eq!(mappings[1].start, 0x7f00000000);
    }
}
