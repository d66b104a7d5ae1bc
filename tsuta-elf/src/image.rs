//! ELFイメージの解析機能

use crate::error::ElfError;
use crate::notes::{self, Note};
use crate::reader::{Endian, Reader};
use crate::Result;
use object::{Object, ObjectSection};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// プログラムヘッダのタイプ
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_NOTE: u32 = 4;
pub const PT_PHDR: u32 = 6;

/// プログラムヘッダ（セグメント）
///
/// 32ビット・64ビット両クラスを共通の表現に正規化したもの。
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl Segment {
    /// 仮想アドレスがセグメントのメモリ範囲に含まれるかを判定する
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.vaddr && vaddr < self.vaddr.saturating_add(self.memsz)
    }
}

/// 解析済みのELFイメージ
///
/// 構築時にヘッダとプログラムヘッダを検証し、以降は不変です。
/// イメージのバイト列はImageCacheがプロセス終了まで保持する前提で
/// `Box::leak`により'staticライフタイムを得ています（セクションや
/// ノートのビューを所有権の循環なしに貸し出すため）。
pub struct Image {
    path: PathBuf,
    data: &'static [u8],
    object: object::File<'static>,
    endian: Endian,
    is_64: bool,
    segments: Vec<Segment>,
    build_id: Option<Vec<u8>>,
    /// 展開済みセクションのキャッシュ（セクション名 -> 展開後バイト列）
    section_cache: Mutex<HashMap<String, Option<&'static [u8]>>>,
}

impl Image {
    /// ファイルからELFイメージを読み込む
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", path, e))?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| anyhow::anyhow!("Failed to map {:?}: {}", path, e))?;
        let mmap: &'static memmap2::Mmap = Box::leak(Box::new(mmap));
        Self::parse(path.to_path_buf(), &mmap[..])
    }

    /// メモリ上のバイト列からELFイメージを読み込む
    ///
    /// ファイルに対応しないイメージ（テスト用の合成イメージなど）に使用します。
    pub fn from_bytes<P: AsRef<Path>>(label: P, bytes: Vec<u8>) -> Result<Self> {
        let data: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        Self::parse(label.as_ref().to_path_buf(), data)
    }

    fn parse(path: PathBuf, data: &'static [u8]) -> Result<Self> {
        let object = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        if !matches!(
            object,
            object::File::Elf32(_) | object::File::Elf64(_)
        ) {
            return Err(ElfError::BadFormat(format!("{:?} is not an ELF image", path)).into());
        }

        let endian = if object.is_little_endian() {
            Endian::Little
        } else {
            Endian::Big
        };
        let is_64 = object.is_64();

        let segments = Self::parse_program_headers(data, endian, is_64)
            .map_err(|e| anyhow::anyhow!("Bad program headers in {:?}: {}", path, e))?;

        let build_id = object
            .build_id()
            .ok()
            .flatten()
            .map(|id| id.to_vec());

        Ok(Self {
            path,
            data,
            object,
            endian,
            is_64,
            segments,
            build_id,
            section_cache: Mutex::new(HashMap::new()),
        })
    }

    /// プログラムヘッダを解析する
    ///
    /// objectクレートのセグメント列挙はPT_LOADしか返さないため、
    /// ノート（PT_NOTE）や動的セクション（PT_DYNAMIC）を扱えるように
    /// ヘッダテーブルを直接読み取ります。テーブル全体がファイル内に
    /// 収まることをここで検証します。
    fn parse_program_headers(data: &[u8], endian: Endian, is_64: bool) -> Result<Vec<Segment>> {
        let r = Reader::new(data, endian);
        let (phoff, phentsize, phnum, expect_entsize) = if is_64 {
            (r.u64(0x20)?, r.u16(0x36)? as u64, r.u16(0x38)? as u64, 56)
        } else {
            (r.u32(0x1c)? as u64, r.u16(0x2a)? as u64, r.u16(0x2c)? as u64, 32)
        };

        if phnum == 0 {
            return Ok(Vec::new());
        }
        if phentsize < expect_entsize {
            return Err(ElfError::BadFormat(format!(
                "program header entry size {} too small",
                phentsize
            ))
            .into());
        }
        // テーブル全体の範囲チェック
        r.bytes(phoff, phentsize * phnum)?;

        let mut segments = Vec::with_capacity(phnum as usize);
        for i in 0..phnum {
            let base = phoff + i * phentsize;
            let seg = if is_64 {
                Segment {
                    p_type: r.u32(base)?,
                    flags: r.u32(base + 4)?,
                    offset: r.u64(base + 8)?,
                    vaddr: r.u64(base + 16)?,
                    filesz: r.u64(base + 32)?,
                    memsz: r.u64(base + 40)?,
                    align: r.u64(base + 48)?,
                }
            } else {
                Segment {
                    p_type: r.u32(base)?,
                    offset: r.u32(base + 4)? as u64,
                    vaddr: r.u32(base + 8)? as u64,
                    filesz: r.u32(base + 16)? as u64,
                    memsz: r.u32(base + 20)? as u64,
                    flags: r.u32(base + 24)?,
                    align: r.u32(base + 28)? as u64,
                }
            };
            segments.push(seg);
        }
        Ok(segments)
    }

    /// イメージのパスを取得する
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// objectクレートのファイルハンドルを取得する
    pub fn object(&self) -> &object::File<'static> {
        &self.object
    }

    /// エンディアンを取得する
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// 64ビットイメージかどうかを取得する
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    /// コアダンプかどうかを判定する
    pub fn is_core(&self) -> bool {
        self.object.kind() == object::ObjectKind::Core
    }

    /// プログラムヘッダの一覧を取得する
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 指定タイプのプログラムヘッダを列挙する
    pub fn segments_of_type(&self, p_type: u32) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(move |s| s.p_type == p_type)
    }

    /// 仮想アドレスを含むPT_LOADセグメントを取得する
    ///
    /// 複数のセグメントが該当する場合はp_memszが最小のものを選びます。
    pub fn segment_for_address(&self, vaddr: u64) -> Option<&Segment> {
        self.segments
            .iter()
            .filter(|s| s.p_type == PT_LOAD && s.contains(vaddr))
            .min_by_key(|s| s.memsz)
    }

    /// セグメントのファイル上のバイト列を取得する
    ///
    /// 切り詰められたコアダンプではp_fileszがファイル末尾を越えることが
    /// あるため、実際に存在する範囲に切り詰めて返します。
    pub fn segment_bytes(&self, seg: &Segment) -> &'static [u8] {
        let start = (seg.offset as usize).min(self.data.len());
        let end = (seg.offset.saturating_add(seg.filesz) as usize).min(self.data.len());
        &self.data[start..end]
    }

    /// PT_NOTEセグメントからすべてのノートを列挙する
    pub fn notes(&self) -> Result<Vec<Note<'static>>> {
        let mut out = Vec::new();
        for seg in self.segments_of_type(PT_NOTE) {
            let data = self.segment_bytes(seg);
            notes::parse_notes(data, self.endian, &mut out)?;
        }
        Ok(out)
    }

    /// build-idを取得する
    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    /// .gnu_debuglinkの（ファイル名, CRC32）を取得する
    pub fn gnu_debuglink(&self) -> Option<(String, u32)> {
        let (name, crc) = self.object.gnu_debuglink().ok().flatten()?;
        Some((String::from_utf8_lossy(name).into_owned(), crc))
    }

    /// 指定名のセクションが存在するかを判定する
    pub fn has_section(&self, name: &str) -> bool {
        self.object.section_by_name(name).is_some()
    }

    /// セクションのバイト列を取得する
    ///
    /// `.zdebug_*`の旧式圧縮セクションとSHF_COMPRESSEDセクション
    /// （zlib/zstd）は透過的に展開されます。展開結果は初回アクセス時に
    /// セクション単位でキャッシュされます。
    pub fn section_data(&self, name: &str) -> Option<&'static [u8]> {
        let mut cache = self.section_cache.lock().unwrap();
        if let Some(cached) = cache.get(name) {
            return *cached;
        }
        let data = self.load_section(name);
        cache.insert(name.to_string(), data);
        data
    }

    fn load_section(&self, name: &str) -> Option<&'static [u8]> {
        let section = self.object.section_by_name(name).or_else(|| {
            // .debug_info が無ければ .zdebug_info を探す
            let rest = name.strip_prefix(".debug_")?;
            self.object.section_by_name(&format!(".zdebug_{}", rest))
        })?;
        match section.uncompressed_data() {
            Ok(Cow::Borrowed(data)) => Some(data),
            Ok(Cow::Owned(data)) => Some(&*Box::leak(data.into_boxed_slice())),
            Err(e) => {
                tracing::debug!("failed to read section {} of {:?}: {}", name, self.path, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("is_64", &self.is_64)
            .field("endian", &self.endian)
            .field("segments", &self.segments.len())
            .finish()
    }
}
