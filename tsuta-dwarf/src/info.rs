//! DWARF情報の読み込み機能

use crate::frames::FrameTable;
use crate::lines::LineMatrix;
use crate::symbols::SymbolTable;
use crate::unit::UnitSlot;
use crate::Result;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use tsuta_elf::{Endian, Image, ImageCache};

/// DWARFセクションの読み取りに使うリーダー型
///
/// イメージのバイト列は'staticライフタイムなので、セクションを
/// コピーせずにスライスとして参照します。
pub type Slice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// ELFのエンディアンをgimliの実行時エンディアンに変換する
pub fn runtime_endian(endian: Endian) -> gimli::RunTimeEndian {
    match endian {
        Endian::Little => gimli::RunTimeEndian::Little,
        Endian::Big => gimli::RunTimeEndian::Big,
    }
}

/// 1つのELFイメージのDWARF情報
///
/// コンパイル単位・行番号マトリクス・CFI索引・シンボルテーブルの
/// 解析キャッシュを所有します。いずれも初回アクセス時に遅延構築され、
/// 構築後は読み取り専用です。分離デバッグファイルが解決できた場合、
/// デバッグセクションはそちらから優先的に読み取ります。
pub struct DwarfInfo {
    image: Arc<Image>,
    debug_image: Option<Arc<Image>>,
    dwarf: gimli::Dwarf<Slice>,
    units: OnceCell<Vec<UnitSlot>>,
    unit_ranges: OnceCell<Vec<(u64, u64, usize)>>,
    frames: OnceCell<Option<FrameTable>>,
    symbols: OnceCell<SymbolTable>,
}

impl DwarfInfo {
    /// イメージのDWARF情報を読み込む
    ///
    /// ローカルのデバッグセクションがスタブの場合、キャッシュ経由で
    /// 分離デバッグファイルを解決します。デバッグ情報が見つからなくても
    /// エラーにはならず、シンボルテーブルだけで動作を続けます。
    pub fn new(image: Arc<Image>, cache: &ImageCache) -> Result<Self> {
        let debug_image = cache.debug_image_for(&image);
        let endian = runtime_endian(image.endian());

        // セクションはまず分離デバッグファイル、無ければ元のイメージから読む
        let load_section = |id: gimli::SectionId| -> std::result::Result<Slice, gimli::Error> {
            let data = debug_image
                .as_ref()
                .and_then(|d| d.section_data(id.name()))
                .or_else(|| image.section_data(id.name()))
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        let dwarf = gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))?;

        Ok(Self {
            image,
            debug_image,
            dwarf,
            units: OnceCell::new(),
            unit_ranges: OnceCell::new(),
            frames: OnceCell::new(),
            symbols: OnceCell::new(),
        })
    }

    /// 元のイメージを取得する
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// イメージのパスを取得する
    pub fn path(&self) -> &Path {
        self.image.path()
    }

    /// gimliのDWARFコンテキストへの参照を取得する
    pub fn dwarf(&self) -> &gimli::Dwarf<Slice> {
        &self.dwarf
    }

    /// DWARFデバッグ情報が存在するかを判定する
    pub fn has_debug_info(&self) -> bool {
        self.debug_image
            .as_deref()
            .is_some_and(tsuta_elf::debug_link::has_debug_info)
            || tsuta_elf::debug_link::has_debug_info(&self.image)
    }

    /// コンパイル単位の一覧を取得する
    ///
    /// 初回アクセス時に.debug_infoをヘッダ単位で歩き、各単位の
    /// スロットを確保します。単位の本体はこの時点では解読しません。
    /// 不正なヘッダに遭遇した場合はそこで列挙を打ち切ります
    /// （そのイメージに限定された失敗で、処理全体は継続します）。
    pub fn units(&self) -> &[UnitSlot] {
        self.units.get_or_init(|| {
            let mut slots = Vec::new();
            let mut iter = self.dwarf.units();
            loop {
                match iter.next() {
                    Ok(Some(header)) => slots.push(UnitSlot::new(header)),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(
                            "stopping unit walk of {:?}: {}",
                            self.image.path(),
                            e
                        );
                        break;
                    }
                }
            }
            slots
        })
    }

    /// 指定インデックスの単位を解読して取得する
    pub fn unit(&self, index: usize) -> Result<&gimli::Unit<Slice>> {
        self.units()[index].load(&self.dwarf)
    }

    /// アドレスを含むコンパイル単位のインデックスを取得する
    ///
    /// ルートDIEの明示的なアドレス範囲を優先し、範囲を持たない単位
    /// だけ.debug_arangesにフォールバックします。
    pub fn unit_index_for_address(&self, addr: u64) -> Option<usize> {
        let ranges = self.unit_ranges.get_or_init(|| self.build_unit_ranges());
        let idx = ranges.partition_point(|r| r.0 <= addr);
        if idx == 0 {
            return None;
        }
        let (_, end, unit_idx) = ranges[idx - 1];
        (addr < end).then_some(unit_idx)
    }

    fn build_unit_ranges(&self) -> Vec<(u64, u64, usize)> {
        let mut out = Vec::new();
        for (idx, slot) in self.units().iter().enumerate() {
            let unit = match slot.load(&self.dwarf) {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::debug!("skipping unit {} of {:?}: {}", idx, self.image.path(), e);
                    continue;
                }
            };
            let mut added = false;
            if let Ok(mut iter) = self.dwarf.unit_ranges(unit) {
                while let Ok(Some(range)) = iter.next() {
                    if range.begin < range.end {
                        out.push((range.begin, range.end, idx));
                        added = true;
                    }
                }
            }
            if !added {
                self.aranges_for_unit(slot, idx, &mut out);
            }
        }
        out.sort_by_key(|r| r.0);
        out
    }

    fn aranges_for_unit(&self, slot: &UnitSlot, idx: usize, out: &mut Vec<(u64, u64, usize)>) {
        let mut headers = self.dwarf.debug_aranges.headers();
        while let Ok(Some(header)) = headers.next() {
            if header.debug_info_offset() != slot.offset() {
                continue;
            }
            let mut entries = header.entries();
            while let Ok(Some(entry)) = entries.next() {
                if entry.length() > 0 {
                    out.push((entry.address(), entry.address() + entry.length(), idx));
                }
            }
            return;
        }
    }

    /// 指定単位の行番号マトリクスを取得する
    pub fn lines(&self, index: usize) -> Result<Option<&LineMatrix>> {
        let slot = &self.units()[index];
        slot.lines(&self.dwarf)
    }

    /// アドレスからソースファイルと行番号を取得する
    pub fn source_from_addr(&self, addr: u64) -> Result<Option<(String, u32)>> {
        let Some(index) = self.unit_index_for_address(addr) else {
            return Ok(None);
        };
        let Some(matrix) = self.lines(index)? else {
            return Ok(None);
        };
        Ok(matrix
            .source_from_addr(addr)
            .map(|(file, line, _)| (file.to_string(), line)))
    }

    /// CFI（.eh_frame / .debug_frame）の索引を取得する
    pub fn frames(&self) -> Option<&FrameTable> {
        self.frames
            .get_or_init(|| FrameTable::load(&self.image, self.debug_image.as_deref()))
            .as_ref()
    }

    /// シンボルテーブルを取得する
    pub fn symbols(&self) -> &SymbolTable {
        self.symbols
            .get_or_init(|| SymbolTable::new(&self.image, self.debug_image.as_deref()))
    }
}

impl std::fmt::Debug for DwarfInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwarfInfo")
            .field("path", &self.image.path())
            .field("debug_image", &self.debug_image.as_ref().map(|d| d.path()))
            .finish()
    }
}
