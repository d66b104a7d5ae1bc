//! コンパイル単位とDIEへのアクセス機能

use crate::info::Slice;
use crate::lines::LineMatrix;
use crate::Result;
use once_cell::sync::OnceCell;
use std::collections::HashMap;

/// コンパイル単位のスロット
///
/// ヘッダだけを保持し、DIEツリー・略号テーブル・行番号マトリクス・
/// 親マップはそれぞれ初回アクセス時に構築します。構築後は読み取り
/// 専用です。
pub struct UnitSlot {
    offset: gimli::DebugInfoOffset,
    header: gimli::UnitHeader<Slice>,
    unit: OnceCell<gimli::Unit<Slice>>,
    lines: OnceCell<Option<LineMatrix>>,
    parents: OnceCell<HashMap<gimli::UnitOffset, Option<gimli::UnitOffset>>>,
}

impl UnitSlot {
    /// ヘッダからスロットを作成する
    pub fn new(header: gimli::UnitHeader<Slice>) -> Self {
        let offset = match header.offset() {
            gimli::UnitSectionOffset::DebugInfoOffset(off) => off,
            // .debug_typesの型単位はオフセット0扱いにしておく（DWARF4のみ）
            gimli::UnitSectionOffset::DebugTypesOffset(_) => gimli::DebugInfoOffset(0),
        };
        Self {
            offset,
            header,
            unit: OnceCell::new(),
            lines: OnceCell::new(),
            parents: OnceCell::new(),
        }
    }

    /// .debug_info内の絶対オフセットを取得する
    pub fn offset(&self) -> gimli::DebugInfoOffset {
        self.offset
    }

    /// 単位の本体を解読して取得する
    ///
    /// 略号テーブルの読み込みを含みます。未知の単位タイプ（対応する
    /// .dwoが無い分割単位など）はここでエラーとして表面化し、この
    /// 単位に限定されます。
    pub fn load(&self, dwarf: &gimli::Dwarf<Slice>) -> Result<&gimli::Unit<Slice>> {
        self.unit.get_or_try_init(|| {
            dwarf
                .unit(self.header)
                .map_err(|e| anyhow::anyhow!("Failed to decode unit at {:#x}: {}", self.offset.0, e))
        })
    }

    /// セクション絶対オフセットを単位内オフセットに変換する
    ///
    /// オフセットが0の場合、または単位の範囲外の場合はNoneを返します。
    /// それ以外では、返されるDIEのオフセットは要求したオフセットに
    /// 一致します。
    pub fn validate_offset(&self, off: gimli::DebugInfoOffset) -> Option<gimli::UnitOffset> {
        if off.0 == 0 {
            return None;
        }
        let unit_off = off.to_unit_offset(&self.header)?;
        // ヘッダ領域を指すオフセットはDIEではない
        if unit_off.0 < self.header.size_of_header() {
            return None;
        }
        Some(unit_off)
    }

    /// 行番号マトリクスを取得する
    pub fn lines(&self, dwarf: &gimli::Dwarf<Slice>) -> Result<Option<&LineMatrix>> {
        let matrix = self.lines.get_or_try_init(|| -> Result<Option<LineMatrix>> {
            let unit = self.load(dwarf)?;
            LineMatrix::build(dwarf, unit)
        })?;
        Ok(matrix.as_ref())
    }

    /// DIEの親のオフセットを取得する
    ///
    /// 親マップは最初の問い合わせ時にDIEツリー全体を1回走査して
    /// 構築し、以降の問い合わせはマップを引くだけです。
    pub fn parent_of(
        &self,
        dwarf: &gimli::Dwarf<Slice>,
        off: gimli::UnitOffset,
    ) -> Result<Option<gimli::UnitOffset>> {
        let map = self.parents.get_or_try_init(|| -> Result<_> {
            let unit = self.load(dwarf)?;
            let mut map = HashMap::new();
            let mut stack: Vec<gimli::UnitOffset> = Vec::new();
            let mut depth: isize = 0;
            let mut entries = unit.entries();
            while let Some((delta, entry)) = entries.next_dfs()? {
                depth += delta;
                let depth = depth.max(0) as usize;
                stack.truncate(depth);
                map.insert(entry.offset(), stack.last().copied());
                stack.push(entry.offset());
            }
            Ok(map)
        })?;
        Ok(map.get(&off).copied().flatten())
    }
}
