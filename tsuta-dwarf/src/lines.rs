//! 行番号マトリクス機能

use crate::info::Slice;
use crate::Result;

/// 行番号マトリクスの1行
///
/// 行番号プログラムの状態機械が出力した1レコード。fileは
/// `LineMatrix::files`へのインデックスです。
#[derive(Debug, Clone, Copy)]
pub struct LineRow {
    pub address: u64,
    pub file: u64,
    pub line: u32,
    pub column: u32,
    pub is_stmt: bool,
    pub end_sequence: bool,
}

/// 1つのコンパイル単位の行番号マトリクス
///
/// 行番号プログラムを最後まで評価した結果をアドレス順に整列して
/// 保持します。非終端行r[i]と後続行r[i+1]について、半開区間
/// [r[i].address, r[i+1].address) が (r[i].file, r[i].line) に
/// 対応します。
#[derive(Debug)]
pub struct LineMatrix {
    rows: Vec<LineRow>,
    files: Vec<String>,
}

impl LineMatrix {
    /// 単位の行番号プログラムを評価してマトリクスを構築する
    ///
    /// DWARF 2〜5の標準・拡張・特殊オペコードはgimliの状態機械が
    /// 処理します。end_sequence行しか無いプログラムは空のマトリクスに
    /// なります。
    pub fn build(
        dwarf: &gimli::Dwarf<Slice>,
        unit: &gimli::Unit<Slice>,
    ) -> Result<Option<LineMatrix>> {
        let Some(program) = unit.line_program.clone() else {
            return Ok(None);
        };

        let files = render_files(dwarf, unit, program.header())?;

        let mut rows = Vec::new();
        let mut sm = program.rows();
        loop {
            match sm.next_row() {
                Ok(Some((_, row))) => {
                    rows.push(LineRow {
                        address: row.address(),
                        file: row.file_index(),
                        line: row.line().map(|l| l.get() as u32).unwrap_or(0),
                        column: match row.column() {
                            gimli::ColumnType::LeftEdge => 0,
                            gimli::ColumnType::Column(c) => c.get() as u32,
                        },
                        is_stmt: row.is_stmt(),
                        end_sequence: row.end_sequence(),
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    // 切り詰められた行番号プログラムはそこまでの行で打ち切る
                    tracing::debug!("truncated line program: {}", e);
                    break;
                }
            }
        }

        if rows.iter().all(|r| r.end_sequence) {
            rows.clear();
        }

        // 二分探索のためアドレス順に整列する。同一アドレスでは
        // 終端行を先に置き、直後に始まる新しいシーケンスの行が
        // 探索で選ばれるようにする。
        rows.sort_by_key(|r| (r.address, !r.end_sequence));

        Ok(Some(LineMatrix { rows, files }))
    }

    /// マトリクスの行一覧を取得する
    pub fn rows(&self) -> &[LineRow] {
        &self.rows
    }

    /// ファイルインデックスからファイルパスを取得する
    pub fn file(&self, index: u64) -> Option<&str> {
        self.files
            .get(index as usize)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    /// アドレスから（ファイル, 行, 桁）を取得する
    ///
    /// アドレスを含む半開区間の行を二分探索で見つけます。区間が
    /// end_sequence行に属する場合（シーケンスの切れ目）はNoneです。
    pub fn source_from_addr(&self, addr: u64) -> Option<(&str, u32, u32)> {
        let idx = self.rows.partition_point(|r| r.address <= addr);
        if idx == 0 || idx >= self.rows.len() {
            // 後続行が無い範囲はどの区間にも属さない
            return None;
        }
        let row = &self.rows[idx - 1];
        if row.end_sequence {
            return None;
        }
        Some((self.file(row.file)?, row.line, row.column))
    }
}

/// 行番号プログラムヘッダのファイルテーブルを文字列に展開する
///
/// DWARF 5はインデックス0から、DWARF 4以前は1から数えるため、
/// 旧形式ではインデックス0に空エントリを置いて番号を揃えます。
fn render_files(
    dwarf: &gimli::Dwarf<Slice>,
    unit: &gimli::Unit<Slice>,
    header: &gimli::LineProgramHeader<Slice>,
) -> Result<Vec<String>> {
    let mut files = Vec::with_capacity(header.file_names().len() + 1);
    if header.version() < 5 {
        files.push(String::new());
    }

    let comp_dir = unit
        .comp_dir
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();

    for file in header.file_names() {
        let mut path = String::new();

        if let Some(dir) = file.directory(header) {
            if let Ok(dir) = dwarf.attr_string(unit, dir) {
                let dir = dir.to_string_lossy();
                if !dir.starts_with('/') && !comp_dir.is_empty() {
                    path.push_str(&comp_dir);
                    push_path_component(&mut path, &dir);
                } else {
                    path.push_str(&dir);
                }
            }
        }
        if path.is_empty() && !comp_dir.is_empty() {
            path.push_str(&comp_dir);
        }

        match dwarf.attr_string(unit, file.path_name()) {
            Ok(name) => push_path_component(&mut path, &name.to_string_lossy()),
            Err(_) => path.clear(),
        }

        files.push(path);
    }
    Ok(files)
}

fn push_path_component(path: &mut String, component: &str) {
    if component.starts_with('/') || path.is_empty() {
        path.clear();
        path.push_str(component);
    } else {
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<LineRow>) -> LineMatrix {
        LineMatrix {
            rows,
            files: vec![String::new(), "src/main.c".to_string()],
        }
    }

    fn row(address: u64, line: u32, end_sequence: bool) -> LineRow {
        LineRow {
            address,
            file: 1,
            line,
            column: 0,
            is_stmt: true,
            end_sequence,
        }
    }

    #[test]
    fn test_half_open_intervals() {
        let m = matrix(vec![
            row(0x1000, 10, false),
            row(0x1010, 11, false),
            row(0x1020, 0, true),
        ]);

        // [0x1000, 0x1010) は行10に対応する
        assert_eq!(m.source_from_addr(0x1000).unwrap().1, 10);
        assert_eq!(m.source_from_addr(0x100f).unwrap().1, 10);
        assert_eq!(m.source_from_addr(0x1010).unwrap().1, 11);
        assert_eq!(m.source_from_addr(0x101f).unwrap().1, 11);

        // マトリクスが覆わないアドレスはNone
        assert!(m.source_from_addr(0xfff).is_none());
        assert!(m.source_from_addr(0x1020).is_none());
        assert!(m.source_from_addr(0x2000).is_none());
    }

    #[test]
    fn test_gap_between_sequences() {
        // 終端行とその直後に始まる新しいシーケンス
        let mut rows = vec![
            row(0x1000, 10, false),
            row(0x1010, 0, true),
            row(0x1010, 20, false),
            row(0x1020, 0, true),
        ];
        rows.sort_by_key(|r| (r.address, !r.end_sequence));
        let m = matrix(rows);

        // 境界アドレスは新しいシーケンスの行に解決される
        assert_eq!(m.source_from_addr(0x1010).unwrap().1, 20);
        assert_eq!(m.source_from_addr(0x1008).unwrap().1, 10);
        assert!(m.source_from_addr(0x1020).is_none());
    }
}
