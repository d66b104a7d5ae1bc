//! シンボル解決機能

use object::{Object, ObjectSymbol};
use tsuta_elf::Image;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }
}

/// シンボル名をデマングルする
pub fn demangle(name: &str) -> String {
    // Rustのシンボルをデマングル
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }

    // C++のシンボルをデマングル
    if let Ok(sym) = cpp_demangle::Symbol::new(name) {
        if let Ok(demangled) = sym.demangle(&cpp_demangle::DemangleOptions::default()) {
            return demangled;
        }
    }

    name.to_string()
}

/// イメージのシンボルテーブル
///
/// アドレス順に整列したシンボル一覧を保持し、アドレスからの逆引きに
/// 使います。.symtabが無いストリップ済みイメージでは.dynsymに
/// フォールバックします（動的シンボルだけでも逆引きは可能です）。
pub struct SymbolTable {
    /// アドレス -> シンボル情報のマップ（ソート済み）
    by_address: Vec<Symbol>,
}

impl SymbolTable {
    /// イメージからシンボルテーブルを作成する
    ///
    /// 分離デバッグファイルがあればそちらの.symtabを優先します
    /// （ストリップ元より完全なテーブルを持つため）。
    pub fn new(image: &Image, debug_image: Option<&Image>) -> Self {
        let mut by_address = Vec::new();

        let sources = [debug_image, Some(image)];
        for source in sources.into_iter().flatten() {
            Self::collect(source.object().symbols(), &mut by_address);
            if !by_address.is_empty() {
                break;
            }
        }
        if by_address.is_empty() {
            Self::collect(image.object().dynamic_symbols(), &mut by_address);
        }

        // アドレスでソート
        by_address.sort_by_key(|s| s.address);

        Self { by_address }
    }

    fn collect<'data, 'file, I>(symbols: I, out: &mut Vec<Symbol>)
    where
        'data: 'file,
        I: Iterator<Item = object::Symbol<'data, 'file>>,
    {
        for symbol in symbols {
            if let Ok(name) = symbol.name() {
                if !name.is_empty() && symbol.address() != 0 {
                    out.push(Symbol::new(name.to_string(), symbol.address(), symbol.size()));
                }
            }
        }
    }

    /// シンボルが1つも無いかを判定する
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        // バイナリサーチで最も近いシンボルを見つける
        match self
            .by_address
            .binary_search_by_key(&addr, |s| s.address)
        {
            Ok(idx) => Some(&self.by_address[idx]),
            Err(idx) => {
                if idx > 0 {
                    let sym = &self.by_address[idx - 1];
                    // シンボルのサイズ範囲内かチェック
                    if sym.size > 0 && addr < sym.address + sym.size {
                        Some(sym)
                    } else if sym.size == 0 && addr >= sym.address {
                        // サイズ情報がない場合は単純に最も近いシンボルを返す
                        Some(sym)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        }
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.by_address.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demangle() {
        // Rustシンボル
        let d = demangle("_ZN4core3fmt5write17h1234567890abcdefE");
        assert!(d.contains("core::fmt::write"));

        // C++シンボル
        let d = demangle("_ZNSt6vectorIiSaIiEE9push_backERKi");
        assert!(d.contains("push_back"));

        // マングルされていない名前はそのまま
        assert_eq!(demangle("main"), "main");
    }

    #[test]
    fn test_reverse_resolve() {
        let mut table = SymbolTable { by_address: Vec::new() };
        table.by_address.push(Symbol::new("f".to_string(), 0x1000, 0x20));
        table.by_address.push(Symbol::new("g".to_string(), 0x1020, 0x10));
        table.by_address.push(Symbol::new("h".to_string(), 0x2000, 0));

        assert_eq!(table.reverse_resolve(0x1000).unwrap().name, "f");
        assert_eq!(table.reverse_resolve(0x101f).unwrap().name, "f");
        assert_eq!(table.reverse_resolve(0x1020).unwrap().name, "g");
        // gのサイズ範囲外、次のシンボルの手前
        assert!(table.reverse_resolve(0x1030).is_none());
        // サイズ0のシンボルは以降のアドレスをすべて受ける
        assert_eq!(table.reverse_resolve(0x3000).unwrap().name, "h");
        // 先頭より前は解決できない
        assert!(table.reverse_resolve(0x100).is_none());
    }
}
