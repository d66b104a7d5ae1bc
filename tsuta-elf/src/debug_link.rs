//! 分離デバッグファイルの解決機能
//!
//! ストリップされたバイナリの`.gnu_debuglink`とbuild-idを手がかりに、
//! DWARF情報を持つ分離デバッグファイルを探します。

use crate::cache::ImageCache;
use crate::image::Image;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// イメージがデバッグ情報を持っているかを判定する
pub fn has_debug_info(image: &Image) -> bool {
    image.has_section(".debug_info") || image.has_section(".zdebug_info")
}

/// イメージの分離デバッグファイルを探す
///
/// 検索順序:
/// 1. 元のファイルと同じディレクトリ
/// 2. 隣接する`.debug/`ディレクトリ
/// 3. 設定された各デバッグディレクトリ（元のパスを付加した位置と
///    `.build-id/xx/yyyy…`レイアウトの両方）
///
/// build-idが分かっている場合はbuild-idの一致、そうでなければ
/// debuglinkのCRC32の一致で採用します。見つからなくても致命的では
/// なく、イメージはシンボルテーブルだけで利用を続けられます。
pub fn find_debug_image(image: &Image, cache: &ImageCache) -> Option<Arc<Image>> {
    if has_debug_info(image) {
        return None;
    }

    let debuglink = image.gnu_debuglink();
    let build_id = image.build_id();

    for candidate in candidate_paths(image, debuglink.as_ref(), build_id, cache) {
        match verify_candidate(&candidate, build_id, debuglink.as_ref().map(|d| d.1), cache) {
            Some(found) => {
                tracing::debug!(
                    "resolved debug info for {:?} at {:?}",
                    image.path(),
                    candidate
                );
                return Some(found);
            }
            None => continue,
        }
    }

    tracing::debug!("no separate debug info found for {:?}", image.path());
    None
}

fn candidate_paths(
    image: &Image,
    debuglink: Option<&(String, u32)>,
    build_id: Option<&[u8]>,
    cache: &ImageCache,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    let dir = image.path().parent().unwrap_or_else(|| Path::new("."));

    // build-idレイアウト: <debugdir>/.build-id/xx/yyyy....debug
    if let Some(id) = build_id {
        if id.len() > 1 {
            let head = format!("{:02x}", id[0]);
            let tail: String = id[1..].iter().map(|b| format!("{:02x}", b)).collect();
            for debug_dir in cache.debug_dirs() {
                candidates.push(
                    debug_dir
                        .join(".build-id")
                        .join(&head)
                        .join(format!("{}.debug", tail)),
                );
            }
        }
    }

    if let Some((name, _)) = debuglink {
        let name = Path::new(name);
        candidates.push(dir.join(name));
        candidates.push(dir.join(".debug").join(name));
        for debug_dir in cache.debug_dirs() {
            // 元のディレクトリパスをデバッグディレクトリの下に再現した位置
            let relative = dir.strip_prefix("/").unwrap_or(dir);
            candidates.push(debug_dir.join(relative).join(name));
        }
    }

    candidates
}

fn verify_candidate(
    path: &Path,
    build_id: Option<&[u8]>,
    crc: Option<u32>,
    cache: &ImageCache,
) -> Option<Arc<Image>> {
    if !path.is_file() {
        return None;
    }

    // build-idが分かっていれば一致を要求する
    if let Some(expected) = build_id {
        let candidate = cache.image_for_path(path).ok()?;
        if candidate.build_id() == Some(expected) && has_debug_info(&candidate) {
            return Some(candidate);
        }
        return None;
    }

    // build-id不明時はdebuglinkのCRC32で照合する
    if let Some(expected_crc) = crc {
        let contents = fs::read(path).ok()?;
        if crc32fast::hash(&contents) != expected_crc {
            tracing::debug!("debuglink CRC mismatch for {:?}", path);
            return None;
        }
        let candidate = cache.image_for_path(path).ok()?;
        if has_debug_info(&candidate) {
            return Some(candidate);
        }
    }
    None
}
