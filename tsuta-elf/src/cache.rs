//! イメージキャッシュ機能

use crate::debug_link;
use crate::image::Image;
use crate::Result;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// キャッシュと分離デバッグ解決の設定
///
/// パス書き換えや追加デバッグディレクトリはグローバル変数ではなく
/// この設定レコードとしてコンストラクタに渡します。
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// デバッグファイルを探す追加ディレクトリ
    pub debug_dirs: Vec<PathBuf>,
    /// 記録されたパスを解決する際の書き換え規則（from -> to）
    pub path_rewrites: Vec<(String, String)>,
    /// 分離デバッグファイルを読み込むかどうか
    pub load_external_debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debug_dirs: vec![PathBuf::from("/usr/lib/debug")],
            path_rewrites: Vec::new(),
            load_external_debug: true,
        }
    }
}

/// プロセス全体で共有するELFイメージのキャッシュ
///
/// 正規化パスをキーに、同じファイルの解析を一度に抑えます。
/// 同一パスへの同時アクセスはエントリごとのOnceCellで直列化される
/// ため（single-flight）、並行な`image_for_path`は安全です。
pub struct ImageCache {
    config: CacheConfig,
    images: Mutex<HashMap<PathBuf, Arc<OnceCell<Arc<Image>>>>>,
    /// build-id -> デバッグ情報を持つイメージ の二次索引
    by_build_id: Mutex<HashMap<Vec<u8>, Arc<Image>>>,
}

impl ImageCache {
    /// 設定を指定してキャッシュを作成する
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            images: Mutex::new(HashMap::new()),
            by_build_id: Mutex::new(HashMap::new()),
        }
    }

    /// デバッグディレクトリの一覧を取得する
    pub fn debug_dirs(&self) -> &[PathBuf] {
        &self.config.debug_dirs
    }

    /// 記録されたパスに書き換え規則を適用する
    ///
    /// コアダンプやリンクマップに記録された絶対パスを、ローカルの
    /// ファイルシステム上のパスへ変換します。最初に前方一致した規則
    /// だけを適用します。
    pub fn rewrite_path(&self, recorded: &str) -> PathBuf {
        for (from, to) in &self.config.path_rewrites {
            if let Some(rest) = recorded.strip_prefix(from.as_str()) {
                return PathBuf::from(format!("{}{}", to, rest));
            }
        }
        PathBuf::from(recorded)
    }

    /// パスからイメージを取得する（必要なら解析する）
    pub fn image_for_path<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Image>> {
        let path = path.as_ref();
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let cell = {
            let mut images = self.images.lock().unwrap();
            images
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let image = cell
            .get_or_try_init(|| -> Result<Arc<Image>> {
                tracing::debug!("loading image {:?}", key);
                let image = Arc::new(Image::open(&key)?);
                self.index_build_id(&image);
                Ok(image)
            })?
            .clone();
        Ok(image)
    }

    /// 記録されたパスを書き換えてからイメージを取得する
    pub fn image_for_recorded_path(&self, recorded: &str) -> Result<Arc<Image>> {
        self.image_for_path(self.rewrite_path(recorded))
    }

    /// イメージの分離デバッグファイルを解決する
    ///
    /// build-id索引にヒットすれば解析済みのデバッグイメージを
    /// そのまま返し、ディレクトリ検索を省略します。
    pub fn debug_image_for(&self, image: &Image) -> Option<Arc<Image>> {
        if !self.config.load_external_debug {
            return None;
        }
        if let Some(id) = image.build_id() {
            let index = self.by_build_id.lock().unwrap();
            if let Some(found) = index.get(id) {
                if found.path() != image.path() {
                    return Some(found.clone());
                }
            }
        }
        debug_link::find_debug_image(image, self)
    }

    fn index_build_id(&self, image: &Arc<Image>) {
        if !debug_link::has_debug_info(image) {
            return;
        }
        if let Some(id) = image.build_id() {
            self.by_build_id
                .lock()
                .unwrap()
                .entry(id.to_vec())
                .or_insert_with(|| image.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_path() {
        let cache = ImageCache::new(CacheConfig {
            path_rewrites: vec![("/build/root".to_string(), "/srv/images".to_string())],
            ..Default::default()
        });
        assert_eq!(
            cache.rewrite_path("/build/root/usr/lib/libfoo.so"),
            PathBuf::from("/srv/images/usr/lib/libfoo.so")
        );
        assert_eq!(
            cache.rewrite_path("/usr/lib/libbar.so"),
            PathBuf::from("/usr/lib/libbar.so")
        );
    }

    #[test]
    fn test_same_path_parsed_once() {
        let cache = ImageCache::new(CacheConfig::default());
        let exe = std::env::current_exe().unwrap();
        let a = cache.image_for_path(&exe).unwrap();
        let b = cache.image_for_path(&exe).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
