//! スタック収集のオプション

/// スタック収集の振る舞いを決めるオプション
///
/// コンストラクタ経由で明示的に引き回します（グローバル状態には
/// 置きません）。イメージ解決側の設定はtsuta_elf::CacheConfigが
/// 受け持ちます。
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// 1スレッドあたりのフレーム数の上限
    pub max_frames: usize,
    /// 関数引数の値の解読を試みる
    pub do_args: bool,
    /// ソースファイル・行番号の解決を省略する
    pub no_src: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_frames: 1024,
            do_args: false,
            no_src: false,
        }
    }
}
