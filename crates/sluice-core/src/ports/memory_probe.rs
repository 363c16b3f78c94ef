//! MemoryProbe port - プロセスのメモリ使用量の取得と解放要求
//!
//! Rust には GC が無いので、`reclaim` は埋め込み側が
//! キャッシュの縮小などに繋ぐフックです。

/// `ResourceMonitor` が使うメモリ計測の抽象化
pub trait MemoryProbe: Send + Sync {
    /// 現在の使用量（bytes）
    fn used_bytes(&self) -> u64;

    /// 解放要求。既定では何もしない。
    fn reclaim(&self) {}
}
