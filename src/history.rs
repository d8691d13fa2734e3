//! コマンド履歴。
//!
//! `$HOME/.jsh_history` にプレーンテキスト（1 行 1 コマンド）で永続化する。
//! ナビゲーションは `cursor` で表現し、`None` が「履歴の外＝編集中の行」。
//! ↑で初めて履歴に入るとき、編集中の行を `stash` に退避しておき、
//! ↓で末尾を越えたら復元する。

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// 保持する最大エントリ数。超過分は古い順に捨てる。
const MAX_ENTRIES: usize = 1000;

/// コマンド履歴。エントリ列とナビゲーション状態を持つ。
pub struct History {
    /// 古い順のエントリ。
    entries: Vec<String>,
    /// ナビゲーション位置。`None` は履歴の外（編集中の行）。
    cursor: Option<usize>,
    /// 履歴に入る直前の編集中テキスト。
    stash: String,
    /// 永続化先。`None` ならメモリのみ（テスト用）。
    path: Option<PathBuf>,
}

impl History {
    /// `$HOME/.jsh_history` を読み込んで作る。`$HOME` 未設定なら永続化なし。
    pub fn new() -> Self {
        let path = std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".jsh_history"));
        Self::with_file(path)
    }

    /// 指定ファイルを履歴として読み込む。
    pub fn with_file(path: Option<PathBuf>) -> Self {
        let mut entries = Vec::new();
        if let Some(path) = &path {
            if let Ok(text) = fs::read_to_string(path) {
                entries.extend(text.lines().filter(|l| !l.is_empty()).map(String::from));
            }
        }
        if entries.len() > MAX_ENTRIES {
            entries.drain(..entries.len() - MAX_ENTRIES);
        }
        Self {
            entries,
            cursor: None,
            stash: String::new(),
            path,
        }
    }

    /// エントリを追加してファイルに追記する。空行と直前の重複はスキップ。
    pub fn add(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || self.entries.last().is_some_and(|last| last == line) {
            return;
        }
        self.entries.push(line.to_string());
        if self.entries.len() > MAX_ENTRIES {
            self.entries.remove(0);
        }
        if let Some(path) = &self.path {
            let appended = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{line}"));
            if let Err(e) = appended {
                tracing::debug!(error = %e, "history append failed");
            }
        }
    }

    /// ナビゲーション状態を破棄する。`read_line` の開始時に呼ぶ。
    pub fn reset(&mut self) {
        self.cursor = None;
        self.stash.clear();
    }

    /// ↑: 一つ古いエントリへ。初回は編集中の行を退避する。
    /// 先頭に達していれば `None`。
    pub fn prev(&mut self, current: &str) -> Option<String> {
        let index = match self.cursor {
            None => {
                if self.entries.is_empty() {
                    return None;
                }
                self.stash = current.to_string();
                self.entries.len() - 1
            }
            Some(0) => return None,
            Some(i) => i - 1,
        };
        self.cursor = Some(index);
        Some(self.entries[index].clone())
    }

    /// ↓: 一つ新しいエントリへ。末尾を越えたら退避した行を復元する。
    /// 履歴の外にいるときは `None`。
    pub fn next(&mut self) -> Option<String> {
        let index = self.cursor?;
        if index + 1 >= self.entries.len() {
            self.cursor = None;
            return Some(std::mem::take(&mut self.stash));
        }
        self.cursor = Some(index + 1);
        Some(self.entries[index + 1].clone())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn history(entries: &[&str]) -> History {
        let mut h = History::with_file(None);
        for e in entries {
            h.add(e);
        }
        h
    }

    #[test]
    fn prev_walks_backwards_and_stops() {
        let mut h = history(&["one", "two", "three"]);
        assert_eq!(h.prev("draft").as_deref(), Some("three"));
        assert_eq!(h.prev("draft").as_deref(), Some("two"));
        assert_eq!(h.prev("draft").as_deref(), Some("one"));
        assert_eq!(h.prev("draft"), None);
    }

    #[test]
    fn next_restores_the_draft_line() {
        let mut h = history(&["one", "two"]);
        h.prev("draft");
        h.prev("draft");
        assert_eq!(h.next().as_deref(), Some("two"));
        assert_eq!(h.next().as_deref(), Some("draft"));
        // 履歴の外に戻ったら次の ↓ は何もしない
        assert_eq!(h.next(), None);
    }

    #[test]
    fn next_outside_history_is_noop() {
        let mut h = history(&["one"]);
        assert_eq!(h.next(), None);
    }

    #[test]
    fn add_skips_empty_and_consecutive_duplicates() {
        let mut h = history(&[]);
        h.add("");
        h.add("   ");
        h.add("echo a");
        h.add("echo a");
        h.add("echo b");
        h.add("echo a");
        assert_eq!(h.entries, vec!["echo a", "echo b", "echo a"]);
    }

    #[test]
    fn reset_leaves_navigation() {
        let mut h = history(&["one", "two"]);
        h.prev("draft");
        h.reset();
        // reset 後の ↑ は再び末尾から
        assert_eq!(h.prev("x").as_deref(), Some("two"));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");
        {
            let mut h = History::with_file(Some(path.clone()));
            h.add("echo persisted");
            h.add("pwd");
        }
        let h = History::with_file(Some(path));
        assert_eq!(h.entries, vec!["echo persisted", "pwd"]);
    }
}
