//! トークナイザ: 入力行をトークン列に変換する。
//!
//! 対応構文はリダイレクト、パイプ、末尾の `&` のみの最小構成:
//!
//! - ワード: 空白区切り。シングル (`'...'`) / ダブル (`"..."`) クォートと
//!   バックスラッシュエスケープに対応
//! - `|` → [`Token::Pipe`]
//! - `<` / `>` → [`Token::Input`] / [`Token::Output`]
//! - `&` → [`Token::Background`]（末尾でのみ有効。位置の検証は executor 側）
//!
//! トークンの意味づけ（リダイレクト対象の解決、空ステージの検出）は
//! executor が行う。

use thiserror::Error;

/// 入力行を構成するトークン。
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Token {
    /// コマンド名・引数・リダイレクト対象になるワード。
    Word(String),
    /// `|` — パイプライン区切り。
    Pipe,
    /// `<` — 入力リダイレクト。
    Input,
    /// `>` — 出力リダイレクト。
    Output,
    /// `&` — バックグラウンド実行指示。
    Background,
}

/// 字句エラー。コマンド単位で致命的（プロンプトに戻る）。
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected EOF while looking for matching `{0}`")]
    UnterminatedQuote(char),
    #[error("trailing backslash")]
    TrailingEscape,
}

/// 入力行をトークン列に変換する。
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '<' => {
                chars.next();
                tokens.push(Token::Input);
            }
            '>' => {
                chars.next();
                tokens.push(Token::Output);
            }
            '&' => {
                chars.next();
                tokens.push(Token::Background);
            }
            _ => tokens.push(Token::Word(read_word(&mut chars)?)),
        }
    }

    Ok(tokens)
}

/// ワードを 1 つ読み取る。クォートとエスケープを解決した文字列を返す。
fn read_word(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<String, ParseError> {
    let mut word = String::new();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => break,
            '|' | '<' | '>' | '&' => break,
            '\'' | '"' => {
                chars.next();
                read_quoted(chars, ch, &mut word)?;
            }
            '\\' => {
                chars.next();
                match chars.next() {
                    Some(escaped) => word.push(escaped),
                    None => return Err(ParseError::TrailingEscape),
                }
            }
            _ => {
                chars.next();
                word.push(ch);
            }
        }
    }

    Ok(word)
}

/// 閉じクォートまで読み取って `word` に追記する。
/// ダブルクォート内では `\"` と `\\` のみエスケープとして扱う。
fn read_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
    word: &mut String,
) -> Result<(), ParseError> {
    while let Some(ch) = chars.next() {
        if ch == quote {
            return Ok(());
        }
        if quote == '"' && ch == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => word.push(next),
                Some(next) => {
                    word.push('\\');
                    word.push(next);
                }
                None => return Err(ParseError::UnterminatedQuote(quote)),
            }
            continue;
        }
        word.push(ch);
    }
    Err(ParseError::UnterminatedQuote(quote))
}

// ── Tests ───────────────────────────────────────────────────────────
