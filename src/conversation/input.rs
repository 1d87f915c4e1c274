use chrono::{Datelike, NaiveDate};

use crate::model::Language;

use super::Rejection;

/// Map Arabic-Indic (U+0660..U+0669) and Extended Arabic-Indic
/// (U+06F0..U+06F9) digits to ASCII. Everything else passes through.
pub fn normalize_digits(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            _ => c,
        })
        .collect()
}

/// Trimmed, ASCII digits, lowercase, inner whitespace collapsed.
pub fn normalize(text: &str) -> String {
    normalize_digits(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCommand {
    Menu,
    Cancel,
    Restart,
}

const MENU_TOKENS: &[&str] = &["menu", "main menu", "القائمة", "قائمة", "القائمة الرئيسية"];
const CANCEL_TOKENS: &[&str] = &["cancel", "stop", "إلغاء", "الغاء", "توقف"];
const RESTART_TOKENS: &[&str] = &["restart", "start over", "إعادة", "اعادة", "ابدأ من جديد"];
const SKIP_TOKENS: &[&str] = &["skip", "no", "-", "تخطي", "لا"];

/// Commands honoured at every step, ahead of step-specific parsing.
pub fn global_command(text: &str) -> Option<GlobalCommand> {
    let norm = normalize(text);
    if MENU_TOKENS.contains(&norm.as_str()) {
        Some(GlobalCommand::Menu)
    } else if CANCEL_TOKENS.contains(&norm.as_str()) {
        Some(GlobalCommand::Cancel)
    } else if RESTART_TOKENS.contains(&norm.as_str()) {
        Some(GlobalCommand::Restart)
    } else {
        None
    }
}

/// Parse a 1-based choice among `count` options into a 0-based index.
/// A trailing `.` or `)` is tolerated ("2." and "2)" both select 2).
pub fn parse_selection(text: &str, count: usize) -> Result<usize, Rejection> {
    let norm = normalize(text);
    let digits = norm.trim_end_matches(['.', ')']).trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Rejection::NotANumber);
    }
    match digits.parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Ok(n - 1),
        _ => Err(Rejection::OutOfRange { max: count }),
    }
}

pub fn is_skip(text: &str) -> bool {
    SKIP_TOKENS.contains(&normalize(text).as_str())
}

pub fn parse_language(text: &str) -> Option<Language> {
    match normalize(text).as_str() {
        "1" | "english" | "en" | "الإنجليزية" | "انجليزي" => Some(Language::English),
        "2" | "arabic" | "ar" | "العربية" | "عربي" => Some(Language::Arabic),
        _ => None,
    }
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and `DD/MM`, with `-`, `/` or `.` as
/// separator. `DD/MM` means this year, or next year when the month has
/// already gone by.
pub fn parse_date(text: &str, today: NaiveDate) -> Result<NaiveDate, Rejection> {
    let norm = normalize_digits(text.trim());
    let parts: Vec<&str> = norm.split(['-', '/', '.']).map(str::trim).collect();
    if parts
        .iter()
        .any(|p| p.is_empty() || p.len() > 4 || !p.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(Rejection::DateFormat);
    }
    let num = |s: &str| s.parse::<u32>().map_err(|_| Rejection::DateFormat);
    let ymd = |y: i32, m: u32, d: u32| {
        NaiveDate::from_ymd_opt(y, m, d).ok_or(Rejection::DateFormat)
    };

    match parts.as_slice() {
        [y, m, d] if y.len() == 4 => ymd(num(y)? as i32, num(m)?, num(d)?),
        [d, m, y] if y.len() == 4 => ymd(num(y)? as i32, num(m)?, num(d)?),
        [d, m] if d.len() <= 2 && m.len() <= 2 => {
            let (d, m) = (num(d)?, num(m)?);
            let year = if m < today.month() {
                today.year() + 1
            } else {
                today.year()
            };
            ymd(year, m, d)
        }
        _ => Err(Rejection::DateFormat),
    }
}
