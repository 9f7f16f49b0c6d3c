//! Monospaced tables for admin replies. Output is HTML-parse-mode safe.

use crate::chat::escape_html;

pub struct AllowedRow {
    pub principal: u64,
    pub alias: Option<String>,
    pub full_name: Option<String>,
}

fn pad(value: &str, width: usize) -> String {
    let len = value.chars().count();
    format!("{value}{}", " ".repeat(width.saturating_sub(len)))
}

fn usage_block(title: &str, rows: &[(String, i64)]) -> String {
    let name_width = rows
        .iter()
        .map(|(name, _)| name.chars().count())
        .chain([16])
        .max()
        .unwrap_or(16);
    let mut lines = vec![
        title.to_string(),
        format!("#  {}  кількість", pad("користувач", name_width)),
    ];
    for (i, (name, count)) in rows.iter().enumerate() {
        lines.push(format!(
            "{:<2} {}  {count:>5}",
            i + 1,
            escape_html(&pad(name, name_width))
        ));
    }
    lines.join("\n")
}

fn column_width(rows: &[AllowedRow], cell: impl Fn(&AllowedRow) -> usize) -> usize {
    rows.iter().map(cell).chain([8]).max().unwrap_or(8)
}

pub fn usage_tables(daily: &[(String, i64)], weekly: &[(String, i64)]) -> String {
    format!(
        "{}\n\n{}",
        usage_block("📊 Статистика — Останні 24 години", daily),
        usage_block("📈 Статистика — Останні 7 днів", weekly)
    )
}

pub fn allowed_users(rows: &[AllowedRow]) -> String {
    let id_width = column_width(rows, |r| r.principal.to_string().len());
    let nick_width = column_width(rows, |r| r.alias.as_deref().unwrap_or("-").chars().count());
    let name_width = column_width(rows, |r| r.full_name.as_deref().unwrap_or("-").chars().count());

    let mut lines = vec![
        "Дозволені користувачі".to_string(),
        format!(
            "#  {}  {}  {}",
            pad("id", id_width),
            pad("нік", nick_width),
            pad("імʼя", name_width)
        ),
    ];
    for (i, row) in rows.iter().enumerate() {
        let id = row.principal.to_string();
        lines.push(format!(
            "{:<2} <code>{id}</code>{}  {}  {}",
            i + 1,
            " ".repeat(id_width.saturating_sub(id.len())),
            escape_html(&pad(row.alias.as_deref().unwrap_or("-"), nick_width)),
            escape_html(&pad(row.full_name.as_deref().unwrap_or("-"), name_width)),
        ));
    }
    lines.join("\n")
}
