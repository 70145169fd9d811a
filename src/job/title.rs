// 标题 / 描述占位符

use super::model::VideoSettings;
use chrono::{DateTime, Local};
use rand::seq::SliceRandom;
use std::path::Path;

/// {random_emoji} 的候选
pub const TITLE_EMOJIS: &[&str] = &["🔥", "❤️", "💯", "✨", "🎉", "👍", "💪", "🌟", "😍", "🎊"];

/// 不带扩展名的文件名
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 展开占位符
///
/// 支持 {filename} {date} {date_ymd} {date_dmy} {date_time} {random_emoji}
pub fn apply_placeholders(template: &str, file: &Path, now: DateTime<Local>) -> String {
    if template.is_empty() {
        return String::new();
    }

    let ymd = now.format("%Y-%m-%d").to_string();
    let mut text = template
        .replace("{filename}", &file_stem(file))
        .replace("{date_ymd}", &ymd)
        .replace("{date_dmy}", &now.format("%d/%m/%Y").to_string())
        .replace("{date_time}", &now.format("%Y-%m-%d %H:%M").to_string())
        .replace("{date}", &ymd);

    // 每个 {random_emoji} 单独抽取
    let mut rng = rand::thread_rng();
    while let Some(pos) = text.find("{random_emoji}") {
        let emoji = TITLE_EMOJIS.choose(&mut rng).copied().unwrap_or("🔥");
        text.replace_range(pos..pos + "{random_emoji}".len(), emoji);
    }

    text
}

/// 生成视频 / Reels 的标题与描述，空串返回 None
pub fn render_metadata(
    settings: &VideoSettings,
    file: &Path,
    now: DateTime<Local>,
) -> (Option<String>, Option<String>) {
    let title = if settings.use_filename_as_title {
        file_stem(file)
    } else {
        apply_placeholders(&settings.title_template, file, now)
    };
    let description = apply_placeholders(&settings.description_template, file, now);

    let non_empty = |s: String| {
        let trimmed = s.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };
    (non_empty(title), non_empty(description))
}
