// 调度时间计算
//
// - 固定间隔：now + interval，可选 ±jitter% 抖动
// - 智能调度：按模板里的 {times, days} 取下一个时间点，找不到时回退到间隔

use super::model::{clamp_interval, ScheduleSettings};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime, TimeZone,
    Timelike, Utc, Weekday,
};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 抖动百分比上限
pub const MAX_JITTER_PERCENT: u32 = 50;

/// 智能调度模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTemplate {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// "HH:MM" 列表
    #[serde(default)]
    pub times: Vec<String>,
    /// 允许的星期，空表示每天
    #[serde(default)]
    pub days: Vec<String>,
}

/// 模板来源（外部协作方）
pub trait ScheduleTemplates: Send + Sync {
    fn template(&self, id: i64) -> Option<ScheduleTemplate>;
}

/// 内存模板表
#[derive(Debug, Default)]
pub struct InMemoryTemplates {
    templates: DashMap<i64, ScheduleTemplate>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, template: ScheduleTemplate) {
        self.templates.insert(template.id, template);
    }

    pub fn remove(&self, id: i64) -> Option<ScheduleTemplate> {
        self.templates.remove(&id).map(|(_, t)| t)
    }
}

impl ScheduleTemplates for InMemoryTemplates {
    fn template(&self, id: i64) -> Option<ScheduleTemplate> {
        self.templates.get(&id).map(|t| t.clone())
    }
}

/// 星期名解析，接受缩写和全称
pub fn weekday_from_name(name: &str) -> Option<Weekday> {
    match name.trim().to_ascii_lowercase().as_str() {
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        _ => None,
    }
}

/// 解析 "H:MM" / "HH:MM"（允许带秒），非法返回 None
pub fn normalize_time(value: &str) -> Option<NaiveTime> {
    let mut parts = value.trim().split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next()?.trim().parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// 根据时间列表和星期列表计算下一个运行时间（本地时间）
///
/// 今天允许且有晚于当前分钟的时间点时取今天；
/// 否则取 7 天内下一个允许日的最早时间点
pub fn next_run_from_times(
    times: &[String],
    days: &[String],
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    let mut allowed: Vec<Weekday> = days.iter().filter_map(|d| weekday_from_name(d)).collect();
    allowed.dedup();
    if allowed.is_empty() {
        return None;
    }

    let mut slots: Vec<NaiveTime> = times.iter().filter_map(|t| normalize_time(t)).collect();
    slots.sort();
    slots.dedup();
    let first = *slots.first()?;

    // 按分钟比较，同一分钟内不算"晚于"
    let current_minute = NaiveTime::from_hms_opt(reference.hour(), reference.minute(), 0)?;

    let today = reference.date();
    if allowed.contains(&today.weekday()) {
        if let Some(slot) = slots.iter().find(|slot| **slot > current_minute) {
            return Some(today.and_time(*slot));
        }
    }

    (1..=7)
        .map(|offset| today + ChronoDuration::days(offset))
        .find(|date| allowed.contains(&date.weekday()))
        .map(|date| date.and_time(first))
}

/// 按模板计算；模板的 days 为空时视为每天
pub fn next_run_from_template(
    template: &ScheduleTemplate,
    reference: NaiveDateTime,
) -> Option<NaiveDateTime> {
    if template.days.is_empty() {
        let all: Vec<String> = ["sat", "sun", "mon", "tue", "wed", "thu", "fri"]
            .iter()
            .map(|d| d.to_string())
            .collect();
        next_run_from_times(&template.times, &all, reference)
    } else {
        next_run_from_times(&template.times, &template.days, reference)
    }
}

/// `now` 之后 `secs` 秒（不超过间隔上限），超出时间范围时取最大时间
pub fn after_secs(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = clamp_interval(secs);
    now.checked_add_signed(ChronoDuration::seconds(secs as i64))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// 对间隔施加 ±percent% 的均匀抖动，结果至少 1 秒
pub fn apply_jitter(interval_secs: u64, percent: u32) -> u64 {
    let interval_secs = interval_secs.max(1);
    let percent = percent.min(MAX_JITTER_PERCENT);
    let delta = (interval_secs as u128 * percent as u128 / 100) as i64;
    if delta == 0 {
        return interval_secs;
    }

    let offset = rand::thread_rng().gen_range(-delta..=delta);
    (interval_secs as i64 + offset).max(1) as u64
}

/// 计算下一次运行的墙钟时间
///
/// # 参数
/// * `settings` - 任务的调度设置
/// * `templates` - 智能调度模板来源
/// * `now` - 当前时间
///
/// # 返回
/// 严格晚于 `now` 的时间点
pub fn compute_next_run(
    settings: &ScheduleSettings,
    templates: &dyn ScheduleTemplates,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    if settings.use_smart_schedule {
        if let Some(next) = smart_next_run(settings, templates, now) {
            return next;
        }
        debug!("智能调度无可用时间点，回退到固定间隔");
    }

    let secs = if settings.jitter_enabled {
        apply_jitter(settings.interval_seconds, settings.jitter_percent)
    } else {
        settings.interval_seconds
    };
    after_secs(now, secs)
}

fn smart_next_run(
    settings: &ScheduleSettings,
    templates: &dyn ScheduleTemplates,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let Some(template_id) = settings.template_id else {
        warn!("启用了智能调度但没有模板 ID");
        return None;
    };
    let Some(template) = templates.template(template_id) else {
        warn!("智能调度模板不存在: {}", template_id);
        return None;
    };

    let local_now = now.with_timezone(&Local).naive_local();
    let naive = next_run_from_template(&template, local_now)?;
    // 夏令时跳变导致本地时间不存在时取 None
    let next = Local.from_local_datetime(&naive).earliest()?.with_timezone(&Utc);
    (next > now).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::model::MAX_INTERVAL_SECS;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 30)
            .unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_next_time_today() {
        // 2025-01-06 是星期一
        let reference = at(2025, 1, 6, 9, 15);
        let next = next_run_from_times(
            &strings(&["18:00", "8:00", "12:00"]),
            &strings(&["mon"]),
            reference,
        )
        .unwrap();
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2025, 1, 6).unwrap().and_hms_opt(12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_same_minute_is_not_later() {
        let reference = at(2025, 1, 6, 12, 0);
        let next = next_run_from_times(&strings(&["12:00"]), &strings(&["mon", "tue"]), reference)
            .unwrap();
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2025, 1, 7).unwrap());
    }

    #[test]
    fn test_skips_to_next_allowed_day() {
        // 星期一 20:00 之后，只允许星期五
        let reference = at(2025, 1, 6, 20, 0);
        let next = next_run_from_times(&strings(&["08:00", "bad", "25:00"]), &strings(&["Friday"]), reference)
            .unwrap();
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2025, 1, 10).unwrap());
        assert_eq!(next.time(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn test_same_weekday_next_week() {
        let reference = at(2025, 1, 6, 23, 0);
        let next = next_run_from_times(&strings(&["08:00"]), &strings(&["mon"]), reference).unwrap();
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2025, 1, 13).unwrap());
    }

    #[test]
    fn test_invalid_inputs() {
        let reference = at(2025, 1, 6, 9, 0);
        assert!(next_run_from_times(&[], &strings(&["mon"]), reference).is_none());
        assert!(next_run_from_times(&strings(&["08:00"]), &strings(&["noday"]), reference).is_none());
        assert!(next_run_from_times(&strings(&["x"]), &strings(&["mon"]), reference).is_none());
    }

    #[test]
    fn test_template_empty_days_means_every_day() {
        let template = ScheduleTemplate {
            id: 1,
            name: "t".into(),
            times: strings(&["07:30"]),
            days: vec![],
        };
        let next = next_run_from_template(&template, at(2025, 1, 6, 9, 0)).unwrap();
        assert_eq!(next.date(), NaiveDate::from_ymd_opt(2025, 1, 7).unwrap());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..200 {
            let v = apply_jitter(1000, 10);
            assert!((900..=1100).contains(&v));
        }
        for _ in 0..50 {
            let v = apply_jitter(100, 90);
            assert!((50..=150).contains(&v));
        }
        assert_eq!(apply_jitter(0, 0), 1);
    }

    #[test]
    fn test_compute_next_run_interval_and_fallback() {
        let templates = InMemoryTemplates::new();
        let now = Utc::now();

        let settings = ScheduleSettings::with_interval(60);
        assert_eq!(compute_next_run(&settings, &templates, now), now + ChronoDuration::seconds(60));

        // 模板缺失时回退到间隔
        let smart = ScheduleSettings {
            use_smart_schedule: true,
            template_id: Some(7),
            ..ScheduleSettings::with_interval(120)
        };
        assert_eq!(compute_next_run(&smart, &templates, now), now + ChronoDuration::seconds(120));
    }

    #[test]
    fn test_compute_next_run_smart_is_in_future() {
        let templates = InMemoryTemplates::new();
        templates.insert(ScheduleTemplate {
            id: 3,
            name: "daily".into(),
            times: strings(&["00:00", "06:00", "12:00", "18:00"]),
            days: vec![],
        });
        let settings = ScheduleSettings {
            use_smart_schedule: true,
            template_id: Some(3),
            ..ScheduleSettings::with_interval(3600)
        };
        let now = Utc::now();
        let next = compute_next_run(&settings, &templates, now);
        assert!(next > now);
        assert!(next <= now + ChronoDuration::hours(7));
    }

    #[test]
    fn test_compute_next_run_huge_interval_is_capped() {
        let templates = InMemoryTemplates::new();
        let settings = ScheduleSettings {
            interval_seconds: u64::MAX,
            ..ScheduleSettings::default()
        };
        let now = Utc::now();
        let next = compute_next_run(&settings, &templates, now);
        assert_eq!(next, now + ChronoDuration::seconds(MAX_INTERVAL_SECS as i64));

        let jittered = ScheduleSettings {
            interval_seconds: 10_000_000_000_000,
            jitter_enabled: true,
            jitter_percent: 50,
            ..ScheduleSettings::default()
        };
        let next = compute_next_run(&jittered, &templates, now);
        assert!(next > now);
        assert!(next <= now + ChronoDuration::seconds(MAX_INTERVAL_SECS as i64));
    }

    #[test]
    fn test_after_secs_saturates_at_max_time() {
        let near_end = DateTime::<Utc>::MAX_UTC - ChronoDuration::seconds(10);
        assert_eq!(after_secs(near_end, 3600), DateTime::<Utc>::MAX_UTC);
    }
}
