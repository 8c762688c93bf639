//! 应用层日志: 控制台与按天滚动的文件输出.
//!
//! 解码库通过 `log` 门面输出, 这里初始化的 tracing 订阅器会同时接收 `log` 记录.

use anyhow::{Context, Result};
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// 解码单元日志使用的 tracing target
pub const UNIT_LOG_TARGET: &str = "avc_engine::unit";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// 文件日志级别, `EnvFilter` 语法
    pub level: String,
    pub directory: String,
    pub file_prefix: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_true")]
    pub console: bool,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    30
}

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// 初始化全局日志订阅器, 每个进程只能成功一次
pub fn init(config: LoggingConfig) -> Result<()> {
    let directory = Path::new(&config.directory);
    fs::create_dir_all(directory)
        .with_context(|| format!("创建日志目录失败, path={}", directory.display()))?;
    let removed = cleanup_expired_logs(
        directory,
        &config.file_prefix,
        Local::now().date_naive(),
        config.retention_days,
    )?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(directory)
        .with_context(|| format!("创建滚动日志失败, path={}", directory.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("日志级别无效, level={}", config.level))?;
    let file_layer = fmt::Layer::default()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let console_layer = config.console.then(|| {
        fmt::Layer::default()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .event_format(ConsoleFormatter)
            .with_filter(EnvFilter::from_default_env())
    });

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("全局日志订阅器已初始化")?;
    LOG_GUARD.set(guard).ok();

    tracing::info!(
        "日志系统已启动, directory={}, removed={}",
        config.directory,
        removed
    );
    Ok(())
}

/// 把解码器的逐单元日志转发为 tracing 事件
///
/// 返回值可直接交给 `DecoderConfig::with_log_callback`.
pub fn tracing_log_callback() -> impl Fn(&str) + Send + Sync + 'static {
    |text: &str| {
        let text = text.trim_end();
        if text.contains("error:") {
            tracing::warn!(target: UNIT_LOG_TARGET, "\n{}", text);
        } else {
            tracing::debug!(target: UNIT_LOG_TARGET, "\n{}", text);
        }
    }
}

pub(crate) fn build_current_log_path(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}

/// 删除早于保留期限的日志文件, 返回删除的数量
pub(crate) fn cleanup_expired_logs(
    directory: &Path,
    prefix: &str,
    today: NaiveDate,
    retention_days: i64,
) -> Result<usize> {
    let cutoff = today - ChronoDuration::days(retention_days);
    let mut removed = 0;
    for entry in fs::read_dir(directory)
        .with_context(|| format!("读取日志目录失败, path={}", directory.display()))?
    {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(date) = parse_log_name(&file_name, prefix) else {
            continue;
        };
        if date < cutoff {
            fs::remove_file(entry.path())
                .with_context(|| format!("删除过期日志失败, file={}", file_name))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn parse_log_name(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date_part = file_name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    if date_part.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        let meta = event.metadata();
        write!(
            writer,
            "[{:02}:{:02}:{:02}.{:03}] ",
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis()
        )?;
        let color = match *meta.level() {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        };
        write!(
            writer,
            "{}{:5}\x1b[0m {} > ",
            color,
            meta.level().to_string(),
            meta.target()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        write!(
            writer,
            "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] {:5} {} > ",
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis(),
            event.metadata().level().to_string(),
            event.metadata().target()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        match NaiveDate::from_ymd_opt(y, m, d) {
            Some(date) => date,
            None => panic!("测试日期初始化失败"),
        }
    }

    #[test]
    fn test_build_current_log_path() {
        let path = build_current_log_path(Path::new("logs"), "avc", date(2026, 2, 6));
        assert_eq!(path, PathBuf::from("logs/avc.2026-02-06.log"));
    }

    #[test]
    fn test_parse_log_name() {
        assert_eq!(parse_log_name("avc.2026-02-06.log", "avc"), Some(date(2026, 2, 6)));
        assert!(parse_log_name("avc.log", "avc").is_none());
        assert!(parse_log_name("other.2026-02-06.log", "avc").is_none());
        assert!(parse_log_name("avc.2026-2-6.log", "avc").is_none());
    }

    #[test]
    fn test_cleanup_removes_only_expired_files() {
        let temp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let dir = temp_dir.path();
        let today = date(2026, 3, 10);
        for day in [date(2026, 3, 1), date(2026, 3, 5), today] {
            let path = build_current_log_path(dir, "avc", day);
            if let Err(err) = fs::write(&path, b"x") {
                panic!("写入测试日志失败: {}", err);
            }
        }
        let unrelated = dir.join("notes.txt");
        if let Err(err) = fs::write(&unrelated, b"x") {
            panic!("写入无关文件失败: {}", err);
        }

        let removed = cleanup_expired_logs(dir, "avc", today, 7);
        assert_eq!(removed.ok(), Some(1), "只有 3 月 1 日的日志过期");
        assert!(!build_current_log_path(dir, "avc", date(2026, 3, 1)).exists());
        assert!(build_current_log_path(dir, "avc", date(2026, 3, 5)).exists());
        assert!(unrelated.exists(), "无关文件不应被删除");
    }
}
