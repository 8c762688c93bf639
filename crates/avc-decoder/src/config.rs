//! 解码器配置.

use std::fmt;
use std::sync::Arc;

use avc_core::{AvcError, AvcResult};

use crate::picture::{HeapAllocator, PlaneAllocator};
use crate::scheduler::MAX_TASKS;

/// 线程数环境变量
pub const ENV_THREADS: &str = "AVC_THREADS";
/// DPB 缓冲深度环境变量
pub const ENV_MAX_FRAME_BUFFERING: &str = "AVC_MAX_FRAME_BUFFERING";

/// 自动线程数的上限
const MAX_AUTO_THREADS: usize = 16;

/// 逐单元日志回调
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 解码器配置
#[derive(Clone, Default)]
pub struct DecoderConfig {
    /// 工作线程数, `None` 为逻辑核数 (上限 16), `Some(0)` 为同步解码
    pub threads: Option<usize>,
    /// 覆盖码流声明的 max_dec_frame_buffering
    pub max_frame_buffering: Option<u32>,
    /// 每个编码单元解析后收到一段文本日志
    pub log_callback: Option<LogCallback>,
    /// 采样平面分配器, 默认使用全局堆
    pub allocator: Option<Arc<dyn PlaneAllocator>>,
}

impl DecoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置工作线程数
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// 同步解码 (不创建工作线程)
    pub fn synchronous(self) -> Self {
        self.with_threads(0)
    }

    pub fn with_max_frame_buffering(mut self, frames: u32) -> Self {
        self.max_frame_buffering = Some(frames);
        self
    }

    pub fn with_log_callback(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn PlaneAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// 以环境变量覆盖默认配置
    ///
    /// `AVC_THREADS` 与 `AVC_MAX_FRAME_BUFFERING` 必须是非负整数.
    pub fn from_env() -> AvcResult<Self> {
        let mut config = Self::default();
        if let Some(threads) = read_env(ENV_THREADS)? {
            config.threads = Some(threads as usize);
        }
        if let Some(frames) = read_env(ENV_MAX_FRAME_BUFFERING)? {
            config.max_frame_buffering = Some(frames);
        }
        Ok(config)
    }

    /// 实际使用的工作线程数
    pub fn worker_count(&self) -> usize {
        match self.threads {
            Some(n) => n.min(MAX_TASKS),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(MAX_AUTO_THREADS),
        }
    }

    /// 实际使用的分配器
    pub fn plane_allocator(&self) -> Arc<dyn PlaneAllocator> {
        self.allocator
            .clone()
            .unwrap_or_else(|| Arc::new(HeapAllocator))
    }

    /// 参数检查
    pub fn validate(&self) -> AvcResult<()> {
        if let Some(frames) = self.max_frame_buffering {
            if frames > 16 {
                return Err(AvcError::InvalidUsage(format!(
                    "H264: max_frame_buffering 超出范围, value={}",
                    frames
                )));
            }
        }
        Ok(())
    }
}

fn read_env(name: &str) -> AvcResult<Option<u32>> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<u32>().map(Some).map_err(|_| {
            AvcError::InvalidUsage(format!("H264: 环境变量 {} 不是整数, value={}", name, value))
        }),
        Err(_) => Ok(None),
    }
}

impl fmt::Debug for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderConfig")
            .field("threads", &self.threads)
            .field("max_frame_buffering", &self.max_frame_buffering)
            .field("log_callback", &self.log_callback.is_some())
            .field("allocator", &self.allocator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_worker_count() {
        let config = DecoderConfig::new()
            .synchronous()
            .with_max_frame_buffering(3)
            .with_log_callback(|_| {});
        assert_eq!(config.worker_count(), 0);
        assert_eq!(config.max_frame_buffering, Some(3));
        assert!(config.log_callback.is_some());
        assert!(format!("{:?}", config).contains("log_callback: true"));

        let auto = DecoderConfig::default();
        let n = auto.worker_count();
        assert!((1..=MAX_AUTO_THREADS).contains(&n), "自动线程数应在 1..=16, 实际 {}", n);
        assert_eq!(DecoderConfig::new().with_threads(64).worker_count(), MAX_TASKS);
    }

    #[test]
    fn test_validate_rejects_deep_buffering() {
        let config = DecoderConfig::new().with_max_frame_buffering(17);
        assert!(matches!(config.validate(), Err(AvcError::InvalidUsage(_))));
        assert!(DecoderConfig::new().validate().is_ok());
    }
}
