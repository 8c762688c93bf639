//! 统一错误类型定义.
//!
//! 解码控制平面对调用方只暴露四类错误, 另加一个不应出现的内部错误.

use thiserror::Error;

/// 解码器统一错误类型
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AvcError {
    /// 码流语义值越界或熵编码数据损坏, 仅影响当前单元
    #[error("码流错误: {0}")]
    MalformedBitstream(String),

    /// 实现有意不支持的语法, 当前单元被跳过
    #[error("不支持的特性: {0}")]
    UnsupportedFeature(String),

    /// 图像池或输出队列压力, 调用方需先取帧再重试
    #[error("资源耗尽: {0}")]
    ResourceExhausted(String),

    /// 调用方违反接口约定, 状态未被修改
    #[error("非法调用: {0}")]
    InvalidUsage(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl AvcError {
    /// 是否为可恢复的单元级错误
    ///
    /// 码流错误与不支持的特性只影响当前单元, 后续单元可继续送入.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::MalformedBitstream(_) | Self::UnsupportedFeature(_)
        )
    }

    /// 是否需要调用方先取帧再重试
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// 解码器统一 Result 类型
pub type AvcResult<T> = Result<T, AvcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = AvcError::MalformedBitstream("H264: slice_type 超出范围, value=12".into());
        assert!(err.is_soft());
        assert!(!err.is_backpressure());
        assert!(err.to_string().contains("slice_type"));

        let err = AvcError::ResourceExhausted("H264: 图像池已满".into());
        assert!(err.is_backpressure());
        assert!(!err.is_soft());

        assert!(!AvcError::InvalidUsage("H264: 空单元".into()).is_soft());
    }
}
