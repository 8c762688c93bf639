//! H.264 NAL (Network Abstraction Layer) 单元.
//!
//! # NAL 头部 (1 字节)
//! ```text
//! ┌─────────────────────────────────────┐
//! │ forbidden(1) | ref_idc(2) | type(5) │
//! └─────────────────────────────────────┘
//! ```
//!
//! 解码器只接受已经分隔好的单元, [`split_annex_b`] 仅作为测试与工具的便利函数.
//! 负载保留防竞争字节, 由 `BitCache` 在读取时去除.

use avc_core::{AvcError, AvcResult};
use bytes::Bytes;

/// NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NalUnitType {
    /// 非 IDR 图像切片
    Slice,
    /// 数据分区 A
    SliceDpa,
    /// 数据分区 B
    SliceDpb,
    /// 数据分区 C
    SliceDpc,
    /// IDR 图像切片
    SliceIdr,
    /// 增补增强信息
    Sei,
    /// 序列参数集
    Sps,
    /// 图像参数集
    Pps,
    /// 访问单元分隔符
    Aud,
    /// 序列结束
    EndOfSequence,
    /// 流结束
    EndOfStream,
    /// 填充数据
    FillerData,
    /// SPS 扩展
    SpsExtension,
    /// 前缀 NAL (SVC/MVC)
    Prefix,
    /// 子集 SPS (SVC/MVC)
    SubsetSps,
    /// 扩展切片 (SVC/MVC)
    SliceExtension,
    /// 未知类型
    Unknown(u8),
}

impl NalUnitType {
    /// 从 NAL 类型编号创建
    pub fn from_type_id(type_id: u8) -> Self {
        match type_id {
            1 => Self::Slice,
            2 => Self::SliceDpa,
            3 => Self::SliceDpb,
            4 => Self::SliceDpc,
            5 => Self::SliceIdr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            13 => Self::SpsExtension,
            14 => Self::Prefix,
            15 => Self::SubsetSps,
            20 => Self::SliceExtension,
            _ => Self::Unknown(type_id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::SliceDpa => 2,
            Self::SliceDpb => 3,
            Self::SliceDpc => 4,
            Self::SliceIdr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::Aud => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::SpsExtension => 13,
            Self::Prefix => 14,
            Self::SubsetSps => 15,
            Self::SliceExtension => 20,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否为 VCL (Video Coding Layer) NAL
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            Self::Slice
                | Self::SliceDpa
                | Self::SliceDpb
                | Self::SliceDpc
                | Self::SliceIdr
                | Self::SliceExtension
        )
    }

    /// 是否为 IDR 切片
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::SliceIdr)
    }
}

impl std::fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slice => write!(f, "Slice"),
            Self::SliceDpa => write!(f, "SliceDPA"),
            Self::SliceDpb => write!(f, "SliceDPB"),
            Self::SliceDpc => write!(f, "SliceDPC"),
            Self::SliceIdr => write!(f, "IDR"),
            Self::Sei => write!(f, "SEI"),
            Self::Sps => write!(f, "SPS"),
            Self::Pps => write!(f, "PPS"),
            Self::Aud => write!(f, "AUD"),
            Self::EndOfSequence => write!(f, "EndOfSeq"),
            Self::EndOfStream => write!(f, "EndOfStream"),
            Self::FillerData => write!(f, "Filler"),
            Self::SpsExtension => write!(f, "SPSExt"),
            Self::Prefix => write!(f, "Prefix"),
            Self::SubsetSps => write!(f, "SubsetSPS"),
            Self::SliceExtension => write!(f, "SliceExt"),
            Self::Unknown(id) => write!(f, "Unknown({id})"),
        }
    }
}

/// NAL 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    /// NAL 单元类型
    pub nal_type: NalUnitType,
    /// nal_ref_idc (0-3), 非 0 表示参考图像
    pub ref_idc: u8,
}

impl NalHeader {
    /// 直接构造头部
    pub fn new(nal_type: NalUnitType, ref_idc: u8) -> Self {
        Self {
            nal_type,
            ref_idc: ref_idc & 3,
        }
    }

    /// 解析头部字节
    pub fn parse(byte: u8) -> AvcResult<Self> {
        let forbidden = byte >> 7;
        if forbidden != 0 {
            return Err(AvcError::MalformedBitstream(format!(
                "H264: forbidden_zero_bit 非法, value={}",
                forbidden
            )));
        }
        Ok(Self {
            nal_type: NalUnitType::from_type_id(byte & 0x1F),
            ref_idc: (byte >> 5) & 0x03,
        })
    }

    /// 编码回头部字节
    pub fn to_byte(&self) -> u8 {
        (self.ref_idc & 3) << 5 | (self.nal_type.type_id() & 0x1F)
    }

    /// 是否为参考图像
    pub fn is_reference(&self) -> bool {
        self.ref_idc != 0
    }
}

/// 一个已分隔的编码单元: 头部加上未去除防竞争字节的负载
#[derive(Debug, Clone)]
pub struct CodedUnit {
    /// NAL 头部
    pub header: NalHeader,
    /// 头部之后的负载
    pub payload: Bytes,
}

impl CodedUnit {
    /// 由头部与负载构造
    pub fn new(header: NalHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// 从含头部字节的 NAL 数据解析
    pub fn parse(data: impl Into<Bytes>) -> AvcResult<Self> {
        let data: Bytes = data.into();
        let Some(&first) = data.first() else {
            return Err(AvcError::InvalidUsage("H264: NAL 单元数据为空".into()));
        };
        Ok(Self {
            header: NalHeader::parse(first)?,
            payload: data.slice(1..),
        })
    }

    /// 单元类型
    pub fn nal_type(&self) -> NalUnitType {
        self.header.nal_type
    }

    /// 是否为参考图像的切片
    pub fn is_reference(&self) -> bool {
        self.header.is_reference()
    }

    /// 是否为即时刷新 (IDR) 切片
    pub fn is_idr(&self) -> bool {
        self.header.nal_type.is_idr()
    }
}

/// 从 Annex B 字节流中分割出所有 NAL 单元
///
/// 支持 3 字节 (00 00 01) 和 4 字节 (00 00 00 01) 起始码, 负载与输入共享内存.
/// 头部非法的单元被跳过.
pub fn split_annex_b(data: impl Into<Bytes>) -> Vec<CodedUnit> {
    let data: Bytes = data.into();
    let starts = find_start_codes(&data);
    let mut units = Vec::with_capacity(starts.len());

    for (i, &(_, nal_start)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(data.len(), |&(next, _)| next);
        // 去除尾部的 0 字节 (trailing_zero_8bits)
        let mut nal_end = end;
        while nal_end > nal_start && data[nal_end - 1] == 0x00 {
            nal_end -= 1;
        }
        if nal_end <= nal_start {
            continue;
        }
        match CodedUnit::parse(data.slice(nal_start..nal_end)) {
            Ok(unit) => units.push(unit),
            Err(e) => log::debug!("H264: 跳过非法 NAL 单元, offset={}, err={}", nal_start, e),
        }
    }

    units
}

/// 查找所有起始码, 返回 (起始码位置, 负载起点)
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            out.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    out
}
