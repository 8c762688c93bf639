//! 比特流写入器.
//!
//! 按大端位序写入 (MSB first), 与 BitCache 对应. 用于参考 CABAC 编码器和测试码流构造.

/// 比特流写入器
///
/// # 示例
/// ```
/// use avc_core::bitwriter::BitWriter;
///
/// let mut bw = BitWriter::new();
/// bw.write_bits(0b1011, 4);
/// bw.write_ue(2); // 011
/// bw.write_trailing_bits();
/// assert_eq!(bw.finish(), vec![0b1011_0111]);
/// ```
pub struct BitWriter {
    /// 输出缓冲区
    data: Vec<u8>,
    /// 当前字节 (正在填充)
    current_byte: u8,
    /// 当前字节中已填充的位数 (0-7)
    bit_count: u8,
}

impl BitWriter {
    /// 创建新的比特流写入器
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            current_byte: 0,
            bit_count: 0,
        }
    }

    /// 获取已写入的总位数
    pub fn bits_written(&self) -> usize {
        self.data.len() * 8 + self.bit_count as usize
    }

    /// 是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.bit_count == 0
    }

    /// 写入 1 个位
    pub fn write_bit(&mut self, bit: u32) {
        self.current_byte = (self.current_byte << 1) | (bit & 1) as u8;
        self.bit_count += 1;
        if self.bit_count >= 8 {
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    /// 写入标志位
    pub fn write_flag(&mut self, flag: bool) {
        self.write_bit(u32::from(flag));
    }

    /// 写入 N 个位 (最多 32 位)
    ///
    /// 值的低 N 位被写入, 高位在前 (大端).
    pub fn write_bits(&mut self, value: u32, n: u32) {
        debug_assert!(n <= 32, "write_bits: n={} 超过 32 位", n);
        for i in (0..n.min(32)).rev() {
            self.write_bit(value >> i);
        }
    }

    /// 写入无符号 Exp-Golomb 编码
    pub fn write_ue(&mut self, value: u32) {
        let code = u64::from(value) + 1;
        let len = 64 - code.leading_zeros();
        self.write_bits(0, len - 1);
        if len > 32 {
            self.write_bits((code >> 32) as u32, len - 32);
            self.write_bits(code as u32, 32);
        } else {
            self.write_bits(code as u32, len);
        }
    }

    /// 写入有符号 Exp-Golomb 编码
    pub fn write_se(&mut self, value: i32) {
        let v = i64::from(value);
        let k = if v > 0 { 2 * v - 1 } else { -2 * v };
        self.write_ue(k as u32);
    }

    /// 写入 rbsp_trailing_bits (停止位 1 + 对齐 0)
    pub fn write_trailing_bits(&mut self) {
        self.write_bit(1);
        self.align_to_byte();
    }

    /// 对齐到字节边界 (用 0 填充)
    pub fn align_to_byte(&mut self) {
        if self.bit_count > 0 {
            let pad = 8 - self.bit_count;
            self.current_byte <<= pad;
            self.data.push(self.current_byte);
            self.current_byte = 0;
            self.bit_count = 0;
        }
    }

    /// 写入完整字节
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_count == 0 {
            self.data.extend_from_slice(bytes);
        } else {
            for &b in bytes {
                self.write_bits(u32::from(b), 8);
            }
        }
    }

    /// 完成写入, 返回字节数据
    ///
    /// 如果当前不在字节边界, 自动用 0 填充.
    pub fn finish(mut self) -> Vec<u8> {
        self.align_to_byte();
        self.data
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// 为 RBSP 插入防竞争字节, 得到可直接放入 NAL 单元的负载
///
/// 任意 `00 00` 之后若紧跟 `00..=03`, 在其前插入 `03`; 以 `00` 结尾时补 `03`.
pub fn insert_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0u32;
    for &b in rbsp {
        if zeros >= 2 && b <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    if out.last() == Some(&0x00) {
        out.push(0x03);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcache::BitCache;

    #[test]
    fn test_write_bits_cross_byte() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b101, 3);
        bw.write_bits(0b10001, 5);
        bw.write_bits(0xFF00FF00, 32);
        assert_eq!(bw.bits_written(), 40);
        let data = bw.finish();
        assert_eq!(data, vec![0b1011_0001, 0xFF, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn test_align_to_byte() {
        let mut bw = BitWriter::new();
        bw.write_bits(0b101, 3);
        bw.align_to_byte();
        assert!(bw.is_byte_aligned());
        bw.write_bits(0xFF, 8);
        assert_eq!(bw.finish(), vec![0b1010_0000, 0xFF]);
    }

    #[test]
    fn test_exp_golomb_read_back() {
        let values = [0u32, 1, 2, 3, 7, 8, 255, 65535, 1 << 20, u32::MAX - 1];
        let signed = [0i32, 1, -1, 2, -2, 100, -100, 32767, -32768];
        let mut bw = BitWriter::new();
        for &v in &values {
            bw.write_ue(v);
        }
        for &v in &signed {
            bw.write_se(v);
        }
        bw.write_trailing_bits();
        let data = bw.finish();

        let mut bc = BitCache::new(&data);
        for &v in &values {
            assert_eq!(bc.read_ue(u32::MAX), v, "ue 读回不一致, value={}", v);
        }
        for &v in &signed {
            assert_eq!(bc.read_se(i32::MIN, i32::MAX), v, "se 读回不一致, value={}", v);
        }
        assert!(!bc.more_rbsp_data());
    }

    #[test]
    fn test_emulation_prevention() {
        let rbsp = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];
        let nal = insert_emulation_prevention(&rbsp);
        assert_eq!(
            nal,
            vec![
                0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x04, 0x00,
                0x03
            ]
        );

        let mut bc = BitCache::new(&nal);
        for &b in &rbsp {
            assert_eq!(bc.read_bits(8), u32::from(b));
        }
    }
}
