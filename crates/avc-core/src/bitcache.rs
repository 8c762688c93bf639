//! 双字移位寄存器比特读取器.
//!
//! 面向 H.264 NAL 负载: 读取时即时去除防竞争字节 (`00 00 03`), 遇到真实起始码
//! (`00 00 0x`, x <= 2) 即视为数据结束, 之后只返回 0 比特.
//!
//! 内部由两个 64 位缓存组成:
//! - `msb`: 全部为有效比特
//! - `lsb`: 最低位的 1 为哨兵, 哨兵之上为有效比特
//!
//! 哨兵移出 `lsb` 后, 立即从字节源补充下一个 64 位字.
//! 所有读取都不会失败, 越过数据末尾返回确定的 0 值, 数据结束的判定交给调用方.

/// 比特读取位置快照, 用于在其他线程上以同一数据恢复读取器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitCachePos {
    pos: usize,
    end: usize,
    zeros: u8,
    msb: u64,
    lsb: u64,
    consumed: u64,
}

/// 双字缓存比特读取器
///
/// # 示例
/// ```
/// use avc_core::bitcache::BitCache;
///
/// // 00 00 03 01 中的 03 为防竞争字节
/// let data = [0b1010_0000, 0x00, 0x00, 0x03, 0x01];
/// let mut bc = BitCache::new(&data);
/// assert_eq!(bc.read_bits(3), 0b101);
/// assert_eq!(bc.read_bits(5), 0);
/// assert_eq!(bc.read_bits(24), 0x000001);
/// ```
#[derive(Clone)]
pub struct BitCache<'a> {
    data: &'a [u8],
    /// 下一个待装载字节
    pos: usize,
    /// 数据结束位置 (遇到起始码时提前)
    end: usize,
    /// 已连续输出的 0 字节数
    zeros: u8,
    msb: u64,
    lsb: u64,
    /// 已消耗的 (去除防竞争字节后的) 比特数
    consumed: u64,
}

impl<'a> BitCache<'a> {
    /// 在 RBSP 字节上创建读取器 (不含 NAL 头部字节亦可)
    pub fn new(data: &'a [u8]) -> Self {
        let mut bc = Self {
            data,
            pos: 0,
            end: data.len(),
            zeros: 0,
            msb: 0,
            lsb: 0,
            consumed: 0,
        };
        let first = u64::from(bc.next_byte());
        bc.msb = first << 56 | 1 << 55;
        bc.refill();
        bc
    }

    /// 以快照恢复读取器, `data` 必须与创建快照时相同
    pub fn resume(data: &'a [u8], at: BitCachePos) -> Self {
        Self {
            data,
            pos: at.pos.min(data.len()),
            end: at.end.min(data.len()),
            zeros: at.zeros,
            msb: at.msb,
            lsb: at.lsb,
            consumed: at.consumed,
        }
    }

    /// 获取当前位置快照
    pub fn position(&self) -> BitCachePos {
        BitCachePos {
            pos: self.pos,
            end: self.end,
            zeros: self.zeros,
            msb: self.msb,
            lsb: self.lsb,
            consumed: self.consumed,
        }
    }

    /// 已消耗比特数 (去除防竞争字节之后的计数)
    pub fn bits_read(&self) -> u64 {
        self.consumed
    }

    // ============================================================
    // 字节源
    // ============================================================

    /// 取下一个去除防竞争字节后的字节, 越过末尾返回 0
    fn next_byte(&mut self) -> u8 {
        loop {
            if self.pos >= self.end {
                return 0;
            }
            let b = self.data[self.pos];
            if b == 0x03 && self.zeros >= 2 {
                self.pos += 1;
                self.zeros = 0;
                continue;
            }
            if b == 0x00 {
                // 00 00 0x (x <= 2) 为起始码, 从此处截断
                if self.pos + 2 < self.end
                    && self.data[self.pos + 1] == 0x00
                    && self.data[self.pos + 2] <= 0x02
                {
                    self.end = self.pos;
                    return 0;
                }
                self.zeros = self.zeros.saturating_add(1);
            } else {
                self.zeros = 0;
            }
            self.pos += 1;
            return b;
        }
    }

    /// 哨兵已进入 `msb`, 用下一个 64 位字补满两个缓存
    fn refill(&mut self) {
        let mut word = 0u64;
        for _ in 0..8 {
            word = word << 8 | u64::from(self.next_byte());
        }
        let t = self.msb.trailing_zeros().min(63);
        self.msb = (self.msb ^ 1 << t) | word >> (63 - t);
        self.lsb = (word << 1 | 1) << t;
    }

    /// 丢弃 `n` 个比特 (n <= 32)
    #[inline]
    fn shift(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        self.msb = self.msb << n | self.lsb >> (64 - n);
        self.lsb <<= n;
        self.consumed += u64::from(n);
        if self.lsb == 0 {
            self.refill();
        }
    }

    // ============================================================
    // 读取接口
    // ============================================================

    /// 读取 N 个比特 (0..=32), 高位在前
    #[inline]
    pub fn read_bits(&mut self, n: u32) -> u32 {
        let n = n.min(32);
        if n == 0 {
            return 0;
        }
        let ret = (self.msb >> (64 - n)) as u32;
        self.shift(n);
        ret
    }

    /// 读取 1 个比特
    #[inline]
    pub fn read_bit(&mut self) -> u32 {
        self.read_bits(1)
    }

    /// 读取 1 个比特作为标志
    #[inline]
    pub fn read_flag(&mut self) -> bool {
        self.read_bits(1) == 1
    }

    /// 跳过任意数量的比特
    pub fn skip_bits(&mut self, mut n: u64) {
        while n > 0 {
            let step = n.min(32) as u32;
            self.shift(step);
            n -= u64::from(step);
        }
    }

    /// 读取无符号 Exp-Golomb 值, 结果钳制到 `upper`
    ///
    /// 前导 0 超过 31 个视为损坏数据, 结果同样被钳制.
    #[inline]
    pub fn read_ue(&mut self, upper: u32) -> u32 {
        let lz = (self.msb | 1 << 32).leading_zeros();
        self.shift(lz);
        let code = self.read_bits(lz + 1);
        code.wrapping_sub(1).min(upper)
    }

    /// 读取有符号 Exp-Golomb 值, 结果钳制到 `[lower, upper]`
    #[inline]
    pub fn read_se(&mut self, lower: i32, upper: i32) -> i32 {
        let k = i64::from(self.read_ue(u32::MAX));
        let v = if k & 1 == 1 { (k + 1) >> 1 } else { -(k >> 1) };
        v.clamp(i64::from(lower), i64::from(upper)) as i32
    }

    /// 缓存中已装载但未消耗的比特数
    fn cached_bits(&self) -> u32 {
        127 - self.lsb.trailing_zeros()
    }

    /// 跳到字节边界, 返回被跳过的比特值
    pub fn align_to_byte(&mut self) -> u32 {
        let n = self.cached_bits() & 7;
        self.read_bits(n)
    }

    /// 是否位于字节边界
    pub fn is_byte_aligned(&self) -> bool {
        self.cached_bits() & 7 == 0
    }

    /// 当前位置之后是否仍有任意非 0 比特
    pub fn has_trailing_data(&self) -> bool {
        if self.msb != 0 || self.lsb & self.lsb.wrapping_sub(1) != 0 {
            return true;
        }
        let mut probe = self.clone();
        while probe.pos < probe.end {
            if probe.next_byte() != 0 {
                return true;
            }
        }
        false
    }

    /// `more_rbsp_data()`: 停止位之前是否还有语法数据
    pub fn more_rbsp_data(&self) -> bool {
        let mut probe = self.clone();
        probe.shift(1);
        probe.has_trailing_data()
    }

    /// 数据结束于起始码时, 返回起始码在源缓冲区中的偏移
    pub fn truncated_at(&self) -> Option<usize> {
        (self.end < self.data.len()).then_some(self.end)
    }
}
