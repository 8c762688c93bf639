//! 参考图像列表构造 (8.2.4).
//!
//! 初始顺序:
//! - P 切片: 短期参考按 FrameNum 降序, 然后长期参考按 LongTermFrameIdx 升序
//! - B 切片 L0: POC 小于当前图像的短期参考 (降序), 大于当前的 (升序), 然后长期参考
//! - B 切片 L1: 前两段交换
//!
//! 列表元素为图像池槽位. `None` 表示该索引没有可用图像, 引用它的宏块按缺失参考处理.

use log::{debug, warn};

use super::{ReferenceSet, iter_bits};

/// ref_pic_list_modification 操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefPicListMod {
    /// modification_of_pic_nums_idc = 0
    ShortTermSub { abs_diff_pic_num_minus1: u32 },
    /// modification_of_pic_nums_idc = 1
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    /// modification_of_pic_nums_idc = 2
    LongTerm { long_term_pic_num: u32 },
}

/// 构造列表所需的切片参数
#[derive(Debug, Clone, Copy)]
pub struct ListParams<'a> {
    /// 是否为 B 切片 (按 POC 排序并构造 L1)
    pub bipred: bool,
    /// 当前图像的绝对 FrameNum
    pub frame_num: i32,
    /// 当前图像的 PicOrderCnt
    pub poc: i32,
    /// log2(MaxFrameNum)
    pub log2_max_frame_num: u32,
    /// num_ref_idx_lX_active
    pub num_active: [u32; 2],
    /// 每个列表的修改操作
    pub mods: [&'a [RefPicListMod]; 2],
}

/// 一个切片的两个参考列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefPicLists {
    pub l0: Vec<Option<usize>>,
    pub l1: Vec<Option<usize>>,
}

impl RefPicLists {
    /// 按列表号取引用
    pub fn list(&self, list: usize) -> &[Option<usize>] {
        if list == 0 { &self.l0 } else { &self.l1 }
    }

    /// 取 `RefPicListX[ref_idx]` 对应的槽位
    pub fn slot(&self, list: usize, ref_idx: usize) -> Option<usize> {
        self.list(list).get(ref_idx).copied().flatten()
    }

    /// 槽位到 RefPicList0 中最小下标的映射
    pub fn map_col_to_list0(&self) -> [Option<u8>; 32] {
        let mut map = [None; 32];
        for (idx, slot) in self.l0.iter().enumerate().rev() {
            if let Some(slot) = slot {
                map[slot % 32] = Some(idx as u8);
            }
        }
        map
    }

    /// 列表中出现的全部槽位, 作为任务依赖掩码
    pub fn dependency_mask(&self) -> u32 {
        self.l0
            .iter()
            .chain(self.l1.iter())
            .flatten()
            .fold(0u32, |mask, &slot| mask | 1 << (slot % 32))
    }
}

/// 由参考集合快照构造当前切片的参考列表
pub fn build_ref_pic_lists(refs: &ReferenceSet, params: &ListParams<'_>) -> RefPicLists {
    let (initial_l0, initial_l1) = initial_lists(refs, params);

    let mut lists = RefPicLists::default();
    let lists_used = if params.bipred { 2 } else { 1 };
    for l in 0..lists_used {
        let initial = if l == 0 { &initial_l0 } else { &initial_l1 };
        let num_active = params.num_active[l].min(32) as usize;
        let mut list: Vec<Option<usize>> = initial.iter().copied().map(Some).collect();
        list.resize(num_active.max(list.len()), None);
        apply_modifications(refs, params, l, &mut list);
        list.truncate(num_active);
        if let Some(missing) = list.iter().position(Option::is_none) {
            debug!(
                "H264: RefPicList{} 不完整, first_missing={}, active={}",
                l, missing, num_active
            );
        }
        if l == 0 {
            lists.l0 = list;
        } else {
            lists.l1 = list;
        }
    }
    lists
}

fn initial_lists(refs: &ReferenceSet, params: &ListParams<'_>) -> (Vec<usize>, Vec<usize>) {
    // 键值分段: [0, 0x10000) 位于当前图像之前, [0x10000, 0x20000) 之后, 之上为长期参考
    let mut keyed: Vec<(i64, usize)> = Vec::with_capacity(32);
    for slot in iter_bits(refs.short_term_only()) {
        let entry = refs.entry(slot);
        let diff = if params.bipred {
            i64::from(entry.poc()) - i64::from(params.poc)
        } else {
            i64::from(entry.frame_num) - i64::from(params.frame_num)
        };
        let key = if diff <= 0 { -diff } else { 0x1_0000 + diff };
        keyed.push((key.min(0x1_FFFF), slot));
    }
    for slot in iter_bits(refs.long_term_only()) {
        keyed.push((0x2_0000 + i64::from(refs.entry(slot).long_term_idx), slot));
    }
    keyed.sort_unstable();

    let before = keyed.iter().take_while(|(k, _)| *k < 0x1_0000).count();
    let after = keyed[before..]
        .iter()
        .take_while(|(k, _)| *k < 0x2_0000)
        .count();
    let l0: Vec<usize> = keyed.iter().map(|&(_, slot)| slot).collect();

    if !params.bipred {
        return (l0, Vec::new());
    }

    let mut l1 = Vec::with_capacity(l0.len());
    l1.extend_from_slice(&l0[before..before + after]);
    l1.extend_from_slice(&l0[..before]);
    l1.extend_from_slice(&l0[before + after..]);
    if l1.len() > 1 && l1 == l0 {
        l1.swap(0, 1);
    }
    (l0, l1)
}

fn apply_modifications(
    refs: &ReferenceSet,
    params: &ListParams<'_>,
    l: usize,
    list: &mut Vec<Option<usize>>,
) {
    let mask = (1u32 << params.log2_max_frame_num.min(16)) - 1;
    let mut pic_num_pred = params.frame_num as u32;
    for (ref_idx, op) in params.mods[l].iter().enumerate() {
        if ref_idx >= list.len() {
            warn!(
                "H264: ref_pic_list_modification 超出列表长度, list={}, ref_idx={}",
                l, ref_idx
            );
            break;
        }
        let pic = match *op {
            RefPicListMod::ShortTermSub {
                abs_diff_pic_num_minus1,
            } => {
                pic_num_pred = pic_num_pred.wrapping_sub(abs_diff_pic_num_minus1.wrapping_add(1));
                find_short_term_masked(refs, pic_num_pred, mask)
            }
            RefPicListMod::ShortTermAdd {
                abs_diff_pic_num_minus1,
            } => {
                pic_num_pred = pic_num_pred.wrapping_add(abs_diff_pic_num_minus1.wrapping_add(1));
                find_short_term_masked(refs, pic_num_pred, mask)
            }
            RefPicListMod::LongTerm { long_term_pic_num } => refs.find_long_term(long_term_pic_num),
        };
        if pic.is_none() {
            warn!(
                "H264: 参考列表修改的目标图像不存在, list={}, ref_idx={}, op={:?}",
                l, ref_idx, op
            );
        }

        // 插入到 ref_idx, 其后同一图像的重复项被移除
        let mut carry = pic;
        let mut idx = ref_idx;
        loop {
            let displaced = std::mem::replace(&mut list[idx], carry);
            carry = displaced;
            idx += 1;
            if idx >= list.len() || (pic.is_some() && carry == pic) {
                break;
            }
        }
    }
}

fn find_short_term_masked(refs: &ReferenceSet, pic_num: u32, mask: u32) -> Option<usize> {
    iter_bits(refs.short_term_only())
        .find(|&slot| (refs.entry(slot).frame_num as u32 ^ pic_num) & mask == 0)
}

#[cfg(test)]
mod tests {
    use super::super::RefEntry;
    use super::*;

    fn short(refs: &mut ReferenceSet, slot: usize, frame_num: i32, poc: i32) {
        refs.insert_short_term(
            slot,
            RefEntry {
                frame_num,
                long_term_idx: 0,
                top_poc: poc,
                bottom_poc: poc,
            },
        );
    }

    fn params(bipred: bool, frame_num: i32, poc: i32, num_active: [u32; 2]) -> ListParams<'static> {
        ListParams {
            bipred,
            frame_num,
            poc,
            log2_max_frame_num: 4,
            num_active,
            mods: [&[], &[]],
        }
    }

    #[test]
    fn test_p_list_orders_by_frame_num() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 3, 1, 2);
        short(&mut refs, 0, 3, 6);
        short(&mut refs, 5, 2, 4);
        refs.insert_long_term(
            1,
            RefEntry {
                frame_num: 0,
                ..Default::default()
            },
            0,
        );
        let lists = build_ref_pic_lists(&refs, &params(false, 4, 8, [5, 0]));
        assert_eq!(lists.l0, vec![Some(0), Some(5), Some(3), Some(1), None]);
        assert!(lists.l1.is_empty());
        assert_eq!(lists.dependency_mask(), 0b10_1011);
        let map = lists.map_col_to_list0();
        assert_eq!(map[5], Some(1));
        assert_eq!(map[1], Some(3));
        assert_eq!(map[2], None);
    }

    #[test]
    fn test_b_lists_split_by_poc() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 0, 0, 0);
        short(&mut refs, 1, 1, 8);
        short(&mut refs, 2, 2, 4);
        short(&mut refs, 3, 3, 12);
        let lists = build_ref_pic_lists(&refs, &params(true, 4, 6, [4, 4]));
        assert_eq!(lists.l0, vec![Some(2), Some(0), Some(1), Some(3)]);
        assert_eq!(lists.l1, vec![Some(1), Some(3), Some(2), Some(0)]);
    }

    #[test]
    fn test_identical_l1_swaps_first_two() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 0, 0, 0);
        short(&mut refs, 1, 1, 4);
        let lists = build_ref_pic_lists(&refs, &params(true, 2, 8, [2, 2]));
        assert_eq!(lists.l0, vec![Some(1), Some(0)]);
        assert_eq!(lists.l1, vec![Some(0), Some(1)], "L1 与 L0 相同时应交换前两项");
    }

    #[test]
    fn test_non_existing_frames_are_excluded() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 0, 1, 2);
        refs.insert_non_existing(
            1,
            RefEntry {
                frame_num: 2,
                ..Default::default()
            },
        );
        let lists = build_ref_pic_lists(&refs, &params(false, 3, 6, [2, 0]));
        assert_eq!(lists.l0, vec![Some(0), None]);
    }

    #[test]
    fn test_modification_moves_picture_to_front() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 0, 1, 2);
        short(&mut refs, 1, 2, 4);
        short(&mut refs, 2, 3, 6);
        // picNum = 4 - 3 = 1 -> 槽位 0
        let mods = [RefPicListMod::ShortTermSub {
            abs_diff_pic_num_minus1: 2,
        }];
        let p = ListParams {
            mods: [&mods, &[]],
            ..params(false, 4, 8, [3, 0])
        };
        let lists = build_ref_pic_lists(&refs, &p);
        assert_eq!(lists.l0, vec![Some(0), Some(2), Some(1)], "重复项应被移除");
    }

    #[test]
    fn test_modification_wraps_frame_num() {
        let mut refs = ReferenceSet::new();
        // 绝对 FrameNum 15 与当前 17 之间跨越 MaxFrameNum=16
        short(&mut refs, 4, 15, 30);
        short(&mut refs, 5, 16, 32);
        let mods = [RefPicListMod::ShortTermSub {
            abs_diff_pic_num_minus1: 1,
        }];
        let p = ListParams {
            mods: [&mods, &[]],
            ..params(false, 17, 34, [2, 0])
        };
        let lists = build_ref_pic_lists(&refs, &p);
        assert_eq!(lists.l0, vec![Some(4), Some(5)]);
    }

    #[test]
    fn test_missing_modification_target_is_none() {
        let mut refs = ReferenceSet::new();
        short(&mut refs, 0, 1, 2);
        let mods = [RefPicListMod::LongTerm {
            long_term_pic_num: 3,
        }];
        let p = ListParams {
            mods: [&mods, &[]],
            ..params(false, 2, 4, [2, 0])
        };
        let lists = build_ref_pic_lists(&refs, &p);
        assert_eq!(lists.l0, vec![None, Some(0)]);
    }

    #[test]
    fn test_lists_are_deterministic() {
        let mut refs = ReferenceSet::new();
        for (slot, fnum) in [(7usize, 3), (2, 5), (9, 1), (4, 4)] {
            short(&mut refs, slot, fnum, fnum * 2);
        }
        let p = params(true, 6, 7, [4, 4]);
        let first = build_ref_pic_lists(&refs, &p);
        for _ in 0..8 {
            assert_eq!(build_ref_pic_lists(&refs.clone(), &p), first);
        }
    }
}
