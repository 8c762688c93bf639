//! 以合成码流驱动解码器的测试.
//!
//! 码流由 [`helpers`] 中的构造函数生成: I 切片只含 I_PCM 宏块, P 切片只含 P_Skip 宏块,
//! 切片数据由参考 CABAC 编码器写出.

mod helpers;

mod decode;
mod numbering;
mod reference;
