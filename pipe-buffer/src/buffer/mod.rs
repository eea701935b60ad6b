// 抓包流中继系统 - 管道缓冲
//
// 上游FIFO → SourceReader → SharedRing → SinkWriter → 下游FIFO
//
// 两个任务在进程生命周期内常驻，彼此只通过环形缓冲区交互。
// 下游读者可以随时接入或离开，上游抓包进程始终有人在读。

pub mod reader;
pub mod writer;

pub use reader::SourceReader;
pub use writer::SinkWriter;
