//! File transfer over the data channel: text control frames, the chunk
//! streamer, upload bookkeeping and reassembly on the receiving side.

pub mod frame;
pub mod receiver;
pub mod sender;
pub mod uploads;
