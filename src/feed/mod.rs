// Market data: tick queue, candle aggregation and candle history
pub mod aggregator;
pub mod candle_buffer;
pub mod tick_queue;

pub use aggregator::{CandleAggregator, ClosedCandle, FeedStats};
pub use candle_buffer::CandleBuffer;
pub use tick_queue::TickQueue;
