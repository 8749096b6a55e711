pub mod queue;
pub mod series;

pub use queue::memory::MemoryQueue;
pub use queue::redis::RedisQueue;
pub use queue::{QueueMetrics, ReadingQueue};
pub use series::memory::MemorySeriesStore;
pub use series::mongo::MongoSeriesStore;
pub use series::{InsertOutcome, SeriesRange, SeriesStore};
