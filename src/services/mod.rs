pub mod backpressure;
pub mod cancellation;
pub mod credentials;
pub mod events;
pub mod execution_service;
pub mod leader;
pub mod rate_limit;
pub mod task_queue;
