pub mod discovery;
pub mod executor;
pub mod finalizer;
pub mod intent;
pub mod retry;
pub mod scheduler;
