pub mod time;

mod mutex;

pub use mutex::{Mutex, MutexGuard};
