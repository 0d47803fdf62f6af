pub mod lock;
pub mod store;
pub mod stream;

pub use lock::{EtcdLock, Locker};
pub use store::EtcdStore;
pub use stream::{stream, StreamOptions};
