pub mod clusterdata;
pub mod stolonctl;

pub use clusterdata::{Clusterdata, Db};
pub use stolonctl::{KeeperControl, Stolonctl};
